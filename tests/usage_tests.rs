// Usage meter tests against the store. Requires DATABASE_URL.

mod common;

use common::*;
use uuid::Uuid;

use cortex_gateway::usage::UsageRecord;

fn record(request_id: Uuid, model: &str) -> UsageRecord {
    UsageRecord {
        request_id,
        api_key_id: None,
        user_id: None,
        org_id: None,
        model: model.to_string(),
        task: "generate".to_string(),
        endpoint: "/v1/chat/completions".to_string(),
        prompt_tokens: 3,
        completion_tokens: 5,
        latency_ms: 42,
        ttft_ms: None,
        status_code: 200,
    }
}

#[tokio::test]
async fn duplicate_request_ids_record_at_most_one_row() {
    let state = test_state().await;
    let model = format!("usage-model-{}", Uuid::new_v4());
    let request_id = Uuid::now_v7();

    state.usage.record(record(request_id, &model));
    state.usage.record(record(request_id, &model));

    tokio::time::sleep(std::time::Duration::from_millis(1600)).await;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage WHERE model = $1")
        .bind(&model)
        .fetch_one(&state.db)
        .await
        .unwrap();
    assert_eq!(count, 1);

    let total: i32 = sqlx::query_scalar("SELECT total_tokens FROM usage WHERE model = $1")
        .bind(&model)
        .fetch_one(&state.db)
        .await
        .unwrap();
    assert_eq!(total, 8, "total is derived from prompt + completion");
}

#[tokio::test]
async fn distinct_requests_each_record_one_row() {
    let state = test_state().await;
    let model = format!("usage-model-{}", Uuid::new_v4());

    state.usage.record(record(Uuid::now_v7(), &model));
    state.usage.record(record(Uuid::now_v7(), &model));

    tokio::time::sleep(std::time::Duration::from_millis(1600)).await;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage WHERE model = $1")
        .bind(&model)
        .fetch_one(&state.db)
        .await
        .unwrap();
    assert_eq!(count, 2);
}
