// End-to-end routing tests against mock upstream engines bound to
// ephemeral localhost ports. Requires DATABASE_URL.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::*;
use http_body_util::BodyExt;
use serde_json::{json, Value};

use cortex_gateway::lifecycle::{Engine, ModelTask};

async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// A minimal OpenAI-shaped engine: /health, /v1/models, and a canned
/// chat-completions response.
fn mock_engine(served: &str, chat_status: StatusCode, chat_body: Value) -> (Router, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let served = served.to_string();
    let hits_for_chat = hits.clone();
    let router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/v1/models",
            get(move || {
                let served = served.clone();
                async move { Json(json!({"object": "list", "data": [{"id": served}]})) }
            }),
        )
        .route(
            "/v1/chat/completions",
            post(move || {
                let body = chat_body.clone();
                let hits = hits_for_chat.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (chat_status, Json(body))
                }
            }),
        );
    (router, hits)
}

fn chat_ok_body(model: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": model,
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8}
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  S1: non-streaming chat success with usage metering
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn chat_success_relays_body_and_meters_usage() {
    let state = test_state().await;
    let served = format!("s1-model-{}", uuid::Uuid::new_v4());
    let (router, _) = mock_engine(&served, StatusCode::OK, chat_ok_body(&served));
    let url = spawn_upstream(router).await;
    state.registry.register(None, &served, &url, Engine::Vllm, ModelTask::Generate);

    let token = seed_key(&state, &["chat"], &[]).await;
    let response = send(
        &state,
        post_json_bearer(
            "/v1/chat/completions",
            &token,
            &json!({"model": served, "messages": [{"role": "user", "content": "hi"}]}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
    assert_eq!(body["usage"]["total_tokens"], 8);

    // The usage flusher batches on a 1s tick.
    tokio::time::sleep(std::time::Duration::from_millis(1600)).await;
    let row: Option<(i32, i32, i32)> = sqlx::query_as(
        "SELECT prompt_tokens, completion_tokens, total_tokens FROM usage WHERE model = $1",
    )
    .bind(&served)
    .fetch_optional(&state.db)
    .await
    .unwrap();
    let (prompt, completion, total) = row.expect("usage row written");
    assert_eq!((prompt, completion), (3, 5));
    assert_eq!(total, prompt + completion);
}

// ═══════════════════════════════════════════════════════════════════════════
//  S3: unknown model
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unknown_model_is_404_invalid_request() {
    let state = test_state().await;
    let token = seed_key(&state, &["chat"], &[]).await;
    let response = send(
        &state,
        post_json_bearer(
            "/v1/chat/completions",
            &token,
            &json!({"model": "nope", "messages": [{"role": "user", "content": "hi"}]}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let envelope = assert_error_envelope(response, "invalid_request_error").await;
    assert_eq!(envelope["error"]["message"], "model not found");
}

// ═══════════════════════════════════════════════════════════════════════════
//  Scope enforcement (property 1)
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn key_without_scope_is_403_with_scope_it_reaches_upstream() {
    let state = test_state().await;
    let served = format!("scope-model-{}", uuid::Uuid::new_v4());
    let (router, _) = mock_engine(&served, StatusCode::OK, chat_ok_body(&served));
    let url = spawn_upstream(router).await;
    state.registry.register(None, &served, &url, Engine::Vllm, ModelTask::Generate);

    let body = json!({"model": served, "messages": [{"role": "user", "content": "hi"}]});

    let wrong = seed_key(&state, &["embeddings"], &[]).await;
    let denied = send(&state, post_json_bearer("/v1/chat/completions", &wrong, &body)).await;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    assert_error_envelope(denied, "permission_error").await;

    let right = seed_key(&state, &["chat"], &[]).await;
    let allowed = send(&state, post_json_bearer("/v1/chat/completions", &right, &body)).await;
    assert_eq!(allowed.status(), StatusCode::OK);
}

// ═══════════════════════════════════════════════════════════════════════════
//  IP allowlist (property 2)
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn ip_allowlist_honors_forwarded_client_address() {
    let mut config = cortex_gateway::test_support::minimal_config();
    config.trusted_proxy_hops = 1;
    let state = test_state_with(config).await;
    let token = seed_key(&state, &["chat"], &["10.1.0.0/16"]).await;

    let request = |xff: &str| {
        axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .header("x-forwarded-for", xff)
            .body(Body::from(
                serde_json::to_vec(&json!({"model": "nope", "messages": []})).unwrap(),
            ))
            .unwrap()
    };

    // In-range source: auth passes, model lookup 404s.
    let inside = send(&state, request("10.1.2.3")).await;
    assert_eq!(inside.status(), StatusCode::NOT_FOUND);

    let outside = send(&state, request("9.9.9.9")).await;
    assert_eq!(outside.status(), StatusCode::UNAUTHORIZED);
    assert_error_envelope(outside, "authentication_error").await;
}

// ═══════════════════════════════════════════════════════════════════════════
//  S4: rate limiting
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn second_request_within_window_is_429_with_retry_after() {
    let mut config = cortex_gateway::test_support::minimal_config();
    config.rate_limit_rps = 1.0;
    config.rate_limit_burst = 1;
    let state = test_state_with(config).await;
    let token = seed_key(&state, &["chat"], &[]).await;
    let body = json!({"model": "nope", "messages": []});

    let first = send(&state, post_json_bearer("/v1/chat/completions", &token, &body)).await;
    assert_eq!(first.status(), StatusCode::NOT_FOUND, "first request is admitted");

    let second = send(&state, post_json_bearer("/v1/chat/completions", &token, &body)).await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = second
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(retry_after, 1, "one token at 1 rps refills in about a second");
    assert_error_envelope(second, "rate_limit_error").await;
}

// ═══════════════════════════════════════════════════════════════════════════
//  S5: engine-loading translation
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn llamacpp_loading_503_maps_to_model_loading() {
    let state = test_state().await;
    let served = format!("loading-model-{}", uuid::Uuid::new_v4());
    let (router, hits) = mock_engine(
        &served,
        StatusCode::SERVICE_UNAVAILABLE,
        json!({"error": {"message": "Loading model", "type": "unavailable_error"}}),
    );
    let url = spawn_upstream(router).await;
    state.registry.register(None, &served, &url, Engine::Llamacpp, ModelTask::Generate);

    let token = seed_key(&state, &["chat"], &[]).await;
    let response = send(
        &state,
        post_json_bearer(
            "/v1/chat/completions",
            &token,
            &json!({"model": served, "messages": [{"role": "user", "content": "hi"}]}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key("retry-after"));
    let envelope = assert_error_envelope(response, "service_unavailable").await;
    assert_eq!(envelope["error"]["code"], "model_loading");
    // Loading is pool-specific: no second upstream means exactly one hit.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn context_overflow_maps_to_context_length_exceeded() {
    let state = test_state().await;
    let served = format!("ctx-model-{}", uuid::Uuid::new_v4());
    let (router, _) = mock_engine(
        &served,
        StatusCode::BAD_REQUEST,
        json!({"error": {"message": "the prompt exceeds the available context size"}}),
    );
    let url = spawn_upstream(router).await;
    state.registry.register(None, &served, &url, Engine::Llamacpp, ModelTask::Generate);

    let token = seed_key(&state, &["chat"], &[]).await;
    let response = send(
        &state,
        post_json_bearer(
            "/v1/chat/completions",
            &token,
            &json!({"model": served, "messages": [{"role": "user", "content": "hi"}]}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let envelope = assert_error_envelope(response, "invalid_request_error").await;
    assert_eq!(envelope["error"]["code"], "context_length_exceeded");
}

// ═══════════════════════════════════════════════════════════════════════════
//  Retry before first byte (property 6)
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn connection_refused_retries_on_healthy_pool_peer() {
    let state = test_state().await;
    let served = format!("retry-model-{}", uuid::Uuid::new_v4());

    // A port that refuses connections: bind then drop the listener.
    let dead_url = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    };
    let (router, hits) = mock_engine(&served, StatusCode::OK, chat_ok_body(&served));
    let live_url = spawn_upstream(router).await;

    state.registry.register(None, &served, &dead_url, Engine::Vllm, ModelTask::Generate);
    state.registry.register(None, &served, &live_url, Engine::Vllm, ModelTask::Generate);

    let token = seed_key(&state, &["chat"], &[]).await;
    let body = json!({"model": served, "messages": [{"role": "user", "content": "hi"}]});
    // LRU alternates across the pool, so some attempts land on the dead
    // upstream first; every one of them must still come back 200.
    for _ in 0..4 {
        let response = send(&state, post_json_bearer("/v1/chat/completions", &token, &body)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

// ═══════════════════════════════════════════════════════════════════════════
//  S2: streaming with client disconnect
// ═══════════════════════════════════════════════════════════════════════════

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn sse_engine(served: &str, upstream_dropped: Arc<AtomicBool>) -> Router {
    let served = served.to_string();
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/v1/models",
            get(move || {
                let served = served.clone();
                async move { Json(json!({"data": [{"id": served}]})) }
            }),
        )
        .route(
            "/v1/chat/completions",
            post(move || {
                let flag = upstream_dropped.clone();
                async move {
                    let guard = DropFlag(flag);
                    let stream = async_stream::stream! {
                        let _guard = guard;
                        for i in 0..3 {
                            yield Ok::<Bytes, std::convert::Infallible>(Bytes::from(format!(
                                "data: {{\"choices\":[{{\"delta\":{{\"content\":\"t{i}\"}}}}]}}\n\n"
                            )));
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        }
                        // Hold the stream open until the client goes away.
                        std::future::pending::<()>().await;
                    };
                    Response::builder()
                        .header("content-type", "text/event-stream")
                        .body(Body::from_stream(stream))
                        .unwrap()
                        .into_response()
                }
            }),
        )
}

#[tokio::test]
async fn client_disconnect_cancels_upstream_and_releases_gate() {
    let state = test_state().await;
    let served = format!("sse-model-{}", uuid::Uuid::new_v4());
    let upstream_dropped = Arc::new(AtomicBool::new(false));
    let url = spawn_upstream(sse_engine(&served, upstream_dropped.clone())).await;
    state.registry.register(None, &served, &url, Engine::Llamacpp, ModelTask::Generate);

    let token = seed_key(&state, &["chat"], &[]).await;
    let response = send(
        &state,
        post_json_bearer(
            "/v1/chat/completions",
            &token,
            &json!({"model": served, "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    // Read one frame, then hang up mid-stream.
    let mut body = response.into_body();
    let frame = body.frame().await.expect("first frame").expect("frame ok");
    let chunk = frame.into_data().expect("data frame");
    assert!(String::from_utf8_lossy(&chunk).contains("t0"));
    assert_eq!(state.metrics.streams_open.load(Ordering::SeqCst), 1);
    drop(body);

    // Cancellation propagates to the upstream and the slot is released.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(upstream_dropped.load(Ordering::SeqCst), "upstream stream cancelled");
    assert_eq!(state.metrics.streams_open.load(Ordering::SeqCst), 0);

    // TTFT was observed for the stream.
    assert!(state.metrics.render(0).contains("cortex_ttft_seconds_count 1"));
}

#[tokio::test]
async fn stream_gate_bounds_concurrent_streams_per_key() {
    let mut config = cortex_gateway::test_support::minimal_config();
    config.max_concurrent_streams_per_id = 1;
    let state = test_state_with(config).await;
    let served = format!("gate-model-{}", uuid::Uuid::new_v4());
    let url = spawn_upstream(sse_engine(&served, Arc::new(AtomicBool::new(false)))).await;
    state.registry.register(None, &served, &url, Engine::Llamacpp, ModelTask::Generate);

    let token = seed_key(&state, &["chat"], &[]).await;
    let body = json!({"model": served, "stream": true, "messages": [{"role": "user", "content": "hi"}]});

    let first = send(&state, post_json_bearer("/v1/chat/completions", &token, &body)).await;
    assert_eq!(first.status(), StatusCode::OK);
    let held = first.into_body();

    let second = send(&state, post_json_bearer("/v1/chat/completions", &token, &body)).await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_error_envelope(second, "rate_limit_error").await;

    drop(held);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let third = send(&state, post_json_bearer("/v1/chat/completions", &token, &body)).await;
    assert_eq!(third.status(), StatusCode::OK);
}
