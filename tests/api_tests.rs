mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;

// ═══════════════════════════════════════════════════════════════════════════
//  GET /health
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn health_returns_200_with_fields() {
    let state = test_state().await;
    let response = send(&state, get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    // test_state() never marks ready, so status is "starting"
    assert_eq!(json["status"], "starting");
    assert_eq!(json["app"], "Cortex");
    assert!(json["uptime_seconds"].is_u64());
}

#[tokio::test]
async fn health_detailed_reports_store_health() {
    let state = test_state().await;
    let response = send(&state, get("/health/detailed")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["database_ok"], true);
    assert!(json["registry_entries"].is_u64());
    assert!(json["platform"].is_string());
}

#[tokio::test]
async fn every_response_carries_a_request_id() {
    let state = test_state().await;
    let response = send(&state, get("/health")).await;
    let header = response.headers().get("x-request-id");
    assert!(header.is_some());
    assert!(uuid::Uuid::parse_str(header.unwrap().to_str().unwrap()).is_ok());
}

// ═══════════════════════════════════════════════════════════════════════════
//  Error envelope shape
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn missing_credentials_is_authentication_error_envelope() {
    let state = test_state().await;
    let response = send(
        &state,
        post_json("/v1/chat/completions", &json!({"model": "m", "messages": []})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_error_envelope(response, "authentication_error").await;
}

#[tokio::test]
async fn admin_without_session_is_401_envelope() {
    let state = test_state().await;
    let response = send(&state, get("/admin/models")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_error_envelope(response, "authentication_error").await;
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let state = test_state().await;
    let response = send(&state, get("/api/nonexistent")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ═══════════════════════════════════════════════════════════════════════════
//  GET /v1/models and /v1/models/status
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn model_list_is_deterministic_across_calls() {
    let state = test_state().await;
    use cortex_gateway::lifecycle::{Engine, ModelTask};
    state
        .registry
        .register(None, "zeta", "http://127.0.0.1:1", Engine::Vllm, ModelTask::Generate);
    state
        .registry
        .register(None, "alpha", "http://127.0.0.1:2", Engine::Vllm, ModelTask::Generate);

    let token = seed_key(&state, &["chat"], &[]).await;
    let first = body_json(send(&state, get_bearer("/v1/models", &token)).await).await;
    let second = body_json(send(&state, get_bearer("/v1/models", &token)).await).await;
    assert_eq!(first, second);

    let ids: Vec<&str> = first["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["alpha", "zeta"]);
}

#[tokio::test]
async fn models_status_is_public_and_carries_health() {
    let state = test_state().await;
    use cortex_gateway::lifecycle::{Engine, ModelTask};
    state
        .registry
        .register(None, "m1", "http://127.0.0.1:9", Engine::Llamacpp, ModelTask::Generate);

    let response = send(&state, get("/v1/models/status")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let entry = &json["data"][0];
    assert_eq!(entry["id"], "m1");
    assert_eq!(entry["engine"], "llamacpp");
    assert_eq!(entry["breaker"], "closed");
    assert!(entry["healthy"].is_boolean());
}

// ═══════════════════════════════════════════════════════════════════════════
//  Sessions
// ═══════════════════════════════════════════════════════════════════════════

async fn seed_admin(state: &cortex_gateway::state::AppState, username: &str, password: &str) {
    let hash = cortex_gateway::auth::sessions::hash_password(password).unwrap();
    sqlx::query(
        "INSERT INTO users (username, password_hash, role) VALUES ($1, $2, 'admin') \
         ON CONFLICT (username) DO UPDATE SET password_hash = $2",
    )
    .bind(username)
    .bind(hash)
    .execute(&state.db)
    .await
    .unwrap();
}

#[tokio::test]
async fn login_rejects_bad_password_with_envelope() {
    let state = test_state().await;
    seed_admin(&state, "login-test-admin", "correct-horse").await;

    let response = send(
        &state,
        post_json(
            "/auth/login",
            &json!({"username": "login-test-admin", "password": "wrong"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_error_envelope(response, "authentication_error").await;
}

#[tokio::test]
async fn login_session_reaches_admin_surface_and_logout_revokes() {
    let state = test_state().await;
    seed_admin(&state, "session-admin", "correct-horse").await;

    let login = body_json(
        send(
            &state,
            post_json(
                "/auth/login",
                &json!({"username": "session-admin", "password": "correct-horse"}),
            ),
        )
        .await,
    )
    .await;
    let token = login["token"].as_str().unwrap().to_string();

    let response = send(&state, get_bearer("/admin/models", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let logout = send(
        &state,
        post_json_bearer("/auth/logout", &token, &json!({})),
    )
    .await;
    assert_eq!(logout.status(), StatusCode::OK);

    let after = send(&state, get_bearer("/admin/models", &token)).await;
    assert_eq!(after.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn non_admin_session_is_forbidden_on_admin_surface() {
    let state = test_state().await;
    let hash = cortex_gateway::auth::sessions::hash_password("password123").unwrap();
    sqlx::query(
        "INSERT INTO users (username, password_hash, role) VALUES ($1, $2, 'user') \
         ON CONFLICT (username) DO NOTHING",
    )
    .bind("plain-user")
    .bind(hash)
    .execute(&state.db)
    .await
    .unwrap();

    let login = body_json(
        send(
            &state,
            post_json(
                "/auth/login",
                &json!({"username": "plain-user", "password": "password123"}),
            ),
        )
        .await,
    )
    .await;
    let token = login["token"].as_str().unwrap().to_string();

    let response = send(&state, get_bearer("/admin/models", &token)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_error_envelope(response, "permission_error").await;

    // Self-service keys remain reachable for a plain user.
    let me = send(&state, get_bearer("/admin/keys/me", &token)).await;
    assert_eq!(me.status(), StatusCode::OK);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Key management via admin API
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn key_token_is_returned_exactly_once() {
    let state = test_state().await;
    seed_admin(&state, "key-admin", "correct-horse").await;
    let login = body_json(
        send(
            &state,
            post_json(
                "/auth/login",
                &json!({"username": "key-admin", "password": "correct-horse"}),
            ),
        )
        .await,
    )
    .await;
    let session = login["token"].as_str().unwrap().to_string();

    let created = body_json(
        send(
            &state,
            post_json_bearer("/admin/keys", &session, &json!({"scopes": ["chat"]})),
        )
        .await,
    )
    .await;
    let token = created["token"].as_str().unwrap();
    let prefix = created["prefix"].as_str().unwrap();
    assert!(token.starts_with("ck-"));
    assert!(token.contains(prefix));

    // Subsequent listings expose the prefix only.
    let listed = body_json(send(&state, get_bearer("/admin/keys", &session)).await).await;
    let keys = listed["keys"].as_array().unwrap();
    let row = keys
        .iter()
        .find(|k| k["prefix"] == *prefix)
        .expect("created key listed");
    assert!(row.get("token").is_none());
    assert!(row.get("token_hash").is_none());
}

#[tokio::test]
async fn revoked_key_stops_authenticating() {
    let state = test_state().await;
    seed_admin(&state, "revoke-admin", "correct-horse").await;
    let login = body_json(
        send(
            &state,
            post_json(
                "/auth/login",
                &json!({"username": "revoke-admin", "password": "correct-horse"}),
            ),
        )
        .await,
    )
    .await;
    let session = login["token"].as_str().unwrap().to_string();

    let created = body_json(
        send(
            &state,
            post_json_bearer("/admin/keys", &session, &json!({"scopes": ["chat"]})),
        )
        .await,
    )
    .await;
    let api_token = created["token"].as_str().unwrap().to_string();
    let key_id = created["id"].as_str().unwrap().to_string();

    // Works before revocation (404 = passed auth, model is unknown).
    let before = send(
        &state,
        post_json_bearer(
            "/v1/chat/completions",
            &api_token,
            &json!({"model": "nope", "messages": []}),
        ),
    )
    .await;
    assert_eq!(before.status(), StatusCode::NOT_FOUND);

    let revoke = send(
        &state,
        post_json_bearer(&format!("/admin/keys/{key_id}/revoke"), &session, &json!({})),
    )
    .await;
    assert_eq!(revoke.status(), StatusCode::OK);

    let after = send(
        &state,
        post_json_bearer(
            "/v1/chat/completions",
            &api_token,
            &json!({"model": "nope", "messages": []}),
        ),
    )
    .await;
    assert_eq!(after.status(), StatusCode::UNAUTHORIZED);
    assert_error_envelope(after, "authentication_error").await;
}
