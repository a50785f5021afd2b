// Shared helpers for integration tests. All DB-backed tests require a
// DATABASE_URL pointing at a disposable Postgres database.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use http_body_util::BodyExt;
use serde_json::Value;
use sqlx::PgPool;
use tower::ServiceExt;

use cortex_gateway::config::Config;
use cortex_gateway::state::AppState;

/// Build a fresh AppState backed by the test Postgres database.
pub async fn test_state_with(config: Config) -> AppState {
    dotenvy::dotenv().ok();
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL required for integration tests");
    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    AppState::new(pool, config).await
}

pub async fn test_state() -> AppState {
    test_state_with(cortex_gateway::test_support::minimal_config()).await
}

pub fn app(state: AppState) -> axum::Router {
    cortex_gateway::create_router(state)
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

pub fn post_json_bearer(uri: &str, token: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

pub fn get_bearer(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

/// Insert an API key directly into the store; returns the full token.
pub async fn seed_key(state: &AppState, scopes: &[&str], allowlist: &[&str]) -> String {
    let minted = cortex_gateway::auth::keys::mint();
    let scopes: Vec<String> = scopes.iter().map(|s| s.to_string()).collect();
    let allowlist: Vec<String> = allowlist.iter().map(|s| s.to_string()).collect();
    sqlx::query(
        "INSERT INTO api_keys (prefix, token_hash, scopes, ip_allowlist) VALUES ($1, $2, $3, $4)",
    )
    .bind(&minted.prefix)
    .bind(&minted.token_hash)
    .bind(&scopes)
    .bind(&allowlist)
    .execute(&state.db)
    .await
    .expect("seed key");
    minted.token
}

/// Assert the body parses to the OpenAI error envelope.
pub async fn assert_error_envelope(response: Response, expected_type: &str) -> Value {
    let json = body_json(response).await;
    let error = json
        .get("error")
        .unwrap_or_else(|| panic!("missing error envelope: {json}"));
    assert!(error["message"].is_string(), "missing message: {json}");
    assert_eq!(error["type"], expected_type, "wrong error type: {json}");
    json
}

/// Drive one request through the router.
pub async fn send(state: &AppState, request: Request<Body>) -> Response {
    app(state.clone()).oneshot(request).await.unwrap()
}

#[allow(dead_code)]
pub async fn expect_status(state: &AppState, request: Request<Body>, status: StatusCode) -> Value {
    let response = send(state, request).await;
    assert_eq!(response.status(), status);
    body_json(response).await
}
