pub mod admin;
pub mod auth;
pub mod config;
pub mod deployment;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod openai;
pub mod ratelimit;
pub mod registry;
pub mod state;
pub mod system_monitor;
pub mod usage;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use state::AppState;

// ---------------------------------------------------------------------------
// Request-id middleware
// ---------------------------------------------------------------------------

/// Correlation id assigned to every request. UUIDv7 so usage rows sort by
/// id in arrival order.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Assigns the correlation ID, records it on the tracing span, exposes it
/// to handlers as an extension and returns it as `x-request-id`.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = Uuid::now_v7();
    request.extensions_mut().insert(RequestId(request_id));
    tracing::Span::current().record("request_id", tracing::field::display(request_id));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

// ── OpenAPI documentation ────────────────────────────────────────────────────

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Cortex Gateway API",
        version = "1.0.0",
        description = "OpenAI-compatible inference gateway for locally orchestrated model servers",
    ),
    paths(
        openai::health,
        openai::health_detailed,
        openai::chat_completions,
        openai::completions,
        openai::embeddings,
        openai::list_models,
        openai::models_status,
    ),
    components(schemas(
        lifecycle::CreateModelRequest,
        lifecycle::UpdateModelRequest,
    )),
    tags(
        (name = "health", description = "Health & readiness endpoints"),
        (name = "inference", description = "OpenAI-compatible inference surface"),
    )
)]
pub struct ApiDoc;

/// Build the application router with the given state.
/// Extracted from `main()` so integration tests can construct the app
/// without binding to a network port. Rate-limiting layers that need peer
/// addresses are added by `main` around this router.
pub fn create_router(state: AppState) -> Router {
    // ── Public routes (no auth) ──────────────────────────────────────
    let public = Router::new()
        .route("/health", get(openai::health))
        .route("/health/detailed", get(openai::health_detailed))
        .route("/v1/models/status", get(openai::models_status))
        .route("/metrics", get(metrics_handler))
        .route("/auth/login", post(auth::sessions::login))
        .route("/auth/logout", post(auth::sessions::logout));

    // ── OpenAI surface (API-key auth + scope check + rate limit) ─────
    let v1 = Router::new()
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/completions", post(openai::completions))
        .route("/v1/embeddings", post(openai::embeddings))
        .route("/v1/models", get(openai::list_models))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::api_auth));

    // ── Self-service key management (any valid session) ─────────────
    let self_service = Router::new()
        .route("/admin/keys/me", get(admin::my_keys).post(admin::create_my_key))
        .route("/admin/keys/me/{id}/revoke", post(admin::revoke_my_key))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::user_auth));

    // ── Admin surface (admin session required) ──────────────────────
    let admin_routes = Router::new()
        .route("/admin/orgs", get(admin::list_orgs).post(admin::create_org))
        .route("/admin/orgs/{id}", delete(admin::delete_org))
        .route("/admin/users", get(admin::list_users).post(admin::create_user))
        .route("/admin/users/{id}/role", post(admin::set_user_role))
        .route("/admin/keys", get(admin::list_keys).post(admin::create_key))
        .route("/admin/keys/{id}/revoke", post(admin::revoke_key))
        .route("/admin/models", get(admin::list_models).post(admin::create_model))
        .route(
            "/admin/models/{id}",
            get(admin::get_model)
                .patch(admin::update_model)
                .delete(admin::delete_model),
        )
        .route("/admin/models/{id}/start", post(admin::start_model))
        .route("/admin/models/{id}/stop", post(admin::stop_model))
        .route("/admin/models/{id}/test", post(admin::test_model))
        .route("/admin/models/{id}/dry-run", post(admin::dry_run_model))
        .route("/admin/models/{id}/logs", get(admin::model_logs))
        .route("/admin/usage", get(usage::list_usage))
        .route("/admin/usage/summary", get(usage::usage_summary))
        .route("/admin/usage/export", get(usage::export_usage))
        .route("/admin/deployment/export", post(deployment::start_export))
        .route("/admin/deployment/import-db", post(deployment::start_import_db))
        .route("/admin/deployment/import-model", post(deployment::start_import_model))
        .route("/admin/deployment/status", get(deployment::job_status))
        .route("/admin/deployment/cancel", post(deployment::cancel_job))
        .route("/admin/deployment/model-manifests", get(deployment::list_model_manifests))
        .route(
            "/admin/config/{key}",
            get(admin::get_config_value).put(admin::put_config_value),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::admin_auth));

    public
        .merge(v1)
        .merge(self_service)
        .merge(admin_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

// ── Prometheus-compatible metrics endpoint ───────────────────────────────────

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render(state.start_time.elapsed().as_secs())
}

// ── Test support ─────────────────────────────────────────────────────────────

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_support {
    use std::time::Duration;

    use crate::config::Config;

    /// A fully populated config with inert defaults for unit tests.
    pub fn minimal_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            database_url: "postgres://localhost/cortex_test".to_string(),
            redis_url: None,
            vllm_image: "vllm/vllm-openai:latest".to_string(),
            llamacpp_image: "ghcr.io/ggml-org/llama.cpp:server-cuda".to_string(),
            cors_origins: vec!["http://localhost:3001".to_string()],
            max_body_bytes: 10 * 1024 * 1024,
            vllm_startup_timeout: Duration::from_secs(600),
            llamacpp_startup_timeout: Duration::from_secs(300),
            nccl_timeout_ms: 1_800_000,
            nccl_debug_level: "WARN".to_string(),
            offline_mode: false,
            dev_auth_bypass: false,
            internal_upstream_secret: "cortex-internal".to_string(),
            models_dir: "/var/cortex/models".to_string(),
            hf_cache_dir: None,
            configs_dir: "/var/cortex/configs".to_string(),
            docker_network: "cortex_default".to_string(),
            container_port_range: (18000, 18999),
            gpu_capacities_mb: vec![24_576],
            health_poll_interval: Duration::from_secs(10),
            health_probe_timeout: Duration::from_secs(3),
            breaker_failure_threshold: 3,
            breaker_cooldown: Duration::from_secs(30),
            registry_entry_ttl: Duration::from_secs(60),
            rate_limit_rps: 10.0,
            rate_limit_burst: 20,
            rate_limit_window_sec: 60,
            rate_limit_fail_open: true,
            max_concurrent_streams_per_id: 4,
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(60),
            trusted_proxy_hops: 0,
            session_ttl: Duration::from_secs(86_400),
            bootstrap_admin_user: None,
            bootstrap_admin_password: None,
            static_upstreams: vec![],
        }
    }
}
