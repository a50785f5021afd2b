use axum::http::{header, HeaderValue, Method};
use sqlx::postgres::PgPoolOptions;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use cortex_gateway::auth::sessions;
use cortex_gateway::config::Config;
use cortex_gateway::registry;
use cortex_gateway::state::AppState;
use cortex_gateway::system_monitor;

async fn build_app(config: Config) -> anyhow::Result<(axum::Router, AppState)> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(std::time::Duration::from_secs(3))
        .idle_timeout(std::time::Duration::from_secs(600))
        .max_lifetime(std::time::Duration::from_secs(1800))
        .connect(&config.database_url)
        .await?;

    // Skip migrations if schema already exists (avoids checksum mismatch)
    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        tracing::warn!("Migration skipped (schema likely exists): {}", e);
    }

    sessions::seed_bootstrap_admin(&pool, &config).await?;

    let state = AppState::new(pool, config).await;

    // CORS — explicit allowlist from configuration
    let origins: Vec<HeaderValue> = state
        .config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(86_400));

    // Security headers
    let nosniff: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    let frame_deny: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    let referrer: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    // Coarse per-IP governor in front of everything; the per-key sliding
    // window inside the auth middleware does the fine-grained work.
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(2)
        .burst_size(120)
        .use_headers()
        .finish()
        .expect("governor config is valid");

    // The body-limit layer is a backstop; the router enforces the exact
    // configured ceiling with the OpenAI error envelope.
    let body_limit = state.config.max_body_bytes.saturating_mul(2);

    let app = cortex_gateway::create_router(state.clone())
        .layer(GovernorLayer::new(governor_conf))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(cors)
        .layer(nosniff)
        .layer(frame_deny)
        .layer(referrer)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = tracing::field::Empty,
                )
            }),
        )
        .layer(CompressionLayer::new());

    Ok((app, state))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    // Config or store problems are unrecoverable: exit non-zero.
    let config = Config::from_env()?;
    let addr = std::net::SocketAddr::new(config.host.parse()?, config.port);

    let (app, state) = build_app(config).await?;

    // ── Non-blocking startup: reconcile persisted model state ──
    let startup_state = state.clone();
    tokio::spawn(async move {
        let sync_timeout = std::time::Duration::from_secs(30);
        match tokio::time::timeout(sync_timeout, startup_state.lifecycle.reconcile()).await {
            Ok(Ok(())) => tracing::info!("startup: model registry reconciled"),
            Ok(Err(e)) => tracing::error!("startup: reconcile failed: {e}"),
            Err(_) => tracing::error!(
                "startup: reconcile timed out after {}s",
                sync_timeout.as_secs()
            ),
        }
        startup_state.mark_ready();
    });

    // ── Long-lived background tasks, owned by the process root ──
    let _poller = registry::spawn_poller(state.clone());
    system_monitor::spawn(state.system_monitor.clone());
    {
        let db = state.db.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            interval.tick().await; // first tick is immediate — skip it
            loop {
                interval.tick().await;
                match sessions::cleanup_expired(&db).await {
                    Ok(n) if n > 0 => tracing::info!(deleted = n, "Cleaned up expired sessions"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("session cleanup failed: {e}"),
                }
            }
        });
    }

    tracing::info!("Cortex gateway listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
