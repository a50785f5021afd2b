// Central application state. Clone-friendly — PgPool and Arc are both Clone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use reqwest::Client;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::deployment::Jobs;
use crate::lifecycle::docker::DockerClient;
use crate::lifecycle::Controller;
use crate::metrics::Metrics;
use crate::ratelimit::{RateLimiter, StreamGate};
use crate::registry::ModelRegistry;
use crate::usage::UsageMeter;

/// Cached host statistics, refreshed every 5s by a background task.
#[derive(Clone)]
pub struct SystemSnapshot {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub platform: String,
}

impl Default for SystemSnapshot {
    fn default() -> Self {
        Self {
            cpu_usage_percent: 0.0,
            memory_used_mb: 0.0,
            memory_total_mb: 0.0,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<Config>,
    pub client: Client,
    pub registry: Arc<ModelRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub stream_gate: Arc<StreamGate>,
    pub metrics: Arc<Metrics>,
    pub lifecycle: Arc<Controller>,
    pub jobs: Arc<Jobs>,
    pub usage: UsageMeter,
    pub system_monitor: Arc<RwLock<SystemSnapshot>>,
    pub start_time: Instant,
    /// `true` once startup reconciliation completes (or times out).
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub async fn new(db: PgPool, config: Config) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::default());

        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");

        let registry = Arc::new(ModelRegistry::new(config.clone(), metrics.clone()));
        registry.seed_static(&config.static_upstreams);

        let limiter = Arc::new(RateLimiter::new(config.clone(), metrics.clone()).await);
        let stream_gate = Arc::new(StreamGate::new(
            config.max_concurrent_streams_per_id,
            metrics.clone(),
        ));

        let docker = DockerClient::connect();
        let lifecycle = Arc::new(Controller::new(
            db.clone(),
            config.clone(),
            docker,
            registry.clone(),
            metrics.clone(),
            client.clone(),
        ));

        let usage = UsageMeter::spawn(db.clone(), metrics.clone());
        let jobs = Arc::new(Jobs::default());

        Self {
            db,
            config,
            client,
            registry,
            limiter,
            stream_gate,
            metrics,
            lifecycle,
            jobs,
            usage,
            system_monitor: Arc::new(RwLock::new(SystemSnapshot::default())),
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!("Gateway marked as READY");
    }
}
