// Runtime configuration, resolved once at startup from the environment
// (after dotenvy). Anything invalid here is an unrecoverable startup error
// and exits non-zero.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// A model endpoint the gateway does not manage but still routes to and
/// health-checks (e.g. an engine started outside the gateway).
#[derive(Debug, Clone, Deserialize)]
pub struct StaticUpstream {
    pub served_model_name: String,
    pub url: String,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default = "default_task")]
    pub task: String,
}

fn default_engine() -> String {
    "vllm".to_string()
}

fn default_task() -> String {
    "generate".to_string()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub redis_url: Option<String>,

    /// Default container images, one per engine family.
    pub vllm_image: String,
    pub llamacpp_image: String,

    pub cors_origins: Vec<String>,
    pub max_body_bytes: usize,

    pub vllm_startup_timeout: Duration,
    pub llamacpp_startup_timeout: Duration,

    /// Multi-GPU coordination defaults injected into every vLLM container.
    pub nccl_timeout_ms: u64,
    pub nccl_debug_level: String,

    pub offline_mode: bool,
    /// Dev-only: skip API-key auth entirely. Never enable in production.
    pub dev_auth_bypass: bool,
    /// Shared secret sent to upstream engines as a bearer token.
    pub internal_upstream_secret: String,

    pub models_dir: String,
    pub hf_cache_dir: Option<String>,
    /// Generated per-model files (system prompts etc.) land here.
    pub configs_dir: String,

    pub docker_network: String,
    pub container_port_range: (u16, u16),
    /// Per-ordinal GPU VRAM in MiB, used by dry-run estimates. Ordinals
    /// beyond the list fall back to the last entry.
    pub gpu_capacities_mb: Vec<u64>,

    pub health_poll_interval: Duration,
    pub health_probe_timeout: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
    pub registry_entry_ttl: Duration,

    pub rate_limit_rps: f64,
    pub rate_limit_burst: u32,
    pub rate_limit_window_sec: u64,
    /// When the limiter store is down: admit (true) or reject (false).
    pub rate_limit_fail_open: bool,
    pub max_concurrent_streams_per_id: u32,

    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub trusted_proxy_hops: usize,

    pub session_ttl: Duration,

    pub bootstrap_admin_user: Option<String>,
    pub bootstrap_admin_password: Option<String>,

    pub static_upstreams: Vec<StaticUpstream>,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw}: {e}")),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = var("DATABASE_URL").context("DATABASE_URL required")?;

        let cors_origins = var("CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| {
                vec![
                    "http://localhost:3001".to_string(),
                    "http://127.0.0.1:3001".to_string(),
                ]
            });

        let port_range = match var("CONTAINER_PORT_RANGE") {
            Some(raw) => {
                let (lo, hi) = raw
                    .split_once('-')
                    .with_context(|| format!("CONTAINER_PORT_RANGE must be LO-HI, got {raw}"))?;
                (lo.trim().parse::<u16>()?, hi.trim().parse::<u16>()?)
            }
            None => (18000, 18999),
        };
        if port_range.0 >= port_range.1 {
            bail!("CONTAINER_PORT_RANGE is empty: {}-{}", port_range.0, port_range.1);
        }

        let static_upstreams: Vec<StaticUpstream> = match var("STATIC_UPSTREAMS") {
            Some(raw) => serde_json::from_str(&raw).context("STATIC_UPSTREAMS is not valid JSON")?,
            None => Vec::new(),
        };

        let dev_auth_bypass = parse_var("DEV_AUTH_BYPASS", false)?;
        if dev_auth_bypass {
            tracing::warn!("DEV_AUTH_BYPASS enabled — all /v1 requests are unauthenticated");
        }

        Ok(Self {
            host: var("CORTEX_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_var("CORTEX_PORT", 8084)?,
            database_url,
            redis_url: var("REDIS_URL"),
            vllm_image: var("VLLM_IMAGE").unwrap_or_else(|| "vllm/vllm-openai:latest".to_string()),
            llamacpp_image: var("LLAMACPP_IMAGE")
                .unwrap_or_else(|| "ghcr.io/ggml-org/llama.cpp:server-cuda".to_string()),
            cors_origins,
            max_body_bytes: parse_var("MAX_BODY_BYTES", 10 * 1024 * 1024)?,
            vllm_startup_timeout: Duration::from_secs(parse_var("VLLM_STARTUP_TIMEOUT_SEC", 600u64)?),
            llamacpp_startup_timeout: Duration::from_secs(parse_var(
                "LLAMACPP_STARTUP_TIMEOUT_SEC",
                300u64,
            )?),
            nccl_timeout_ms: parse_var("NCCL_TIMEOUT_MS", 1_800_000u64)?,
            nccl_debug_level: var("NCCL_DEBUG").unwrap_or_else(|| "WARN".to_string()),
            offline_mode: parse_var("OFFLINE_MODE", false)?,
            dev_auth_bypass,
            internal_upstream_secret: var("INTERNAL_UPSTREAM_SECRET")
                .unwrap_or_else(|| "cortex-internal".to_string()),
            models_dir: var("MODELS_DIR").unwrap_or_else(|| "/var/cortex/models".to_string()),
            hf_cache_dir: var("HF_CACHE_DIR"),
            configs_dir: var("CONFIGS_DIR").unwrap_or_else(|| "/var/cortex/configs".to_string()),
            docker_network: var("DOCKER_NETWORK").unwrap_or_else(|| "cortex_default".to_string()),
            container_port_range: port_range,
            gpu_capacities_mb: var("GPU_CAPACITIES_MB")
                .map(|raw| {
                    raw.split(',')
                        .filter_map(|s| s.trim().parse().ok())
                        .collect::<Vec<u64>>()
                })
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| vec![24_576]),
            health_poll_interval: Duration::from_secs(parse_var("HEALTH_POLL_INTERVAL_SEC", 10u64)?),
            health_probe_timeout: Duration::from_secs(parse_var("HEALTH_PROBE_TIMEOUT_SEC", 3u64)?),
            breaker_failure_threshold: parse_var("BREAKER_FAILURE_THRESHOLD", 3u32)?,
            breaker_cooldown: Duration::from_secs(parse_var("BREAKER_COOLDOWN_SEC", 30u64)?),
            registry_entry_ttl: Duration::from_secs(parse_var("REGISTRY_ENTRY_TTL_SEC", 60u64)?),
            rate_limit_rps: parse_var("RATE_LIMIT_RPS", 10.0f64)?,
            rate_limit_burst: parse_var("RATE_LIMIT_BURST", 20u32)?,
            rate_limit_window_sec: parse_var("RATE_LIMIT_WINDOW_SEC", 60u64)?,
            rate_limit_fail_open: parse_var("RATE_LIMIT_FAIL_OPEN", true)?,
            max_concurrent_streams_per_id: parse_var("MAX_CONCURRENT_STREAMS_PER_ID", 4u32)?,
            request_timeout: Duration::from_secs(parse_var("REQUEST_TIMEOUT_SEC", 120u64)?),
            stream_idle_timeout: Duration::from_secs(parse_var("STREAM_IDLE_TIMEOUT_SEC", 60u64)?),
            trusted_proxy_hops: parse_var("TRUSTED_PROXY_HOPS", 0usize)?,
            session_ttl: Duration::from_secs(parse_var("SESSION_TTL_SEC", 86_400u64)?),
            bootstrap_admin_user: var("BOOTSTRAP_ADMIN_USER"),
            bootstrap_admin_password: var("BOOTSTRAP_ADMIN_PASSWORD"),
            static_upstreams,
        })
    }

    pub fn startup_timeout(&self, engine: crate::lifecycle::Engine) -> Duration {
        match engine {
            crate::lifecycle::Engine::Vllm => self.vllm_startup_timeout,
            crate::lifecycle::Engine::Llamacpp => self.llamacpp_startup_timeout,
        }
    }

    pub fn engine_image(&self, engine: crate::lifecycle::Engine) -> &str {
        match engine {
            crate::lifecycle::Engine::Vllm => &self.vllm_image,
            crate::lifecycle::Engine::Llamacpp => &self.llamacpp_image,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_upstreams_parse_with_defaults() {
        let raw = r#"[{"served_model_name":"m1","url":"http://10.0.0.5:8000"}]"#;
        let parsed: Vec<StaticUpstream> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].engine, "vllm");
        assert_eq!(parsed[0].task, "generate");
    }
}
