// In-memory served-name → upstream map with per-entry health and circuit
// breaker, plus the background poller that keeps it honest.
//
// The entry list is a copy-on-write snapshot behind an RwLock<Arc<_>>:
// readers clone the Arc and never contend with the poller, which builds a
// fresh Vec and swaps it in. Selection bookkeeping (LRU order) lives in a
// side map so snapshots stay immutable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{Config, StaticUpstream};
use crate::lifecycle::{Engine, ModelTask};
use crate::metrics::Metrics;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct EntryHealth {
    pub ok: bool,
    pub last_check_at: Option<Instant>,
    pub last_ok_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub breaker: BreakerState,
    pub opened_at: Option<Instant>,
}

impl EntryHealth {
    fn assumed_healthy() -> Self {
        Self {
            ok: true,
            last_check_at: None,
            last_ok_at: Some(Instant::now()),
            consecutive_failures: 0,
            breaker: BreakerState::Closed,
            opened_at: None,
        }
    }

    fn unknown() -> Self {
        Self {
            ok: false,
            last_check_at: None,
            last_ok_at: None,
            consecutive_failures: 0,
            breaker: BreakerState::Closed,
            opened_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub model_id: Option<i64>,
    pub served_model_name: String,
    pub upstream_url: String,
    pub engine: Engine,
    pub task: ModelTask,
    pub health: EntryHealth,
}

impl RegistryEntry {
    /// Available for selection: breaker not open, last probe (or initial
    /// registration) succeeded, and the success is fresh.
    fn available(&self, ttl: Duration) -> bool {
        if self.health.breaker == BreakerState::Open {
            return false;
        }
        if !self.health.ok {
            return false;
        }
        match self.health.last_ok_at {
            Some(at) => at.elapsed() <= ttl,
            None => false,
        }
    }
}

/// What the router needs to forward one request.
#[derive(Debug, Clone)]
pub struct ResolvedUpstream {
    pub model_id: Option<i64>,
    pub served_model_name: String,
    pub url: String,
    pub engine: Engine,
    pub task: ModelTask,
}

#[derive(Debug)]
pub enum ResolveError {
    UnknownModel,
    NoHealthyUpstream,
}

pub struct ModelRegistry {
    entries: RwLock<Arc<Vec<RegistryEntry>>>,
    /// upstream_url → sequence number of its last selection.
    last_selected: Mutex<HashMap<String, u64>>,
    selection_seq: AtomicU64,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
}

impl ModelRegistry {
    pub fn new(config: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
            last_selected: Mutex::new(HashMap::new()),
            selection_seq: AtomicU64::new(0),
            config,
            metrics,
        }
    }

    pub fn seed_static(&self, upstreams: &[StaticUpstream]) {
        for up in upstreams {
            let engine = Engine::parse(&up.engine).unwrap_or(Engine::Vllm);
            let task = ModelTask::parse(&up.task).unwrap_or(ModelTask::Generate);
            self.insert(RegistryEntry {
                model_id: None,
                served_model_name: up.served_model_name.clone(),
                upstream_url: up.url.trim_end_matches('/').to_string(),
                engine,
                task,
                health: EntryHealth::unknown(),
            });
        }
    }

    /// Register an upstream, replacing any previous entry with the same
    /// (served name, url) pair. Fresh registrations are assumed healthy —
    /// the lifecycle controller only registers after a successful
    /// readiness probe, and the poller re-verifies on its next tick.
    pub fn register(
        &self,
        model_id: Option<i64>,
        served_model_name: &str,
        upstream_url: &str,
        engine: Engine,
        task: ModelTask,
    ) {
        self.insert(RegistryEntry {
            model_id,
            served_model_name: served_model_name.to_string(),
            upstream_url: upstream_url.trim_end_matches('/').to_string(),
            engine,
            task,
            health: EntryHealth::assumed_healthy(),
        });
        tracing::info!(model = %served_model_name, upstream = %upstream_url, "registry: entry added");
    }

    fn insert(&self, entry: RegistryEntry) {
        let mut guard = self.entries.write().expect("registry lock poisoned");
        let mut next: Vec<RegistryEntry> = guard
            .iter()
            .filter(|e| {
                !(e.served_model_name == entry.served_model_name
                    && e.upstream_url == entry.upstream_url)
            })
            .cloned()
            .collect();
        next.push(entry);
        next.sort_by(|a, b| {
            a.served_model_name
                .cmp(&b.served_model_name)
                .then_with(|| a.upstream_url.cmp(&b.upstream_url))
        });
        *guard = Arc::new(next);
    }

    pub fn deregister_model(&self, model_id: i64) {
        let mut guard = self.entries.write().expect("registry lock poisoned");
        let next: Vec<RegistryEntry> = guard
            .iter()
            .filter(|e| e.model_id != Some(model_id))
            .cloned()
            .collect();
        *guard = Arc::new(next);
        tracing::info!(model_id, "registry: entry removed");
    }

    /// Lock-free-ish read of the current entry list (sorted, stable order).
    pub fn snapshot(&self) -> Arc<Vec<RegistryEntry>> {
        self.entries.read().expect("registry lock poisoned").clone()
    }

    pub fn resolve(
        &self,
        model_name: &str,
        task_hint: Option<ModelTask>,
    ) -> Result<ResolvedUpstream, ResolveError> {
        self.resolve_excluding(model_name, task_hint, &[])
    }

    /// Resolve with an exclusion list, used by the single-retry path to
    /// pick a different upstream in the same pool.
    pub fn resolve_excluding(
        &self,
        model_name: &str,
        task_hint: Option<ModelTask>,
        exclude_urls: &[&str],
    ) -> Result<ResolvedUpstream, ResolveError> {
        let snapshot = self.snapshot();
        let ttl = self.config.registry_entry_ttl;

        let pool: Vec<&RegistryEntry> = snapshot
            .iter()
            .filter(|e| e.served_model_name == model_name)
            .filter(|e| task_hint.is_none_or(|t| e.task == t))
            .collect();
        if pool.is_empty() {
            return Err(ResolveError::UnknownModel);
        }

        let healthy: Vec<&&RegistryEntry> = pool
            .iter()
            .filter(|e| e.available(ttl))
            .filter(|e| !exclude_urls.contains(&e.upstream_url.as_str()))
            .collect();
        if healthy.is_empty() {
            return Err(ResolveError::NoHealthyUpstream);
        }

        // Least-recently-used among healthy; unselected entries (seq 0)
        // win, ties fall back to list order which round-robins as the
        // sequence numbers advance.
        let chosen = {
            let selected = self.last_selected.lock().expect("registry lru poisoned");
            *healthy
                .iter()
                .min_by_key(|e| selected.get(&e.upstream_url).copied().unwrap_or(0))
                .expect("non-empty healthy pool")
        };

        let seq = self.selection_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_selected
            .lock()
            .expect("registry lru poisoned")
            .insert(chosen.upstream_url.clone(), seq);

        self.metrics
            .record_upstream_selected(&chosen.served_model_name, &chosen.upstream_url);

        Ok(ResolvedUpstream {
            model_id: chosen.model_id,
            served_model_name: chosen.served_model_name.clone(),
            url: chosen.upstream_url.clone(),
            engine: chosen.engine,
            task: chosen.task,
        })
    }

    /// Apply one probe outcome. Called by the poller with a privately
    /// computed result; the swap is atomic from readers' perspective.
    pub fn apply_probe(&self, served_model_name: &str, upstream_url: &str, probe_ok: bool) {
        let threshold = self.config.breaker_failure_threshold;
        let cooldown = self.config.breaker_cooldown;
        let now = Instant::now();

        let mut guard = self.entries.write().expect("registry lock poisoned");
        let mut next: Vec<RegistryEntry> = guard.as_ref().clone();
        for entry in next.iter_mut() {
            if entry.served_model_name != served_model_name || entry.upstream_url != upstream_url {
                continue;
            }
            let health = &mut entry.health;
            health.last_check_at = Some(now);

            if probe_ok {
                health.ok = true;
                health.last_ok_at = Some(now);
                health.consecutive_failures = 0;
                health.breaker = BreakerState::Closed;
                health.opened_at = None;
            } else {
                health.ok = false;
                health.consecutive_failures += 1;
                match health.breaker {
                    // A half-open probe failing re-opens immediately.
                    BreakerState::HalfOpen => {
                        health.breaker = BreakerState::Open;
                        health.opened_at = Some(now);
                    }
                    BreakerState::Closed if health.consecutive_failures >= threshold => {
                        health.breaker = BreakerState::Open;
                        health.opened_at = Some(now);
                        tracing::warn!(
                            model = %entry.served_model_name,
                            upstream = %entry.upstream_url,
                            failures = health.consecutive_failures,
                            "registry: breaker opened"
                        );
                    }
                    _ => {}
                }
            }
        }
        // Move cooled-down breakers to half-open so the next probe decides.
        for entry in next.iter_mut() {
            if entry.health.breaker == BreakerState::Open {
                if let Some(opened) = entry.health.opened_at {
                    if opened.elapsed() >= cooldown {
                        entry.health.breaker = BreakerState::HalfOpen;
                    }
                }
            }
        }
        *guard = Arc::new(next);
    }
}

// ── Background poller ───────────────────────────────────────────────────

/// One probe pair against an upstream: liveness (`/health`) and readiness
/// (`/v1/models` must list the served name). Both engines expose both
/// paths.
pub async fn probe_upstream(
    client: &reqwest::Client,
    base_url: &str,
    served_model_name: &str,
    internal_secret: &str,
    timeout: Duration,
) -> bool {
    let live = client
        .get(format!("{base_url}/health"))
        .bearer_auth(internal_secret)
        .timeout(timeout)
        .send()
        .await;
    match live {
        Ok(resp) if resp.status().is_success() => {}
        _ => return false,
    }

    let ready = client
        .get(format!("{base_url}/v1/models"))
        .bearer_auth(internal_secret)
        .timeout(timeout)
        .send()
        .await;
    match ready {
        Ok(resp) if resp.status().is_success() => match resp.json::<serde_json::Value>().await {
            Ok(body) => body["data"]
                .as_array()
                .map(|models| {
                    models
                        .iter()
                        .any(|m| m["id"].as_str() == Some(served_model_name))
                })
                .unwrap_or(false),
            Err(_) => false,
        },
        _ => false,
    }
}

/// Long-lived poller owned by the process root. Probes every entry every
/// `health_poll_interval`; static and managed entries are treated alike.
pub fn spawn_poller(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = state.config.health_poll_interval;
        tracing::info!("health poller: started (interval={}s)", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;

            let snapshot = state.registry.snapshot();
            for entry in snapshot.iter() {
                let ok = probe_upstream(
                    &state.client,
                    &entry.upstream_url,
                    &entry.served_model_name,
                    &state.config.internal_upstream_secret,
                    state.config.health_probe_timeout,
                )
                .await;

                state.metrics.record_probe(ok);
                state
                    .registry
                    .apply_probe(&entry.served_model_name, &entry.upstream_url, ok);

                if !ok {
                    tracing::debug!(
                        model = %entry.served_model_name,
                        upstream = %entry.upstream_url,
                        "health poller: probe failed"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<Config> {
        // Only the registry-relevant knobs matter here.
        let mut cfg = crate::test_support::minimal_config();
        cfg.breaker_failure_threshold = 3;
        cfg.breaker_cooldown = Duration::from_millis(50);
        cfg.registry_entry_ttl = Duration::from_secs(60);
        Arc::new(cfg)
    }

    fn registry_with(entries: &[(&str, &str)]) -> ModelRegistry {
        let registry = ModelRegistry::new(test_config(), Arc::new(Metrics::default()));
        for (name, url) in entries {
            registry.register(None, name, url, Engine::Vllm, ModelTask::Generate);
        }
        registry
    }

    #[test]
    fn unknown_model_and_empty_pool_are_distinct() {
        let registry = registry_with(&[("m", "http://u1")]);
        assert!(matches!(
            registry.resolve("nope", None),
            Err(ResolveError::UnknownModel)
        ));
        for _ in 0..3 {
            registry.apply_probe("m", "http://u1", false);
        }
        assert!(matches!(
            registry.resolve("m", None),
            Err(ResolveError::NoHealthyUpstream)
        ));
    }

    #[test]
    fn breaker_opens_after_threshold_and_half_opens_after_cooldown() {
        let registry = registry_with(&[("m", "http://u1")]);
        registry.apply_probe("m", "http://u1", false);
        registry.apply_probe("m", "http://u1", false);
        assert_eq!(registry.snapshot()[0].health.breaker, BreakerState::Closed);
        registry.apply_probe("m", "http://u1", false);
        assert_eq!(registry.snapshot()[0].health.breaker, BreakerState::Open);

        std::thread::sleep(Duration::from_millis(60));
        // Any probe application pass moves cooled breakers to half-open.
        registry.apply_probe("m", "http://u1", false);
        // The failing half-open probe re-opened it.
        assert_eq!(registry.snapshot()[0].health.breaker, BreakerState::Open);

        std::thread::sleep(Duration::from_millis(60));
        registry.apply_probe("m", "http://u1", true);
        assert_eq!(registry.snapshot()[0].health.breaker, BreakerState::Closed);
        assert!(registry.resolve("m", None).is_ok());
    }

    #[test]
    fn unhealthy_upstream_is_skipped_in_favor_of_healthy_peer() {
        let registry = registry_with(&[("m", "http://u1"), ("m", "http://u2")]);
        for _ in 0..3 {
            registry.apply_probe("m", "http://u1", false);
        }
        for _ in 0..5 {
            let resolved = registry.resolve("m", None).unwrap();
            assert_eq!(resolved.url, "http://u2");
        }
    }

    #[test]
    fn selection_rotates_over_healthy_pool() {
        let registry = registry_with(&[("m", "http://u1"), ("m", "http://u2")]);
        let first = registry.resolve("m", None).unwrap().url;
        let second = registry.resolve("m", None).unwrap().url;
        assert_ne!(first, second, "LRU should alternate between two idle upstreams");
    }

    #[test]
    fn exclusion_skips_named_upstream() {
        let registry = registry_with(&[("m", "http://u1"), ("m", "http://u2")]);
        let resolved = registry
            .resolve_excluding("m", None, &["http://u1"])
            .unwrap();
        assert_eq!(resolved.url, "http://u2");
        assert!(matches!(
            registry.resolve_excluding("m", None, &["http://u1", "http://u2"]),
            Err(ResolveError::NoHealthyUpstream)
        ));
    }

    #[test]
    fn task_hint_filters_pool() {
        let registry = ModelRegistry::new(test_config(), Arc::new(Metrics::default()));
        registry.register(None, "embedder", "http://u1", Engine::Llamacpp, ModelTask::Embed);
        assert!(registry.resolve("embedder", Some(ModelTask::Embed)).is_ok());
        assert!(matches!(
            registry.resolve("embedder", Some(ModelTask::Generate)),
            Err(ResolveError::UnknownModel)
        ));
    }

    #[test]
    fn snapshot_order_is_deterministic() {
        let registry = registry_with(&[("b", "http://u2"), ("a", "http://u1"), ("b", "http://u1")]);
        let names: Vec<String> = registry
            .snapshot()
            .iter()
            .map(|e| format!("{}@{}", e.served_model_name, e.upstream_url))
            .collect();
        assert_eq!(names, vec!["a@http://u1", "b@http://u1", "b@http://u2"]);
    }

    #[test]
    fn deregister_removes_only_the_model() {
        let registry = ModelRegistry::new(test_config(), Arc::new(Metrics::default()));
        registry.register(Some(1), "m1", "http://u1", Engine::Vllm, ModelTask::Generate);
        registry.register(Some(2), "m2", "http://u2", Engine::Vllm, ModelTask::Generate);
        registry.deregister_model(1);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].served_model_name, "m2");
    }
}
