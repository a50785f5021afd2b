// Gateway metrics: labeled counters and fixed-bucket histograms held in
// plain process memory, rendered as Prometheus exposition text on demand.
// No metrics framework — just atomics, small label maps and a formatter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Latency buckets in seconds, shared by the upstream-latency and TTFT
/// histograms. Upper bounds chosen for LLM-scale latencies.
const BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

#[derive(Default)]
pub struct Histogram {
    buckets: [AtomicU64; 12],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn observe(&self, value: Duration) {
        let secs = value.as_secs_f64();
        for (i, bound) in BUCKETS.iter().enumerate() {
            if secs <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_micros.fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, name: &str, labels: &str, out: &mut String) {
        let sep = if labels.is_empty() { "" } else { "," };
        for (i, bound) in BUCKETS.iter().enumerate() {
            out.push_str(&format!(
                "{name}_bucket{{{labels}{sep}le=\"{bound}\"}} {}\n",
                self.buckets[i].load(Ordering::Relaxed)
            ));
        }
        let count = self.count.load(Ordering::Relaxed);
        out.push_str(&format!("{name}_bucket{{{labels}{sep}le=\"+Inf\"}} {count}\n"));
        let braces = if labels.is_empty() {
            String::new()
        } else {
            format!("{{{labels}}}")
        };
        out.push_str(&format!(
            "{name}_sum{braces} {}\n",
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6
        ));
        out.push_str(&format!("{name}_count{braces} {count}\n"));
    }
}

/// All counters the gateway emits. Labeled families use a mutex-guarded
/// map keyed by the rendered label string — label cardinality is small
/// (endpoints × status classes × two engines) and the lock is never taken
/// inside the streaming copy loop.
#[derive(Default)]
pub struct Metrics {
    requests: Mutex<BTreeMap<String, u64>>,
    upstream_selected: Mutex<BTreeMap<String, u64>>,
    state_transitions: Mutex<BTreeMap<String, u64>>,

    pub limiter_admitted: AtomicU64,
    pub limiter_blocked: AtomicU64,
    pub limiter_store_errors: AtomicU64,
    pub auth_allowed: AtomicU64,
    pub auth_blocked: AtomicU64,
    pub probe_success: AtomicU64,
    pub probe_failure: AtomicU64,
    pub usage_dropped: AtomicU64,
    pub streams_open: AtomicU64,

    upstream_latency: Mutex<BTreeMap<String, Arc<Histogram>>>,
    pub ttft: Histogram,
}

fn bump(map: &Mutex<BTreeMap<String, u64>>, key: String) {
    let mut guard = map.lock().expect("metrics mutex poisoned");
    *guard.entry(key).or_insert(0) += 1;
}

impl Metrics {
    pub fn record_request(&self, endpoint: &str, status: u16, engine: &str) {
        let class = format!("{}xx", status / 100);
        bump(
            &self.requests,
            format!("endpoint=\"{endpoint}\",status_class=\"{class}\",engine=\"{engine}\""),
        );
    }

    pub fn record_upstream_selected(&self, model: &str, upstream: &str) {
        bump(
            &self.upstream_selected,
            format!("model=\"{model}\",upstream=\"{upstream}\""),
        );
    }

    pub fn record_state_transition(&self, engine: &str, to_state: &str) {
        bump(
            &self.state_transitions,
            format!("engine=\"{engine}\",state=\"{to_state}\""),
        );
    }

    pub fn observe_upstream_latency(&self, endpoint: &str, engine: &str, elapsed: Duration) {
        let key = format!("endpoint=\"{endpoint}\",engine=\"{engine}\"");
        let hist = {
            let mut guard = self.upstream_latency.lock().expect("metrics mutex poisoned");
            guard.entry(key).or_default().clone()
        };
        hist.observe(elapsed);
    }

    pub fn record_probe(&self, ok: bool) {
        if ok {
            self.probe_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.probe_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Render the full Prometheus exposition.
    pub fn render(&self, uptime_secs: u64) -> String {
        let mut out = String::with_capacity(4096);

        out.push_str("# HELP cortex_uptime_seconds Gateway uptime in seconds\n# TYPE cortex_uptime_seconds counter\n");
        out.push_str(&format!("cortex_uptime_seconds {uptime_secs}\n"));

        out.push_str("# HELP cortex_requests_total Requests by endpoint, status class and engine\n# TYPE cortex_requests_total counter\n");
        for (labels, v) in self.requests.lock().expect("metrics mutex poisoned").iter() {
            out.push_str(&format!("cortex_requests_total{{{labels}}} {v}\n"));
        }

        out.push_str("# HELP cortex_upstream_selected_total Upstream selections by model and URL\n# TYPE cortex_upstream_selected_total counter\n");
        for (labels, v) in self.upstream_selected.lock().expect("metrics mutex poisoned").iter() {
            out.push_str(&format!("cortex_upstream_selected_total{{{labels}}} {v}\n"));
        }

        out.push_str("# HELP cortex_model_state_transitions_total Container state transitions by engine\n# TYPE cortex_model_state_transitions_total counter\n");
        for (labels, v) in self.state_transitions.lock().expect("metrics mutex poisoned").iter() {
            out.push_str(&format!("cortex_model_state_transitions_total{{{labels}}} {v}\n"));
        }

        for (name, help, v) in [
            ("cortex_ratelimit_admitted_total", "Requests admitted by the rate limiter", &self.limiter_admitted),
            ("cortex_ratelimit_blocked_total", "Requests blocked by the rate limiter", &self.limiter_blocked),
            ("cortex_ratelimit_store_errors_total", "Limiter store failures (failed open/closed)", &self.limiter_store_errors),
            ("cortex_auth_allowed_total", "API key authentications accepted", &self.auth_allowed),
            ("cortex_auth_blocked_total", "API key authentications rejected", &self.auth_blocked),
            ("cortex_health_probe_success_total", "Health probes that succeeded", &self.probe_success),
            ("cortex_health_probe_failure_total", "Health probes that failed", &self.probe_failure),
            ("cortex_usage_dropped_total", "Usage records dropped on store failure", &self.usage_dropped),
        ] {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n"));
            out.push_str(&format!("{name} {}\n", v.load(Ordering::Relaxed)));
        }

        out.push_str("# HELP cortex_streams_open Currently open streaming responses\n# TYPE cortex_streams_open gauge\n");
        out.push_str(&format!("cortex_streams_open {}\n", self.streams_open.load(Ordering::Relaxed)));

        out.push_str("# HELP cortex_upstream_latency_seconds Upstream round-trip latency\n# TYPE cortex_upstream_latency_seconds histogram\n");
        for (labels, hist) in self.upstream_latency.lock().expect("metrics mutex poisoned").iter() {
            hist.render("cortex_upstream_latency_seconds", labels, &mut out);
        }

        out.push_str("# HELP cortex_ttft_seconds Time to first streamed byte\n# TYPE cortex_ttft_seconds histogram\n");
        self.ttft.render("cortex_ttft_seconds", "", &mut out);

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::default();
        h.observe(Duration::from_millis(30));
        h.observe(Duration::from_millis(300));
        h.observe(Duration::from_secs(20));
        let mut out = String::new();
        h.render("t", "", &mut out);
        assert!(out.contains("t_bucket{le=\"0.05\"} 1"));
        assert!(out.contains("t_bucket{le=\"0.5\"} 2"));
        assert!(out.contains("t_bucket{le=\"30\"} 3"));
        assert!(out.contains("t_count 3"));
    }

    #[test]
    fn render_includes_labeled_counters() {
        let m = Metrics::default();
        m.record_request("/v1/chat/completions", 200, "vllm");
        m.record_request("/v1/chat/completions", 429, "vllm");
        let text = m.render(5);
        assert!(text.contains(
            "cortex_requests_total{endpoint=\"/v1/chat/completions\",status_class=\"2xx\",engine=\"vllm\"} 1"
        ));
        assert!(text.contains("status_class=\"4xx\""));
        assert!(text.contains("cortex_uptime_seconds 5"));
    }
}
