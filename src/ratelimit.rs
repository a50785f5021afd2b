// Sliding-window token bucket keyed by API-key id (authenticated) or
// client IP, plus the streaming concurrency gate.
//
// When REDIS_URL is configured, admission runs an atomic Lua script against
// the shared store so several gateway processes agree on one budget; the
// in-process bucket map is kept as a write-through layer and takes over
// when the store is unreachable (fail-open or fail-closed per config).
// Without Redis the in-process window is authoritative — exact for a
// single-process deployment.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::Script;

use crate::config::Config;
use crate::metrics::Metrics;

const BUCKET_SCRIPT: &str = r#"
local tokens_key = KEYS[1]
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local weight = tonumber(ARGV[4])

local data = redis.call('HMGET', tokens_key, 'tokens', 'ts')
local tokens = tonumber(data[1])
local ts = tonumber(data[2])
if tokens == nil then
  tokens = burst
  ts = now_ms
end

local elapsed = math.max(0, now_ms - ts) / 1000.0
tokens = math.min(burst, tokens + elapsed * rate)

local allowed = 0
local retry_ms = 0
if tokens >= weight then
  tokens = tokens - weight
  allowed = 1
else
  retry_ms = math.ceil((weight - tokens) / rate * 1000)
end

redis.call('HSET', tokens_key, 'tokens', tokens, 'ts', now_ms)
redis.call('PEXPIRE', tokens_key, math.ceil(burst / rate * 1000) * 2)
return {allowed, retry_ms}
"#;

#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after_ms: u64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    redis: Option<ConnectionManager>,
    script: Script,
    local: Mutex<HashMap<String, Bucket>>,
    rps: f64,
    burst: f64,
    fail_open: bool,
    metrics: Arc<Metrics>,
    epoch: Instant,
}

impl RateLimiter {
    pub async fn new(config: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        let redis = match config.redis_url.as_deref() {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match ConnectionManager::new(client).await {
                    Ok(conn) => {
                        tracing::info!("rate limiter: connected to shared store");
                        Some(conn)
                    }
                    Err(e) => {
                        tracing::warn!("rate limiter: store unreachable, using local window: {e}");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!("rate limiter: invalid REDIS_URL, using local window: {e}");
                    None
                }
            },
            None => None,
        };

        Self {
            redis,
            script: Script::new(BUCKET_SCRIPT),
            local: Mutex::new(HashMap::new()),
            rps: config.rate_limit_rps.max(0.001),
            burst: f64::from(config.rate_limit_burst.max(1)),
            fail_open: config.rate_limit_fail_open,
            metrics,
            epoch: Instant::now(),
        }
    }

    /// Admit or reject one request for `subject`. Never errors — a store
    /// failure degrades to the configured open/closed policy.
    pub async fn admit(&self, subject: &str, weight: u32) -> Decision {
        let decision = match self.redis.clone() {
            Some(mut conn) => {
                let now_ms = self.epoch.elapsed().as_millis() as u64;
                let result: redis::RedisResult<(i64, i64)> = self
                    .script
                    .key(format!("cortex:rl:{subject}"))
                    .arg(self.rps)
                    .arg(self.burst)
                    .arg(now_ms)
                    .arg(weight)
                    .invoke_async(&mut conn)
                    .await;

                match result {
                    Ok((allowed, retry_ms)) => {
                        // Write-through so a store outage starts from warm state.
                        let _ = self.admit_local(subject, weight);
                        Decision {
                            allowed: allowed == 1,
                            retry_after_ms: retry_ms.max(0) as u64,
                        }
                    }
                    Err(e) => {
                        tracing::warn!("rate limiter store error: {e}");
                        self.metrics.limiter_store_errors.fetch_add(1, Ordering::Relaxed);
                        if self.fail_open {
                            Decision { allowed: true, retry_after_ms: 0 }
                        } else {
                            Decision { allowed: false, retry_after_ms: 1000 }
                        }
                    }
                }
            }
            None => self.admit_local(subject, weight),
        };

        if decision.allowed {
            self.metrics.limiter_admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.limiter_blocked.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    fn admit_local(&self, subject: &str, weight: u32) -> Decision {
        let mut map = self.local.lock().expect("limiter mutex poisoned");

        // Bound the map: drop buckets that have fully refilled (they carry
        // no information beyond their defaults).
        if map.len() > 10_000 {
            let full_after = Duration::from_secs_f64(self.burst / self.rps);
            map.retain(|_, b| b.last_refill.elapsed() < full_after);
        }

        let now = Instant::now();
        let bucket = map.entry(subject.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rps).min(self.burst);
        bucket.last_refill = now;

        let weight = f64::from(weight);
        if bucket.tokens >= weight {
            bucket.tokens -= weight;
            Decision { allowed: true, retry_after_ms: 0 }
        } else {
            let deficit = weight - bucket.tokens;
            Decision {
                allowed: false,
                retry_after_ms: ((deficit / self.rps) * 1000.0).ceil() as u64,
            }
        }
    }
}

// ── Streaming concurrency gate ──────────────────────────────────────────

struct GateInner {
    max_per_subject: u32,
    counts: Mutex<HashMap<String, u32>>,
    /// EWMA of completed stream durations, feeds the 429 retry hint.
    avg_stream_ms: std::sync::atomic::AtomicU64,
    metrics: Arc<Metrics>,
}

/// Counts concurrently open streaming responses per subject. A slot is
/// held for the life of the response body and released on drop, which
/// also covers client disconnects.
pub struct StreamGate {
    inner: Arc<GateInner>,
}

pub struct StreamSlot {
    inner: Arc<GateInner>,
    subject: String,
    opened: Instant,
}

impl StreamGate {
    pub fn new(max_per_subject: u32, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                max_per_subject: max_per_subject.max(1),
                counts: Mutex::new(HashMap::new()),
                avg_stream_ms: std::sync::atomic::AtomicU64::new(1000),
                metrics,
            }),
        }
    }

    pub fn try_acquire(&self, subject: &str) -> Option<StreamSlot> {
        let mut counts = self.inner.counts.lock().expect("gate mutex poisoned");
        let count = counts.entry(subject.to_string()).or_insert(0);
        if *count >= self.inner.max_per_subject {
            return None;
        }
        *count += 1;
        self.inner.metrics.streams_open.fetch_add(1, Ordering::Relaxed);
        Some(StreamSlot {
            inner: self.inner.clone(),
            subject: subject.to_string(),
            opened: Instant::now(),
        })
    }

    /// Retry hint proportional to how long streams have been taking.
    pub fn retry_after_ms(&self) -> u64 {
        self.inner.avg_stream_ms.load(Ordering::Relaxed).max(100)
    }

    #[cfg(test)]
    fn open_count(&self, subject: &str) -> u32 {
        *self
            .inner
            .counts
            .lock()
            .unwrap()
            .get(subject)
            .unwrap_or(&0)
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        let mut counts = self.inner.counts.lock().expect("gate mutex poisoned");
        if let Some(count) = counts.get_mut(&self.subject) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.subject);
            }
        }
        drop(counts);

        let elapsed_ms = self.opened.elapsed().as_millis() as u64;
        // EWMA with alpha 1/8, integer arithmetic.
        let prev = self.inner.avg_stream_ms.load(Ordering::Relaxed);
        let next = prev - prev / 8 + elapsed_ms / 8;
        self.inner.avg_stream_ms.store(next.max(1), Ordering::Relaxed);

        self.inner.metrics.streams_open.fetch_sub(1, Ordering::Relaxed);
    }
}
