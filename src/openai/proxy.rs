// Upstream forwarding for the OpenAI surface: buffered round-trips,
// SSE byte relay with cancellation-by-drop, token-usage extraction for
// both shapes, and the accounting guard that records usage even when the
// client walks away mid-stream.

use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use serde_json::Value;

use crate::state::AppState;
use crate::usage::{UsageMeter, UsageRecord};

/// A failure before any response byte reached the client. `transient`
/// failures are eligible for the single same-pool retry.
pub struct ProxyFailure {
    pub transient: bool,
    pub status: Option<u16>,
    pub body: Bytes,
    pub message: String,
}

impl ProxyFailure {
    fn transport(e: &reqwest::Error) -> Self {
        Self {
            transient: e.is_connect() || e.is_timeout(),
            status: None,
            body: Bytes::new(),
            message: format!("upstream request failed: {e}"),
        }
    }
}

/// Extract `usage.prompt_tokens` / `usage.completion_tokens` from a
/// non-streaming OpenAI response body.
pub fn extract_usage(body: &[u8]) -> Option<(i32, i32)> {
    let parsed: Value = serde_json::from_slice(body).ok()?;
    let usage = parsed.get("usage")?;
    Some((
        usage["prompt_tokens"].as_i64().unwrap_or(0) as i32,
        usage["completion_tokens"].as_i64().unwrap_or(0) as i32,
    ))
}

/// Incremental scanner over SSE frames that remembers the last `usage`
/// object seen (engines attach it to the final chunk).
pub struct SseUsageScanner {
    buffer: String,
    usage: Option<(i32, i32)>,
}

impl SseUsageScanner {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            usage: None,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        while let Some(pos) = self.buffer.find("\n\n") {
            let frame = self.buffer[..pos].to_string();
            self.buffer = self.buffer[pos + 2..].to_string();
            for line in frame.lines() {
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" || data.is_empty() {
                    continue;
                }
                if let Ok(value) = serde_json::from_str::<Value>(data) {
                    if let Some(usage) = value.get("usage").filter(|u| u.is_object()) {
                        self.usage = Some((
                            usage["prompt_tokens"].as_i64().unwrap_or(0) as i32,
                            usage["completion_tokens"].as_i64().unwrap_or(0) as i32,
                        ));
                    }
                }
            }
        }
    }

    pub fn usage(&self) -> Option<(i32, i32)> {
        self.usage
    }
}

/// Records one usage row when dropped, so disconnects and clean
/// completions meter alike. Fields are finalized by the stream loop.
pub struct UsageGuard {
    meter: UsageMeter,
    record: UsageRecord,
    started: Instant,
    armed: bool,
}

impl UsageGuard {
    pub fn new(meter: UsageMeter, record: UsageRecord) -> Self {
        Self {
            meter,
            record,
            started: Instant::now(),
            armed: true,
        }
    }

    pub fn set_tokens(&mut self, prompt: i32, completion: i32) {
        self.record.prompt_tokens = prompt;
        self.record.completion_tokens = completion;
    }

    pub fn set_ttft(&mut self, ttft: Duration) {
        self.record.ttft_ms = Some(ttft.as_millis() as i32);
    }

    pub fn set_status(&mut self, status: u16) {
        self.record.status_code = i32::from(status);
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.record.latency_ms = self.started.elapsed().as_millis() as i32;
        self.meter.record(self.record.clone());
    }
}

/// One buffered round-trip to an upstream. 2xx returns the raw body for
/// relay; anything else is a `ProxyFailure` for the caller to translate
/// or retry.
pub async fn forward_buffered(
    state: &AppState,
    upstream_url: &str,
    path: &str,
    body: Bytes,
) -> Result<(StatusCode, Bytes), ProxyFailure> {
    let response = state
        .client
        .post(format!("{upstream_url}{path}"))
        .header(header::CONTENT_TYPE, "application/json")
        .bearer_auth(&state.config.internal_upstream_secret)
        .body(body)
        .timeout(state.config.request_timeout)
        .send()
        .await
        .map_err(|e| ProxyFailure::transport(&e))?;

    let status = response.status();
    let payload = response.bytes().await.unwrap_or_default();

    if status.is_success() {
        Ok((status, payload))
    } else {
        Err(ProxyFailure {
            transient: status.is_server_error(),
            status: Some(status.as_u16()),
            body: payload,
            message: format!("upstream returned {status}"),
        })
    }
}

/// Open a streaming upstream request. The HTTP status is checked before
/// returning, so a failed open can still be retried on another upstream —
/// once bytes start flowing there is no way back.
pub async fn open_stream(
    state: &AppState,
    upstream_url: &str,
    path: &str,
    body: Bytes,
) -> Result<reqwest::Response, ProxyFailure> {
    let response = state
        .client
        .post(format!("{upstream_url}{path}"))
        .header(header::CONTENT_TYPE, "application/json")
        .bearer_auth(&state.config.internal_upstream_secret)
        .body(body)
        // No overall deadline on streams; idleness is policed per-read.
        .timeout(Duration::from_secs(24 * 3600))
        .send()
        .await
        .map_err(|e| ProxyFailure::transport(&e))?;

    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let payload = response.bytes().await.unwrap_or_default();
        Err(ProxyFailure {
            transient: status.is_server_error(),
            status: Some(status.as_u16()),
            body: payload,
            message: format!("upstream returned {status}"),
        })
    }
}

/// Wrap an open upstream stream into the client response body. The gate
/// slot and usage guard ride inside the stream: dropping the body (client
/// disconnect) drops the upstream response, releases the slot and flushes
/// the usage row.
pub fn relay_stream(
    state: &AppState,
    upstream: reqwest::Response,
    slot: crate::ratelimit::StreamSlot,
    mut usage_guard: UsageGuard,
) -> Response {
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/event-stream")
        .to_string();

    let idle_timeout = state.config.stream_idle_timeout;
    let metrics = state.metrics.clone();
    let opened = Instant::now();

    let stream = async_stream::stream! {
        let _slot = slot;
        let mut scanner = SseUsageScanner::new();
        let mut first_byte_seen = false;
        let mut byte_stream = upstream.bytes_stream();

        loop {
            match tokio::time::timeout(idle_timeout, byte_stream.next()).await {
                Err(_) => {
                    tracing::warn!("stream: read-idle timeout after {}s", idle_timeout.as_secs());
                    yield Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream idle"));
                    break;
                }
                Ok(None) => break,
                Ok(Some(Ok(bytes))) => {
                    if !first_byte_seen {
                        first_byte_seen = true;
                        let ttft = opened.elapsed();
                        metrics.ttft.observe(ttft);
                        usage_guard.set_ttft(ttft);
                    }
                    scanner.feed(&bytes);
                    if let Some((prompt, completion)) = scanner.usage() {
                        usage_guard.set_tokens(prompt, completion);
                    }
                    yield Ok::<Bytes, std::io::Error>(bytes);
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!("stream: upstream read error: {e}");
                    yield Err(std::io::Error::other(e));
                    break;
                }
            }
        }
        // Guard drops here (or on cancellation) and records the row.
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .expect("static response parts are valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_usage_extraction_reads_openai_shape() {
        let body = br#"{"id":"x","usage":{"prompt_tokens":3,"completion_tokens":5,"total_tokens":8}}"#;
        assert_eq!(extract_usage(body), Some((3, 5)));
        assert_eq!(extract_usage(br#"{"id":"x"}"#), None);
        assert_eq!(extract_usage(b"not json"), None);
    }

    #[test]
    fn sse_scanner_finds_usage_in_final_chunk() {
        let mut scanner = SseUsageScanner::new();
        scanner.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n");
        assert_eq!(scanner.usage(), None);
        scanner.feed(b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":11}}\n\n");
        scanner.feed(b"data: [DONE]\n\n");
        assert_eq!(scanner.usage(), Some((7, 11)));
    }

    #[test]
    fn sse_scanner_handles_split_frames() {
        let mut scanner = SseUsageScanner::new();
        scanner.feed(b"data: {\"usage\":{\"prompt_tokens\":1,");
        assert_eq!(scanner.usage(), None, "incomplete frame must not parse");
        scanner.feed(b"\"completion_tokens\":2}}\n\n");
        assert_eq!(scanner.usage(), Some((1, 2)));
    }

    #[test]
    fn sse_scanner_ignores_non_data_lines() {
        let mut scanner = SseUsageScanner::new();
        scanner.feed(b": keepalive\n\nevent: ping\n\n");
        assert_eq!(scanner.usage(), None);
    }
}
