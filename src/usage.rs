// Usage metering: per-request rows are queued onto an in-process channel
// and flushed in batches by a long-lived writer task. A full queue or a
// store failure drops records with a counter increment — the response
// path never waits on the meter.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{PgPool, QueryBuilder, Row};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::state::AppState;

const QUEUE_CAPACITY: usize = 4096;
const FLUSH_BATCH: usize = 64;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const EXPORT_ROW_CAP: i64 = 50_000;

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub request_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
    pub model: String,
    pub task: String,
    pub endpoint: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub latency_ms: i32,
    pub ttft_ms: Option<i32>,
    pub status_code: i32,
}

#[derive(Clone)]
pub struct UsageMeter {
    tx: mpsc::Sender<UsageRecord>,
    metrics: Arc<Metrics>,
}

impl UsageMeter {
    pub fn spawn(db: PgPool, metrics: Arc<Metrics>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(flusher(db, rx, metrics.clone()));
        Self { tx, metrics }
    }

    /// Non-blocking enqueue; safe to call from Drop impls.
    pub fn record(&self, record: UsageRecord) {
        if self.tx.try_send(record).is_err() {
            self.metrics
                .usage_dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

async fn flusher(db: PgPool, mut rx: mpsc::Receiver<UsageRecord>, metrics: Arc<Metrics>) {
    let mut pending: Vec<UsageRecord> = Vec::with_capacity(FLUSH_BATCH);
    loop {
        let deadline = tokio::time::sleep(FLUSH_INTERVAL);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                record = rx.recv() => {
                    match record {
                        Some(r) => {
                            pending.push(r);
                            if pending.len() >= FLUSH_BATCH {
                                break;
                            }
                        }
                        None => {
                            flush(&db, &mut pending, &metrics).await;
                            return;
                        }
                    }
                }
                _ = &mut deadline => break,
            }
        }

        flush(&db, &mut pending, &metrics).await;
    }
}

async fn flush(db: &PgPool, pending: &mut Vec<UsageRecord>, metrics: &Metrics) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    let count = batch.len();

    let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
        "INSERT INTO usage (request_id, api_key_id, user_id, org_id, model, task, endpoint, \
         prompt_tokens, completion_tokens, total_tokens, latency_ms, ttft_ms, status_code) ",
    );
    builder.push_values(batch, |mut b, r| {
        b.push_bind(r.request_id)
            .push_bind(r.api_key_id)
            .push_bind(r.user_id)
            .push_bind(r.org_id)
            .push_bind(r.model)
            .push_bind(r.task)
            .push_bind(r.endpoint)
            .push_bind(r.prompt_tokens)
            .push_bind(r.completion_tokens)
            .push_bind(r.prompt_tokens + r.completion_tokens)
            .push_bind(r.latency_ms)
            .push_bind(r.ttft_ms)
            .push_bind(r.status_code);
    });
    // Re-processing a request with an identical id must not double-count.
    builder.push(" ON CONFLICT (request_id) DO NOTHING");

    if let Err(e) = builder.build().execute(db).await {
        tracing::warn!("usage flush failed, dropping {count} records: {e}");
        metrics
            .usage_dropped
            .fetch_add(count as u64, std::sync::atomic::Ordering::Relaxed);
    }
}

// ── Query handlers (admin surface) ──────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub model: Option<String>,
    pub task: Option<String>,
    /// "2xx" | "4xx" | "5xx"
    pub status_class: Option<String>,
    pub api_key_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn push_filters(builder: &mut QueryBuilder<'_, sqlx::Postgres>, q: &UsageQuery) {
    builder.push(" WHERE 1=1");
    if let Some(start) = q.start {
        builder.push(" AND ts >= ").push_bind(start);
    }
    if let Some(end) = q.end {
        builder.push(" AND ts < ").push_bind(end);
    }
    if let Some(ref model) = q.model {
        builder.push(" AND model = ").push_bind(model.clone());
    }
    if let Some(ref task) = q.task {
        builder.push(" AND task = ").push_bind(task.clone());
    }
    if let Some(key) = q.api_key_id {
        builder.push(" AND api_key_id = ").push_bind(key);
    }
    if let Some(ref class) = q.status_class {
        let (lo, hi) = match class.as_str() {
            "2xx" => (200, 300),
            "4xx" => (400, 500),
            "5xx" => (500, 600),
            _ => (0, 1000),
        };
        builder
            .push(" AND status_code >= ")
            .push_bind(lo)
            .push(" AND status_code < ")
            .push_bind(hi);
    }
}

fn row_to_json(row: &sqlx::postgres::PgRow) -> Value {
    json!({
        "id": row.get::<i64, _>("id"),
        "ts": row.get::<DateTime<Utc>, _>("ts"),
        "request_id": row.get::<Uuid, _>("request_id"),
        "api_key_id": row.get::<Option<Uuid>, _>("api_key_id"),
        "user_id": row.get::<Option<Uuid>, _>("user_id"),
        "org_id": row.get::<Option<Uuid>, _>("org_id"),
        "model": row.get::<String, _>("model"),
        "task": row.get::<String, _>("task"),
        "endpoint": row.get::<String, _>("endpoint"),
        "prompt_tokens": row.get::<i32, _>("prompt_tokens"),
        "completion_tokens": row.get::<i32, _>("completion_tokens"),
        "total_tokens": row.get::<i32, _>("total_tokens"),
        "latency_ms": row.get::<i32, _>("latency_ms"),
        "ttft_ms": row.get::<Option<i32>, _>("ttft_ms"),
        "status_code": row.get::<i32, _>("status_code"),
    })
}

/// GET /admin/usage — newest-first page of usage rows.
pub async fn list_usage(
    State(state): State<AppState>,
    Query(q): Query<UsageQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    let offset = q.offset.unwrap_or(0).max(0);

    let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new("SELECT * FROM usage");
    push_filters(&mut builder, &q);
    builder
        .push(" ORDER BY ts DESC, id DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let rows = builder.build().fetch_all(&state.db).await?;
    let records: Vec<Value> = rows.iter().map(row_to_json).collect();
    Ok(Json(json!({ "records": records, "limit": limit, "offset": offset })))
}

/// GET /admin/usage/summary — aggregates by model over the window.
pub async fn usage_summary(
    State(state): State<AppState>,
    Query(q): Query<UsageQuery>,
) -> Result<Json<Value>, ApiError> {
    let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
        "SELECT model, COUNT(*) AS requests, \
         COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens, \
         COALESCE(SUM(completion_tokens), 0) AS completion_tokens, \
         COALESCE(SUM(total_tokens), 0) AS total_tokens, \
         COALESCE(AVG(latency_ms), 0)::bigint AS avg_latency_ms \
         FROM usage",
    );
    push_filters(&mut builder, &q);
    builder.push(" GROUP BY model ORDER BY total_tokens DESC");

    let rows = builder.build().fetch_all(&state.db).await?;
    let summary: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "model": row.get::<String, _>("model"),
                "requests": row.get::<i64, _>("requests"),
                "prompt_tokens": row.get::<i64, _>("prompt_tokens"),
                "completion_tokens": row.get::<i64, _>("completion_tokens"),
                "total_tokens": row.get::<i64, _>("total_tokens"),
                "avg_latency_ms": row.get::<i64, _>("avg_latency_ms"),
            })
        })
        .collect();
    Ok(Json(json!({ "summary": summary })))
}

/// GET /admin/usage/export — CSV bounded to 50,000 rows, newest first.
pub async fn export_usage(
    State(state): State<AppState>,
    Query(q): Query<UsageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new("SELECT * FROM usage");
    push_filters(&mut builder, &q);
    builder.push(" ORDER BY ts DESC, id DESC LIMIT ").push_bind(EXPORT_ROW_CAP);

    let rows = builder.build().fetch_all(&state.db).await?;

    let mut csv = String::from(
        "id,ts,request_id,api_key_id,model,task,endpoint,prompt_tokens,completion_tokens,\
         total_tokens,latency_ms,ttft_ms,status_code\n",
    );
    for row in &rows {
        let ttft = row
            .get::<Option<i32>, _>("ttft_ms")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let key = row
            .get::<Option<Uuid>, _>("api_key_id")
            .map(|v| v.to_string())
            .unwrap_or_default();
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{}\n",
            row.get::<i64, _>("id"),
            row.get::<DateTime<Utc>, _>("ts").to_rfc3339(),
            row.get::<Uuid, _>("request_id"),
            key,
            row.get::<String, _>("model"),
            row.get::<String, _>("task"),
            row.get::<String, _>("endpoint"),
            row.get::<i32, _>("prompt_tokens"),
            row.get::<i32, _>("completion_tokens"),
            row.get::<i32, _>("total_tokens"),
            row.get::<i32, _>("latency_ms"),
            ttft,
            row.get::<i32, _>("status_code"),
        ));
    }

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"cortex-usage.csv\"",
            ),
        ],
        csv,
    ))
}
