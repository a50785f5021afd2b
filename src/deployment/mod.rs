// Deployment migration engine: a singleton in-process job that exports or
// imports images, the database and model manifests, with SHA-256
// verification on the way back in. Submitting work while a job runs
// returns the running job's status instead of queueing.

pub mod export;
pub mod import;

use std::sync::{Arc, Mutex, RwLock};

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub const REDACTION_MARKER: &str = "[REDACTED]";

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: Uuid,
    pub job_type: String,
    pub status: String,
    pub progress: f32,
    pub step: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
}

impl JobStatus {
    fn terminal(&self) -> bool {
        matches!(self.status.as_str(), "succeeded" | "failed" | "cancelled")
    }
}

struct ActiveJob {
    status: Arc<RwLock<JobStatus>>,
    cancel: CancellationToken,
}

/// Singleton job slot. `begin` hands out a handle or the running job's
/// current status.
#[derive(Default)]
pub struct Jobs {
    current: Mutex<Option<ActiveJob>>,
}

impl Jobs {
    pub fn begin(&self, job_type: &str) -> Result<JobHandle, JobStatus> {
        let mut slot = self.current.lock().expect("jobs mutex poisoned");
        if let Some(active) = slot.as_ref() {
            let status = active.status.read().expect("job status poisoned").clone();
            if !status.terminal() {
                return Err(status);
            }
        }

        let status = Arc::new(RwLock::new(JobStatus {
            id: Uuid::now_v7(),
            job_type: job_type.to_string(),
            status: "running".to_string(),
            progress: 0.0,
            step: "starting".to_string(),
            started_at: Some(Utc::now()),
            finished_at: None,
            result: None,
        }));
        let cancel = CancellationToken::new();
        *slot = Some(ActiveJob {
            status: status.clone(),
            cancel: cancel.clone(),
        });
        Ok(JobHandle { status, cancel })
    }

    pub fn status(&self) -> Option<JobStatus> {
        self.current
            .lock()
            .expect("jobs mutex poisoned")
            .as_ref()
            .map(|a| a.status.read().expect("job status poisoned").clone())
    }

    /// Request cooperative cancellation of the running job.
    pub fn cancel(&self) -> bool {
        let slot = self.current.lock().expect("jobs mutex poisoned");
        match slot.as_ref() {
            Some(active) if !active.status.read().expect("job status poisoned").terminal() => {
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobHandle {
    status: Arc<RwLock<JobStatus>>,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.status.read().expect("job status poisoned").id
    }

    pub fn set_step(&self, step: &str, progress: f32) {
        let mut status = self.status.write().expect("job status poisoned");
        status.step = step.to_string();
        status.progress = progress.clamp(0.0, 1.0);
        tracing::info!(job = %status.id, step, progress, "deployment job progress");
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn finish(&self, outcome: Result<Value, String>) {
        let mut status = self.status.write().expect("job status poisoned");
        status.finished_at = Some(Utc::now());
        match outcome {
            Ok(result) => {
                status.status = "succeeded".to_string();
                status.progress = 1.0;
                status.result = Some(result);
            }
            Err(message) => {
                status.status = if self.cancel.is_cancelled() {
                    "cancelled".to_string()
                } else {
                    "failed".to_string()
                };
                status.result = Some(json!({ "error": message }));
            }
        }
    }

    pub fn snapshot(&self) -> JobStatus {
        self.status.read().expect("job status poisoned").clone()
    }
}

/// Persist the job's terminal state for the admin history view.
async fn persist_job(db: &sqlx::PgPool, status: &JobStatus) {
    let result = sqlx::query(
        "INSERT INTO deployment_jobs (id, job_type, status, progress, step, started_at, finished_at, result) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (id) DO UPDATE SET status = $3, progress = $4, step = $5, finished_at = $7, result = $8",
    )
    .bind(status.id)
    .bind(&status.job_type)
    .bind(&status.status)
    .bind(status.progress)
    .bind(&status.step)
    .bind(status.started_at)
    .bind(status.finished_at)
    .bind(&status.result)
    .execute(db)
    .await;
    if let Err(e) = result {
        tracing::warn!("failed to persist deployment job: {e}");
    }
}

// ── Hashing helpers (shared by export and import) ───────────────────────

pub fn sha256_file(path: &std::path::Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub sha256: String,
    pub size: u64,
    #[serde(default)]
    pub redacted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub created_at: DateTime<Utc>,
    pub gateway_version: String,
    pub files: Vec<ManifestEntry>,
}

// ── HTTP handlers ───────────────────────────────────────────────────────

fn job_response(state: &AppState, handle: &JobHandle) -> Json<Value> {
    let status = handle.snapshot();
    let db = state.db.clone();
    let snapshot = status.clone();
    tokio::spawn(async move { persist_job(&db, &snapshot).await });
    Json(serde_json::to_value(status).unwrap_or_default())
}

/// POST /admin/deployment/export
pub async fn start_export(
    State(state): State<AppState>,
    Json(options): Json<export::ExportOptions>,
) -> Result<Json<Value>, ApiError> {
    let handle = match state.jobs.begin("export") {
        Ok(handle) => handle,
        Err(running) => return Ok(Json(serde_json::to_value(running).unwrap_or_default())),
    };

    let response = job_response(&state, &handle);
    let task_state = state.clone();
    let task_handle = handle.clone();
    tokio::spawn(async move {
        let outcome = export::run_export(&task_state, &task_handle, options).await;
        task_handle.finish(outcome);
        persist_job(&task_state.db, &task_handle.snapshot()).await;
    });
    Ok(response)
}

/// POST /admin/deployment/import-db
pub async fn start_import_db(
    State(state): State<AppState>,
    Json(options): Json<import::ImportDbOptions>,
) -> Result<Json<Value>, ApiError> {
    let handle = match state.jobs.begin("import-db") {
        Ok(handle) => handle,
        Err(running) => return Ok(Json(serde_json::to_value(running).unwrap_or_default())),
    };

    let response = job_response(&state, &handle);
    let task_state = state.clone();
    let task_handle = handle.clone();
    tokio::spawn(async move {
        let outcome = import::run_import_db(&task_state, &task_handle, options).await;
        task_handle.finish(outcome);
        persist_job(&task_state.db, &task_handle.snapshot()).await;
    });
    Ok(response)
}

/// POST /admin/deployment/import-model
pub async fn start_import_model(
    State(state): State<AppState>,
    Json(options): Json<import::ImportModelOptions>,
) -> Result<Json<Value>, ApiError> {
    let handle = match state.jobs.begin("import-model") {
        Ok(handle) => handle,
        Err(running) => return Ok(Json(serde_json::to_value(running).unwrap_or_default())),
    };

    let response = job_response(&state, &handle);
    let task_state = state.clone();
    let task_handle = handle.clone();
    tokio::spawn(async move {
        let outcome = import::run_import_model(&task_state, &task_handle, options).await;
        task_handle.finish(outcome);
        persist_job(&task_state.db, &task_handle.snapshot()).await;
    });
    Ok(response)
}

/// GET /admin/deployment/status
pub async fn job_status(State(state): State<AppState>) -> Json<Value> {
    match state.jobs.status() {
        Some(status) => Json(serde_json::to_value(status).unwrap_or_default()),
        None => Json(json!({ "status": "idle" })),
    }
}

/// POST /admin/deployment/cancel
pub async fn cancel_job(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "cancelled": state.jobs.cancel() }))
}

#[derive(Deserialize)]
pub struct ManifestsQuery {
    pub dir: String,
}

/// GET /admin/deployment/model-manifests?dir=…
pub async fn list_model_manifests(
    State(_state): State<AppState>,
    Query(q): Query<ManifestsQuery>,
) -> Result<Json<Value>, ApiError> {
    let manifests = import::scan_manifests(&q.dir)
        .map_err(|e| ApiError::InvalidRequest(e))?;
    Ok(Json(json!({ "manifests": manifests })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_returns_running_job() {
        let jobs = Jobs::default();
        let handle = jobs.begin("export").unwrap();
        let running = jobs.begin("export").unwrap_err();
        assert_eq!(running.id, handle.id());
        assert_eq!(running.status, "running");
    }

    #[test]
    fn terminal_job_frees_the_slot() {
        let jobs = Jobs::default();
        let handle = jobs.begin("export").unwrap();
        handle.finish(Ok(json!({"done": true})));
        assert!(jobs.begin("import-db").is_ok());
    }

    #[test]
    fn progress_is_monotonic_to_terminal() {
        let jobs = Jobs::default();
        let handle = jobs.begin("export").unwrap();
        handle.set_step("images", 0.3);
        assert!((handle.snapshot().progress - 0.3).abs() < f32::EPSILON);
        handle.finish(Ok(json!({})));
        let done = handle.snapshot();
        assert_eq!(done.status, "succeeded");
        assert!((done.progress - 1.0).abs() < f32::EPSILON);
        assert!(done.finished_at.is_some());
    }

    #[test]
    fn cancel_marks_job_cancelled() {
        let jobs = Jobs::default();
        let handle = jobs.begin("export").unwrap();
        assert!(jobs.cancel());
        assert!(handle.cancelled());
        handle.finish(Err("interrupted".into()));
        assert_eq!(handle.snapshot().status, "cancelled");
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, b"cortex").unwrap();
        let digest = sha256_file(&path).unwrap();
        assert_eq!(digest, hex::encode(Sha256::digest(b"cortex")));
    }
}
