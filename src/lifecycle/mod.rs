// Engine lifecycle controller: model CRUD, the per-model state machine,
// container start/stop through the Docker wrapper, and the progressive
// readiness probe that moves a model from loading to running (or failed,
// with a classified diagnosis).

pub mod classifier;
pub mod docker;
pub mod dryrun;
pub mod llamacpp;
pub mod vllm;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::config::Config;
use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::registry::ModelRegistry;
use docker::{ContainerSpec, ContainerStatus, DockerClient};

// ── Enums ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Vllm,
    Llamacpp,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Vllm => "vllm",
            Engine::Llamacpp => "llamacpp",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "vllm" => Some(Engine::Vllm),
            "llamacpp" => Some(Engine::Llamacpp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTask {
    Generate,
    Embed,
}

impl ModelTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTask::Generate => "generate",
            ModelTask::Embed => "embed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "generate" => Some(ModelTask::Generate),
            "embed" => Some(ModelTask::Embed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Stopped,
    Starting,
    Loading,
    Running,
    Failed,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Stopped => "stopped",
            ModelState::Starting => "starting",
            ModelState::Loading => "loading",
            ModelState::Running => "running",
            ModelState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "stopped" => Some(ModelState::Stopped),
            "starting" => Some(ModelState::Starting),
            "loading" => Some(ModelState::Loading),
            "running" => Some(ModelState::Running),
            "failed" => Some(ModelState::Failed),
            _ => None,
        }
    }
}

/// The legal edges of the per-model state machine. Anything else is a bug
/// in the caller and is rejected at the store boundary.
pub fn transition_allowed(from: ModelState, to: ModelState) -> bool {
    use ModelState::*;
    matches!(
        (from, to),
        (Stopped, Starting)
            | (Failed, Starting)
            | (Starting, Loading)
            | (Starting, Failed)
            | (Starting, Stopped)
            | (Loading, Running)
            | (Loading, Failed)
            | (Loading, Stopped)
            | (Running, Stopped)
            | (Running, Failed)
            | (Failed, Stopped)
    )
}

// ── Model row ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ModelRow {
    pub id: i64,
    pub name: String,
    pub served_model_name: String,
    pub engine: Engine,
    pub task: ModelTask,
    pub source: String,
    pub local_path: Option<String>,
    pub repo_id: Option<String>,
    pub tokenizer_override: Option<String>,
    pub hf_config_path: Option<String>,
    pub state: ModelState,
    pub container_name: Option<String>,
    pub host_port: Option<i32>,
    pub selected_gpus: Vec<i32>,
    pub engine_config: Value,
    pub request_defaults: Value,
    pub startup_timeout_sec: Option<i32>,
    pub offline_flag: bool,
    pub failure_reason: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ModelRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let engine_raw: String = row.try_get("engine")?;
        let task_raw: String = row.try_get("task")?;
        let state_raw: String = row.try_get("state")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            served_model_name: row.try_get("served_model_name")?,
            engine: Engine::parse(&engine_raw)
                .ok_or_else(|| sqlx::Error::Decode(format!("bad engine '{engine_raw}'").into()))?,
            task: ModelTask::parse(&task_raw)
                .ok_or_else(|| sqlx::Error::Decode(format!("bad task '{task_raw}'").into()))?,
            source: row.try_get("source")?,
            local_path: row.try_get("local_path")?,
            repo_id: row.try_get("repo_id")?,
            tokenizer_override: row.try_get("tokenizer_override")?,
            hf_config_path: row.try_get("hf_config_path")?,
            state: ModelState::parse(&state_raw)
                .ok_or_else(|| sqlx::Error::Decode(format!("bad state '{state_raw}'").into()))?,
            container_name: row.try_get("container_name")?,
            host_port: row.try_get("host_port")?,
            selected_gpus: row.try_get("selected_gpus")?,
            engine_config: row.try_get("engine_config")?,
            request_defaults: row.try_get("request_defaults")?,
            startup_timeout_sec: row.try_get("startup_timeout_sec")?,
            offline_flag: row.try_get("offline_flag")?,
            failure_reason: row.try_get("failure_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

const MODEL_COLUMNS: &str = "id, name, served_model_name, engine, task, source, local_path, \
     repo_id, tokenizer_override, hf_config_path, state, container_name, host_port, \
     selected_gpus, engine_config, request_defaults, startup_timeout_sec, offline_flag, \
     failure_reason, created_at, updated_at";

// ── Engine-config helpers ───────────────────────────────────────────────

/// Typed accessors over the engine_config JSON bag. Unrecognized keys stay
/// in the bag untouched.
pub(crate) struct Knobs<'a>(&'a Value);

impl<'a> Knobs<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self(value)
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        self.0.get(key)?.as_f64()
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        self.0.get(key)?.as_u64()
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.0.get(key)?.as_bool()
    }

    pub fn str(&self, key: &str) -> Option<&'a str> {
        self.0.get(key)?.as_str()
    }

    /// Number or string knob rendered as a flag value. Booleans are
    /// deliberately excluded — they render as bare flags.
    pub fn scalar_string(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn u64_list(&self, key: &str) -> Option<Vec<u64>> {
        let arr = self.0.get(key)?.as_array()?;
        arr.iter().map(|v| v.as_u64()).collect()
    }

    pub fn f64_list(&self, key: &str) -> Option<Vec<f64>> {
        let arr = self.0.get(key)?.as_array()?;
        arr.iter().map(|v| v.as_f64()).collect()
    }
}

/// The synthesized container invocation for one model.
#[derive(Debug)]
pub struct CommandPlan {
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub container_port: u16,
    pub warnings: Vec<String>,
    /// (relative path under the configs mount, content) pairs written
    /// before container creation.
    pub files: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VramEstimate {
    pub weight_bytes: u64,
    pub kv_cache_bytes: u64,
    pub overhead_bytes: u64,
    pub total_bytes: u64,
    pub capacity_bytes: u64,
    pub fits: bool,
}

pub fn single_gpu_capacity_bytes(config: &Config, ordinal: i32) -> u64 {
    let caps = &config.gpu_capacities_mb;
    let mb = caps
        .get(ordinal.max(0) as usize)
        .or_else(|| caps.last())
        .copied()
        .unwrap_or(24_576);
    mb * 1024 * 1024
}

pub fn gpu_capacity_bytes(config: &Config, ordinals: &[i32]) -> u64 {
    if ordinals.is_empty() {
        return single_gpu_capacity_bytes(config, 0);
    }
    ordinals
        .iter()
        .map(|o| single_gpu_capacity_bytes(config, *o))
        .sum()
}

// ── Requests ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateModelRequest {
    pub name: String,
    pub served_model_name: String,
    pub engine: String,
    #[serde(default)]
    pub task: Option<String>,
    pub source: String,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default)]
    pub tokenizer_override: Option<String>,
    #[serde(default)]
    pub hf_config_path: Option<String>,
    #[serde(default)]
    pub selected_gpus: Vec<i32>,
    #[serde(default)]
    pub engine_config: Option<Value>,
    #[serde(default)]
    pub request_defaults: Option<Value>,
    #[serde(default)]
    pub startup_timeout_sec: Option<i32>,
    #[serde(default)]
    pub offline_flag: bool,
}

#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
pub struct UpdateModelRequest {
    pub name: Option<String>,
    pub served_model_name: Option<String>,
    pub local_path: Option<String>,
    pub repo_id: Option<String>,
    pub tokenizer_override: Option<String>,
    pub hf_config_path: Option<String>,
    pub selected_gpus: Option<Vec<i32>>,
    pub engine_config: Option<Value>,
    pub request_defaults: Option<Value>,
    pub startup_timeout_sec: Option<i32>,
    pub offline_flag: Option<bool>,
}

// ── Controller ──────────────────────────────────────────────────────────

pub struct Controller {
    db: PgPool,
    config: Arc<Config>,
    pub docker: DockerClient,
    registry: Arc<ModelRegistry>,
    metrics: Arc<Metrics>,
    client: reqwest::Client,
    /// Per-model mutexes so start and stop cannot interleave.
    locks: tokio::sync::Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl Controller {
    pub fn new(
        db: PgPool,
        config: Arc<Config>,
        docker: DockerClient,
        registry: Arc<ModelRegistry>,
        metrics: Arc<Metrics>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            db,
            config,
            docker,
            registry,
            metrics,
            client,
            locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn model_lock(&self, id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id).or_default().clone()
    }

    pub async fn fetch(&self, id: i64) -> Result<ModelRow, ApiError> {
        sqlx::query_as::<_, ModelRow>(&format!("SELECT {MODEL_COLUMNS} FROM models WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("model {id} not found")))
    }

    pub async fn list(&self) -> Result<Vec<ModelRow>, ApiError> {
        Ok(sqlx::query_as::<_, ModelRow>(&format!(
            "SELECT {MODEL_COLUMNS} FROM models ORDER BY id"
        ))
        .fetch_all(&self.db)
        .await?)
    }

    /// Compare-and-set state transition. Fails when the edge is illegal or
    /// another actor already moved the row.
    pub async fn transition(
        &self,
        id: i64,
        from: ModelState,
        to: ModelState,
        failure: Option<&Value>,
    ) -> Result<bool, ApiError> {
        if !transition_allowed(from, to) {
            return Err(ApiError::internal(format!(
                "illegal model state transition {} -> {}",
                from.as_str(),
                to.as_str()
            )));
        }
        let result = sqlx::query(
            "UPDATE models SET state = $1, failure_reason = COALESCE($2, failure_reason), \
             updated_at = now() WHERE id = $3 AND state = $4",
        )
        .bind(to.as_str())
        .bind(failure)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.db)
        .await?;

        let moved = result.rows_affected() > 0;
        if moved {
            if let Ok(row) = self.fetch(id).await {
                self.metrics
                    .record_state_transition(row.engine.as_str(), to.as_str());
            }
            tracing::info!(model_id = id, from = from.as_str(), to = to.as_str(), "model state transition");
        }
        Ok(moved)
    }

    pub async fn create(&self, req: CreateModelRequest) -> Result<ModelRow, ApiError> {
        let engine = Engine::parse(&req.engine)
            .ok_or_else(|| ApiError::InvalidRequest(format!("unknown engine '{}'", req.engine)))?;
        let task = match req.task.as_deref() {
            Some(raw) => ModelTask::parse(raw)
                .ok_or_else(|| ApiError::InvalidRequest(format!("unknown task '{raw}'")))?,
            None => ModelTask::Generate,
        };
        if !["local-path", "repo-id"].contains(&req.source.as_str()) {
            return Err(ApiError::InvalidRequest(format!(
                "source must be local-path or repo-id, got '{}'",
                req.source
            )));
        }
        if req.source == "local-path" && req.local_path.as_deref().unwrap_or("").is_empty() {
            return Err(ApiError::InvalidRequest("local-path source requires local_path".into()));
        }
        if req.source == "repo-id" && req.repo_id.as_deref().unwrap_or("").is_empty() {
            return Err(ApiError::InvalidRequest("repo-id source requires repo_id".into()));
        }
        if req.served_model_name.trim().is_empty() {
            return Err(ApiError::InvalidRequest("served_model_name is required".into()));
        }

        let row = sqlx::query_as::<_, ModelRow>(&format!(
            "INSERT INTO models (name, served_model_name, engine, task, source, local_path, \
             repo_id, tokenizer_override, hf_config_path, selected_gpus, engine_config, \
             request_defaults, startup_timeout_sec, offline_flag) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             RETURNING {MODEL_COLUMNS}"
        ))
        .bind(&req.name)
        .bind(req.served_model_name.trim())
        .bind(engine.as_str())
        .bind(task.as_str())
        .bind(&req.source)
        .bind(&req.local_path)
        .bind(&req.repo_id)
        .bind(&req.tokenizer_override)
        .bind(&req.hf_config_path)
        .bind(&req.selected_gpus)
        .bind(req.engine_config.unwrap_or_else(|| Value::Object(Default::default())))
        .bind(req.request_defaults.unwrap_or_else(|| Value::Object(Default::default())))
        .bind(req.startup_timeout_sec)
        .bind(req.offline_flag)
        .fetch_one(&self.db)
        .await?;

        tracing::info!(model_id = row.id, served = %row.served_model_name, "model created");
        Ok(row)
    }

    pub async fn update(&self, id: i64, patch: UpdateModelRequest) -> Result<ModelRow, ApiError> {
        let lock = self.model_lock(id).await;
        let _guard = lock.lock().await;

        let row = self.fetch(id).await?;
        if !matches!(row.state, ModelState::Stopped | ModelState::Failed) {
            return Err(ApiError::InvalidRequest(
                "model must be stopped before updating its configuration".into(),
            ));
        }

        let updated = sqlx::query_as::<_, ModelRow>(&format!(
            "UPDATE models SET \
             name = COALESCE($1, name), \
             served_model_name = COALESCE($2, served_model_name), \
             local_path = COALESCE($3, local_path), \
             repo_id = COALESCE($4, repo_id), \
             tokenizer_override = COALESCE($5, tokenizer_override), \
             hf_config_path = COALESCE($6, hf_config_path), \
             selected_gpus = COALESCE($7, selected_gpus), \
             engine_config = COALESCE($8, engine_config), \
             request_defaults = COALESCE($9, request_defaults), \
             startup_timeout_sec = COALESCE($10, startup_timeout_sec), \
             offline_flag = COALESCE($11, offline_flag), \
             updated_at = now() \
             WHERE id = $12 RETURNING {MODEL_COLUMNS}"
        ))
        .bind(&patch.name)
        .bind(&patch.served_model_name)
        .bind(&patch.local_path)
        .bind(&patch.repo_id)
        .bind(&patch.tokenizer_override)
        .bind(&patch.hf_config_path)
        .bind(&patch.selected_gpus)
        .bind(&patch.engine_config)
        .bind(&patch.request_defaults)
        .bind(patch.startup_timeout_sec)
        .bind(patch.offline_flag)
        .bind(id)
        .fetch_one(&self.db)
        .await?;
        Ok(updated)
    }

    pub async fn delete(&self, id: i64) -> Result<(), ApiError> {
        let lock = self.model_lock(id).await;
        let _guard = lock.lock().await;

        let row = self.fetch(id).await?;
        if !matches!(row.state, ModelState::Stopped | ModelState::Failed) {
            return Err(ApiError::InvalidRequest("stop the model before deleting it".into()));
        }
        if let Some(container) = row.container_name.as_deref() {
            if self.docker.available() {
                let _ = self.docker.stop_and_remove(container).await;
            }
        }
        self.registry.deregister_model(id);
        sqlx::query("DELETE FROM models WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        tracing::info!(model_id = id, "model deleted");
        Ok(())
    }

    /// Dry-run: command preview, flag vetting, VRAM estimate, plus a
    /// GPU-collision warning against other active models.
    pub async fn dry_run(&self, id: i64) -> Result<dryrun::DryRunReport, ApiError> {
        let row = self.fetch(id).await?;
        let mut report = dryrun::run(&row, &self.config);

        let peers: Vec<(i64, Vec<i32>)> = sqlx::query_as(
            "SELECT id, selected_gpus FROM models WHERE id <> $1 AND state <> 'stopped'",
        )
        .bind(id)
        .fetch_all(&self.db)
        .await?;
        for (peer_id, gpus) in peers {
            let shared: Vec<i32> = gpus
                .iter()
                .filter(|g| row.selected_gpus.contains(g))
                .copied()
                .collect();
            if !shared.is_empty() {
                report.warnings.push(format!(
                    "GPUs {shared:?} are also selected by active model {peer_id}; \
                     the gateway does not reserve ordinals"
                ));
            }
        }
        Ok(report)
    }

    fn build_plan(&self, row: &ModelRow) -> Result<CommandPlan, ApiError> {
        let plan = match row.engine {
            Engine::Vllm => vllm::build_command(row, &self.config),
            Engine::Llamacpp => llamacpp::build_command(row, &self.config),
        };
        plan.map_err(|errors| ApiError::InvalidRequest(errors.join("; ")))
    }

    async fn allocate_port(&self) -> Result<u16, ApiError> {
        let used: Vec<i32> = sqlx::query_scalar(
            "SELECT host_port FROM models WHERE host_port IS NOT NULL AND state <> 'stopped'",
        )
        .fetch_all(&self.db)
        .await?;
        let (lo, hi) = self.config.container_port_range;
        for port in lo..=hi {
            if used.contains(&i32::from(port)) {
                continue;
            }
            if std::net::TcpListener::bind(("0.0.0.0", port)).is_ok() {
                return Ok(port);
            }
        }
        Err(ApiError::unavailable("No free host port in the configured range"))
    }

    fn startup_timeout(&self, row: &ModelRow) -> Duration {
        row.startup_timeout_sec
            .filter(|s| *s > 0)
            .map(|s| Duration::from_secs(s as u64))
            .unwrap_or_else(|| self.config.startup_timeout(row.engine))
    }

    pub async fn start(self: &Arc<Self>, id: i64) -> Result<ModelRow, ApiError> {
        let lock = self.model_lock(id).await;
        let _guard = lock.lock().await;

        let row = self.fetch(id).await?;
        if !matches!(row.state, ModelState::Stopped | ModelState::Failed) {
            return Err(ApiError::InvalidRequest(format!(
                "model is {}; only stopped or failed models can be started",
                row.state.as_str()
            )));
        }

        // Dry-run invariants gate container creation.
        let report = dryrun::run(&row, &self.config);
        if !report.ok() {
            return Err(ApiError::InvalidRequest(report.errors.join("; ")));
        }
        for warning in &report.warnings {
            tracing::warn!(model_id = id, "start: {warning}");
        }

        let image = self.config.engine_image(row.engine).to_string();
        if !self.docker.image_present(&image).await? {
            return Err(ApiError::InvalidRequest(format!(
                "engine image '{image}' is not present on this host"
            )));
        }

        let plan = self.build_plan(&row)?;
        let host_port = self.allocate_port().await?;
        let container_name = format!("cortex-model-{id}");
        let timeout = self.startup_timeout(&row);

        for (rel, content) in &plan.files {
            let path = std::path::Path::new(&self.config.configs_dir).join(rel);
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| ApiError::internal(format!("write {}: {e}", path.display())))?;
        }

        let mut binds = vec![format!("{}:/models:ro", self.config.models_dir)];
        if let Some(cache) = self.config.hf_cache_dir.as_deref() {
            binds.push(format!("{cache}:/hf-cache"));
        }
        if !plan.files.is_empty() {
            binds.push(format!("{}:/configs:ro", self.config.configs_dir));
        }

        self.transition(id, row.state, ModelState::Starting, None).await?;
        sqlx::query("UPDATE models SET container_name = $1, host_port = $2, failure_reason = NULL, updated_at = now() WHERE id = $3")
            .bind(&container_name)
            .bind(i32::from(host_port))
            .bind(id)
            .execute(&self.db)
            .await?;

        let spec = ContainerSpec {
            name: container_name.clone(),
            image,
            command: plan.command,
            env: plan.env,
            container_port: plan.container_port,
            host_port,
            gpu_ordinals: row.selected_gpus.clone(),
            binds,
            network: self.config.docker_network.clone(),
            start_period: timeout,
        };

        if let Err(e) = self.docker.create_model_container(&spec).await {
            let diagnosis = serde_json::json!({
                "code": "container_create_failed",
                "message": e.to_string(),
            });
            self.transition(id, ModelState::Starting, ModelState::Failed, Some(&diagnosis))
                .await?;
            return Err(e);
        }
        if let Err(e) = self.docker.start(&container_name).await {
            let diagnosis = serde_json::json!({
                "code": "container_start_failed",
                "message": e.to_string(),
            });
            let _ = self.docker.stop_and_remove(&container_name).await;
            self.transition(id, ModelState::Starting, ModelState::Failed, Some(&diagnosis))
                .await?;
            return Err(e);
        }

        self.transition(id, ModelState::Starting, ModelState::Loading, None).await?;

        let controller = self.clone();
        let served = row.served_model_name.clone();
        let engine = row.engine;
        let task = row.task;
        tokio::spawn(async move {
            controller
                .run_readiness_probe(id, container_name, served, engine, task, host_port, timeout)
                .await;
        });

        self.fetch(id).await
    }

    /// Progressive readiness probe. Phase one watches the container itself
    /// (fast exits get classified immediately); phase two polls the
    /// OpenAI surface until the served-model list answers or the startup
    /// deadline passes. An admin stop flips the row out of `loading` and
    /// the probe backs off silently.
    #[allow(clippy::too_many_arguments)]
    async fn run_readiness_probe(
        &self,
        id: i64,
        container_name: String,
        served: String,
        engine: Engine,
        task: ModelTask,
        host_port: u16,
        timeout: Duration,
    ) {
        let upstream_url = format!("http://127.0.0.1:{host_port}");
        let deadline = Instant::now() + timeout;

        // Phase one: 5 seconds of container-status polling at 500ms.
        let phase_one_end = Instant::now() + Duration::from_secs(5);
        while Instant::now() < phase_one_end {
            match self.docker.inspect_status(&container_name).await {
                Ok(ContainerStatus::Exited(code)) => {
                    self.fail_with_logs(id, &container_name, &format!("container exited with code {code}"))
                        .await;
                    return;
                }
                Ok(ContainerStatus::Missing) => {
                    self.fail_with_logs(id, &container_name, "container disappeared during startup")
                        .await;
                    return;
                }
                _ => {}
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        // Phase two: liveness + served-model readiness every 2 seconds.
        while Instant::now() < deadline {
            match self.current_state(id).await {
                Some(ModelState::Loading) => {}
                // Stopped by an admin (or already advanced): stand down.
                _ => return,
            }

            if let Ok(ContainerStatus::Exited(code)) = self.docker.inspect_status(&container_name).await
            {
                self.fail_with_logs(id, &container_name, &format!("container exited with code {code}"))
                    .await;
                return;
            }

            let ready = crate::registry::probe_upstream(
                &self.client,
                &upstream_url,
                &served,
                &self.config.internal_upstream_secret,
                self.config.health_probe_timeout,
            )
            .await;
            self.metrics.record_probe(ready);

            if ready {
                match self.transition(id, ModelState::Loading, ModelState::Running, None).await {
                    Ok(true) => {
                        self.registry.register(Some(id), &served, &upstream_url, engine, task);
                        tracing::info!(model_id = id, served = %served, "model is running");
                    }
                    _ => tracing::debug!(model_id = id, "readiness beaten by a concurrent transition"),
                }
                return;
            }

            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        self.fail_with_logs(
            id,
            &container_name,
            &format!("readiness deadline of {}s passed", timeout.as_secs()),
        )
        .await;
    }

    async fn current_state(&self, id: i64) -> Option<ModelState> {
        sqlx::query_scalar::<_, String>("SELECT state FROM models WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .ok()
            .flatten()
            .and_then(|raw| ModelState::parse(&raw))
    }

    async fn fail_with_logs(&self, id: i64, container_name: &str, reason: &str) {
        let excerpt = self
            .docker
            .logs_tail(container_name, 100)
            .await
            .unwrap_or_default();
        let diagnosis = classifier::classify(&excerpt);
        let mut value = serde_json::to_value(&diagnosis).unwrap_or_default();
        value["reason"] = Value::String(reason.to_string());

        for from in [ModelState::Loading, ModelState::Starting] {
            if let Ok(true) = self.transition(id, from, ModelState::Failed, Some(&value)).await {
                tracing::warn!(
                    model_id = id,
                    code = diagnosis.code,
                    reason,
                    "model failed: {} ({})",
                    diagnosis.message,
                    diagnosis.fix_hint
                );
                return;
            }
        }
    }

    pub async fn stop(&self, id: i64) -> Result<ModelRow, ApiError> {
        let lock = self.model_lock(id).await;
        let _guard = lock.lock().await;

        let row = self.fetch(id).await?;
        if row.state == ModelState::Stopped {
            return Ok(row);
        }

        if let Some(container) = row.container_name.as_deref() {
            self.docker.stop_and_remove(container).await?;
        }
        self.registry.deregister_model(id);

        // An interrupted `loading` goes straight to stopped — that path
        // deliberately skips the failure classifier.
        self.transition(id, row.state, ModelState::Stopped, None).await?;
        sqlx::query(
            "UPDATE models SET container_name = NULL, host_port = NULL, updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.db)
        .await?;

        self.fetch(id).await
    }

    /// Fire a minimal request at a running model and relay the result.
    pub async fn test_model(&self, id: i64) -> Result<Value, ApiError> {
        let row = self.fetch(id).await?;
        if row.state != ModelState::Running {
            return Err(ApiError::InvalidRequest(format!(
                "model is {}; test requires a running model",
                row.state.as_str()
            )));
        }
        let port = row
            .host_port
            .ok_or_else(|| ApiError::internal("running model without a host port"))?;
        let base = format!("http://127.0.0.1:{port}");

        let started = Instant::now();
        let (path, body) = match row.task {
            ModelTask::Generate => (
                "/v1/chat/completions",
                serde_json::json!({
                    "model": row.served_model_name,
                    "messages": [{"role": "user", "content": "ping"}],
                    "max_tokens": 8,
                }),
            ),
            ModelTask::Embed => (
                "/v1/embeddings",
                serde_json::json!({"model": row.served_model_name, "input": "ping"}),
            ),
        };

        let response = self
            .client
            .post(format!("{base}{path}"))
            .bearer_auth(&self.config.internal_upstream_secret)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| ApiError::Upstream(format!("test request failed: {e}")))?;

        let status = response.status().as_u16();
        let payload: Value = response.json().await.unwrap_or(Value::Null);
        Ok(serde_json::json!({
            "status": status,
            "latency_ms": started.elapsed().as_millis() as u64,
            "response": payload,
        }))
    }

    pub async fn logs(&self, id: i64, tail: usize) -> Result<String, ApiError> {
        let row = self.fetch(id).await?;
        let container = row
            .container_name
            .ok_or_else(|| ApiError::InvalidRequest("model has no container".into()))?;
        self.docker.logs_tail(&container, tail.clamp(1, 2000)).await
    }

    /// Startup reconciliation: models persisted as `running` are re-added
    /// to the registry (the poller re-verifies them); everything else
    /// stays in its last persisted state until an admin acts.
    pub async fn reconcile(&self) -> Result<(), ApiError> {
        let rows = self.list().await?;
        for row in rows {
            if row.state == ModelState::Running {
                if let Some(port) = row.host_port {
                    self.registry.register(
                        Some(row.id),
                        &row.served_model_name,
                        &format!("http://127.0.0.1:{port}"),
                        row.engine,
                        row.task,
                    );
                }
            }
        }
        Ok(())
    }
}

// ── Test helpers ────────────────────────────────────────────────────────

#[cfg(any(test, feature = "test-helpers"))]
pub fn test_row(engine: &str, engine_config: Value) -> ModelRow {
    ModelRow {
        id: 1,
        name: "Test Model".to_string(),
        served_model_name: "test-model".to_string(),
        engine: Engine::parse(engine).expect("valid engine"),
        task: ModelTask::Generate,
        source: "repo-id".to_string(),
        local_path: None,
        repo_id: Some("org/test-model".to_string()),
        tokenizer_override: None,
        hf_config_path: None,
        state: ModelState::Stopped,
        container_name: None,
        host_port: None,
        selected_gpus: vec![0],
        engine_config,
        request_defaults: Value::Object(Default::default()),
        startup_timeout_sec: None,
        offline_flag: false,
        failure_reason: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_follow_the_state_machine() {
        use ModelState::*;
        assert!(transition_allowed(Stopped, Starting));
        assert!(transition_allowed(Starting, Loading));
        assert!(transition_allowed(Loading, Running));
        assert!(transition_allowed(Running, Stopped));
        assert!(transition_allowed(Loading, Stopped));
        assert!(transition_allowed(Failed, Starting));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        use ModelState::*;
        assert!(!transition_allowed(Stopped, Running));
        assert!(!transition_allowed(Stopped, Loading));
        assert!(!transition_allowed(Running, Starting));
        assert!(!transition_allowed(Running, Loading));
        assert!(!transition_allowed(Stopped, Stopped));
        assert!(!transition_allowed(Failed, Running));
    }

    #[test]
    fn knobs_read_types_strictly() {
        let cfg = serde_json::json!({
            "a": 1.5, "b": 7, "c": true, "d": "text", "list": [1, 2], "floats": [0.5, 0.5]
        });
        let knobs = Knobs::new(&cfg);
        assert_eq!(knobs.f64("a"), Some(1.5));
        assert_eq!(knobs.u64("b"), Some(7));
        assert_eq!(knobs.bool("c"), Some(true));
        assert_eq!(knobs.str("d"), Some("text"));
        assert_eq!(knobs.u64_list("list"), Some(vec![1, 2]));
        assert_eq!(knobs.f64_list("floats"), Some(vec![0.5, 0.5]));
        assert_eq!(knobs.scalar_string("c"), None, "bools are bare flags");
        assert_eq!(knobs.scalar_string("b"), Some("7".to_string()));
        assert_eq!(knobs.f64("missing"), None);
    }

    #[test]
    fn gpu_capacity_falls_back_to_last_entry() {
        let mut config = crate::test_support::minimal_config();
        config.gpu_capacities_mb = vec![24_576, 49_152];
        assert_eq!(single_gpu_capacity_bytes(&config, 0), 24_576 << 20);
        assert_eq!(single_gpu_capacity_bytes(&config, 1), 49_152 << 20);
        assert_eq!(single_gpu_capacity_bytes(&config, 7), 49_152 << 20);
        assert_eq!(
            gpu_capacity_bytes(&config, &[0, 1]),
            (24_576u64 << 20) + (49_152u64 << 20)
        );
    }
}
