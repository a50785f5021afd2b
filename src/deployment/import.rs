// Deployment import: checksum verification against manifest.json, database
// restore with optional pre-restore backup, and model re-creation from
// exported manifests (always landing in `stopped`, never with tokens).

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::deployment::{sha256_file, ExportManifest, JobHandle, REDACTION_MARKER};
use crate::lifecycle::CreateModelRequest;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ImportDbOptions {
    pub dir: String,
    #[serde(default = "default_true")]
    pub pre_restore_backup: bool,
    #[serde(default)]
    pub drop_existing: bool,
    #[serde(default)]
    pub override_checksums: bool,
}

#[derive(Debug, Deserialize)]
pub struct ImportModelOptions {
    pub dir: String,
    /// Path of the manifest file relative to `dir` (e.g.
    /// `manifests/model-3.json`).
    pub manifest: String,
    #[serde(default)]
    pub rename_on_conflict: bool,
    #[serde(default)]
    pub override_checksums: bool,
}

fn default_true() -> bool {
    true
}

/// Verify every file named in manifest.json. A single mismatch aborts the
/// operation unless explicitly overridden.
pub async fn verify_checksums(dir: &Path, override_checksums: bool) -> Result<usize, String> {
    let manifest_path = dir.join("manifest.json");
    let raw = tokio::fs::read_to_string(&manifest_path)
        .await
        .map_err(|e| format!("manifest.json not found in {}: {e}", dir.display()))?;
    let manifest: ExportManifest =
        serde_json::from_str(&raw).map_err(|e| format!("malformed manifest.json: {e}"))?;

    let root = dir.to_path_buf();
    let verify = tokio::task::spawn_blocking(move || -> Result<usize, String> {
        let mut verified = 0usize;
        for entry in &manifest.files {
            let path = root.join(&entry.path);
            if !path.exists() {
                return Err(format!("file_not_found: {}", entry.path));
            }
            let actual = sha256_file(&path).map_err(|e| format!("hash {}: {e}", entry.path))?;
            if actual != entry.sha256 {
                return Err(format!("checksum_mismatch: {}", entry.path));
            }
            verified += 1;
        }
        Ok(verified)
    })
    .await
    .map_err(|e| format!("verify task panicked: {e}"))?;

    match verify {
        Ok(n) => Ok(n),
        Err(e) if override_checksums => {
            tracing::warn!("checksum verification overridden: {e}");
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

async fn run_psql(database_url: &str, dump: &Path) -> Result<(), String> {
    let output = tokio::process::Command::new("psql")
        .arg("--dbname")
        .arg(database_url)
        .arg("-v")
        .arg("ON_ERROR_STOP=1")
        // Apply the dump inside one transaction where the dump allows it.
        .arg("--single-transaction")
        .arg("--file")
        .arg(dump)
        .output()
        .await
        .map_err(|e| format!("failed to run psql: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "psql exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(())
}

async fn backup_current_db(state: &AppState, dir: &Path) -> Result<PathBuf, String> {
    let backup_dir = dir.join("pre_restore_backup");
    tokio::fs::create_dir_all(&backup_dir)
        .await
        .map_err(|e| format!("create {}: {e}", backup_dir.display()))?;
    let dest = backup_dir.join(format!("cortex-{}.sql", Utc::now().format("%Y%m%dT%H%M%S")));
    let output = tokio::process::Command::new("pg_dump")
        .arg("--dbname")
        .arg(&state.config.database_url)
        .arg("--no-owner")
        .arg("--file")
        .arg(&dest)
        .output()
        .await
        .map_err(|e| format!("failed to run pg_dump: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "pre-restore backup failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(dest)
}

const GATEWAY_TABLES: &[&str] = &[
    "usage",
    "sessions",
    "api_keys",
    "deployment_jobs",
    "models",
    "users",
    "organizations",
    "config_kv",
    "_sqlx_migrations",
];

pub async fn run_import_db(
    state: &AppState,
    handle: &JobHandle,
    options: ImportDbOptions,
) -> Result<Value, String> {
    let dir = PathBuf::from(&options.dir);
    let dump = dir.join("db").join("cortex.sql");
    if !dump.exists() {
        return Err(format!("database dump not found at {}", dump.display()));
    }

    handle.set_step("verifying checksums", 0.1);
    verify_checksums(&dir, options.override_checksums).await?;

    let backup_path = if options.pre_restore_backup {
        handle.set_step("backing up current database", 0.25);
        Some(backup_current_db(state, &dir).await?)
    } else {
        None
    };

    if handle.cancelled() {
        return Err("import cancelled".to_string());
    }

    if options.drop_existing {
        handle.set_step("dropping existing tables", 0.4);
        for table in GATEWAY_TABLES {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
                .execute(&state.db)
                .await
                .map_err(|e| format!("drop {table}: {e}"))?;
        }
    }

    handle.set_step("applying dump", 0.6);
    run_psql(&state.config.database_url, &dump).await?;

    // Whatever the dump said, no model is running in this process.
    handle.set_step("resetting model states", 0.9);
    sqlx::query(
        "UPDATE models SET state = 'stopped', container_name = NULL, host_port = NULL, \
         updated_at = now()",
    )
    .execute(&state.db)
    .await
    .map_err(|e| format!("reset model states: {e}"))?;

    handle.set_step("done", 1.0);
    Ok(json!({
        "restored_from": dump.display().to_string(),
        "pre_restore_backup": backup_path.map(|p| p.display().to_string()),
    }))
}

/// Summary of one exported model manifest, for the selection UI.
pub fn scan_manifests(dir: &str) -> Result<Vec<Value>, String> {
    let manifests_dir = Path::new(dir).join("manifests");
    let entries = std::fs::read_dir(&manifests_dir)
        .map_err(|e| format!("no manifests directory in {dir}: {e}"))?;

    let mut out = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(raw) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(parsed) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        out.push(json!({
            "file": format!("manifests/{}", path.file_name().unwrap_or_default().to_string_lossy()),
            "name": parsed["name"],
            "served_model_name": parsed["served_model_name"],
            "engine": parsed["engine"],
            "task": parsed["task"],
            "tokens_redacted": parsed["tokens_redacted"],
        }));
    }
    out.sort_by_key(|v| v["file"].as_str().unwrap_or_default().to_string());
    Ok(out)
}

/// Strip redaction markers so an imported model never carries a
/// placeholder where a credential used to be.
fn strip_redacted(config: &mut Value) {
    if let Some(map) = config.as_object_mut() {
        map.retain(|_, v| v.as_str() != Some(REDACTION_MARKER));
        for value in map.values_mut() {
            strip_redacted(value);
        }
    }
}

pub async fn run_import_model(
    state: &AppState,
    handle: &JobHandle,
    options: ImportModelOptions,
) -> Result<Value, String> {
    let dir = PathBuf::from(&options.dir);

    handle.set_step("verifying checksums", 0.1);
    verify_checksums(&dir, options.override_checksums).await?;

    handle.set_step("reading manifest", 0.3);
    let manifest_path = dir.join(&options.manifest);
    let raw = tokio::fs::read_to_string(&manifest_path)
        .await
        .map_err(|e| format!("manifest not found at {}: {e}", manifest_path.display()))?;
    let manifest: Value =
        serde_json::from_str(&raw).map_err(|e| format!("malformed model manifest: {e}"))?;

    let engine = manifest["engine"].as_str().unwrap_or_default().to_string();
    let mut served = manifest["served_model_name"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    if served.is_empty() {
        return Err("manifest is missing served_model_name".to_string());
    }

    // Dry-run-style checks before touching the store.
    handle.set_step("validating", 0.5);
    let image = match engine.as_str() {
        "vllm" => state.config.vllm_image.clone(),
        "llamacpp" => state.config.llamacpp_image.clone(),
        other => return Err(format!("manifest names unknown engine '{other}'")),
    };
    if state.lifecycle.docker.available()
        && !state.lifecycle.docker.image_present(&image).await.unwrap_or(false)
    {
        return Err(format!("engine image '{image}' is not present on this host"));
    }

    let offline = manifest["offline_flag"].as_bool().unwrap_or(false) || state.config.offline_mode;
    if offline {
        if let Some(local_path) = manifest["local_path"].as_str() {
            let full = Path::new(&state.config.models_dir).join(local_path.trim_start_matches('/'));
            if !full.exists() {
                return Err(format!(
                    "offline import: weight path {} does not exist",
                    full.display()
                ));
            }
        }
    }

    let conflict: Option<i64> =
        sqlx::query_scalar("SELECT id FROM models WHERE served_model_name = $1 LIMIT 1")
            .bind(&served)
            .fetch_optional(&state.db)
            .await
            .map_err(|e| format!("conflict check: {e}"))?;
    if conflict.is_some() {
        if options.rename_on_conflict {
            served = format!("{served}-imported");
        } else {
            return Err(format!(
                "name_conflict: a model named '{served}' already exists"
            ));
        }
    }

    let mut engine_config = manifest["engine_config"].clone();
    strip_redacted(&mut engine_config);

    handle.set_step("creating model", 0.8);
    let row = state
        .lifecycle
        .create(CreateModelRequest {
            name: manifest["name"].as_str().unwrap_or(&served).to_string(),
            served_model_name: served.clone(),
            engine,
            task: manifest["task"].as_str().map(|s| s.to_string()),
            source: manifest["source"].as_str().unwrap_or("local-path").to_string(),
            local_path: manifest["local_path"].as_str().map(|s| s.to_string()),
            repo_id: manifest["repo_id"].as_str().map(|s| s.to_string()),
            tokenizer_override: manifest["tokenizer_override"].as_str().map(|s| s.to_string()),
            hf_config_path: manifest["hf_config_path"].as_str().map(|s| s.to_string()),
            selected_gpus: manifest["selected_gpus"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_i64().map(|i| i as i32)).collect())
                .unwrap_or_default(),
            engine_config: Some(engine_config),
            request_defaults: Some(manifest["request_defaults"].clone()),
            startup_timeout_sec: manifest["startup_timeout_sec"].as_i64().map(|v| v as i32),
            offline_flag: manifest["offline_flag"].as_bool().unwrap_or(false),
        })
        .await
        .map_err(|e| format!("create model: {e}"))?;

    handle.set_step("done", 1.0);
    Ok(json!({
        "model_id": row.id,
        "served_model_name": row.served_model_name,
        "state": row.state,
    }))
}
