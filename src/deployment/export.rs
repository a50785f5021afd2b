// Deployment export: engine images, a database dump, redacted model
// manifests and (optionally) the models directory, described by a
// manifest.json carrying SHA-256 digests for everything written.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::deployment::{ExportManifest, JobHandle, ManifestEntry, REDACTION_MARKER};
use crate::lifecycle::ModelRow;
use crate::state::AppState;

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ExportOptions {
    pub output_dir: String,
    #[serde(default = "default_true")]
    pub include_images: bool,
    #[serde(default = "default_true")]
    pub include_db: bool,
    #[serde(default = "default_true")]
    pub include_manifests: bool,
    #[serde(default)]
    pub archive_models: bool,
}

/// Replace anything credential-shaped in the engine config. Returns true
/// when something was redacted. `tokenizer_override` and friends are not
/// credentials — only token/secret-named keys and hub-token-shaped values
/// are touched.
pub fn redact_engine_config(config: &mut Value) -> bool {
    let Some(map) = config.as_object_mut() else {
        return false;
    };
    let mut redacted = false;
    for (key, value) in map.iter_mut() {
        let credential_key = (key.contains("token") && !key.contains("tokenizer"))
            || key.contains("secret")
            || key.contains("api_key");
        let credential_value = value
            .as_str()
            .map(|s| s.starts_with("hf_") && s.len() > 10)
            .unwrap_or(false);
        if (credential_key || credential_value) && value.is_string() {
            *value = Value::String(REDACTION_MARKER.to_string());
            redacted = true;
        } else if value.is_object() {
            redacted |= redact_engine_config(value);
        }
    }
    redacted
}

pub fn model_manifest(row: &ModelRow) -> (Value, bool) {
    let mut engine_config = row.engine_config.clone();
    let redacted = redact_engine_config(&mut engine_config);
    let manifest = json!({
        "manifest_version": 1,
        "name": row.name,
        "served_model_name": row.served_model_name,
        "engine": row.engine.as_str(),
        "task": row.task.as_str(),
        "source": row.source,
        "local_path": row.local_path,
        "repo_id": row.repo_id,
        "tokenizer_override": row.tokenizer_override,
        "hf_config_path": row.hf_config_path,
        "selected_gpus": row.selected_gpus,
        "engine_config": engine_config,
        "request_defaults": row.request_defaults,
        "startup_timeout_sec": row.startup_timeout_sec,
        "offline_flag": row.offline_flag,
        "tokens_redacted": redacted,
    });
    (manifest, redacted)
}

fn sanitize_image_name(image: &str) -> String {
    image
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

async fn dump_database(database_url: &str, dest: &Path) -> Result<(), String> {
    let output = tokio::process::Command::new("pg_dump")
        .arg("--dbname")
        .arg(database_url)
        .arg("--no-owner")
        .arg("--file")
        .arg(dest)
        .output()
        .await
        .map_err(|e| format!("failed to run pg_dump: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "pg_dump exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(())
}

fn archive_directory(src: &str, dest: &Path) -> Result<(), String> {
    let file = std::fs::File::create(dest).map_err(|e| format!("create {}: {e}", dest.display()))?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all("models", src)
        .map_err(|e| format!("archive {src}: {e}"))?;
    builder
        .into_inner()
        .and_then(|enc| enc.finish())
        .map_err(|e| format!("finish archive: {e}"))?;
    Ok(())
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Remove partial output on cancellation so an aborted export cannot be
/// mistaken for a complete one.
async fn cleanup_partial(root: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(root).await {
        tracing::warn!("failed to remove partial export at {}: {e}", root.display());
    }
}

pub async fn run_export(
    state: &AppState,
    handle: &JobHandle,
    options: ExportOptions,
) -> Result<Value, String> {
    let root = PathBuf::from(&options.output_dir);
    tokio::fs::create_dir_all(&root)
        .await
        .map_err(|e| format!("create {}: {e}", root.display()))?;

    let mut redacted_files: Vec<String> = Vec::new();

    // Engine images.
    if options.include_images {
        handle.set_step("exporting images", 0.05);
        let images_dir = root.join("images");
        tokio::fs::create_dir_all(&images_dir)
            .await
            .map_err(|e| format!("create {}: {e}", images_dir.display()))?;

        let mut images = vec![
            state.config.vllm_image.clone(),
            state.config.llamacpp_image.clone(),
        ];
        images.dedup();
        for (i, image) in images.iter().enumerate() {
            if handle.cancelled() {
                cleanup_partial(&root).await;
                return Err("export cancelled".to_string());
            }
            handle.set_step(
                &format!("exporting image {image}"),
                0.05 + 0.3 * (i as f32 / images.len() as f32),
            );
            let dest = images_dir.join(format!("{}.tar", sanitize_image_name(image)));
            if state.lifecycle.docker.image_present(image).await.unwrap_or(false) {
                state
                    .lifecycle
                    .docker
                    .export_image(image, &dest)
                    .await
                    .map_err(|e| e.to_string())?;
            } else {
                tracing::warn!(image = %image, "export: image not present, skipping");
            }
        }
    }

    // Database dump.
    if options.include_db {
        if handle.cancelled() {
            cleanup_partial(&root).await;
            return Err("export cancelled".to_string());
        }
        handle.set_step("dumping database", 0.4);
        let db_dir = root.join("db");
        tokio::fs::create_dir_all(&db_dir)
            .await
            .map_err(|e| format!("create {}: {e}", db_dir.display()))?;
        dump_database(&state.config.database_url, &db_dir.join("cortex.sql")).await?;
    }

    // Model manifests with credential redaction.
    if options.include_manifests {
        handle.set_step("writing model manifests", 0.55);
        let manifests_dir = root.join("manifests");
        tokio::fs::create_dir_all(&manifests_dir)
            .await
            .map_err(|e| format!("create {}: {e}", manifests_dir.display()))?;

        let rows = state.lifecycle.list().await.map_err(|e| e.to_string())?;
        for row in &rows {
            let (manifest, redacted) = model_manifest(row);
            let rel = format!("manifests/model-{}.json", row.id);
            let path = root.join(&rel);
            let pretty = serde_json::to_string_pretty(&manifest)
                .map_err(|e| format!("serialize manifest: {e}"))?;
            tokio::fs::write(&path, pretty)
                .await
                .map_err(|e| format!("write {}: {e}", path.display()))?;
            if redacted {
                redacted_files.push(rel);
            }
        }
    }

    // Optional models directory archive (large; runs on the blocking pool).
    if options.archive_models {
        if handle.cancelled() {
            cleanup_partial(&root).await;
            return Err("export cancelled".to_string());
        }
        handle.set_step("archiving models directory", 0.65);
        let models_root = root.join("models");
        tokio::fs::create_dir_all(&models_root)
            .await
            .map_err(|e| format!("create {}: {e}", models_root.display()))?;
        let src = state.config.models_dir.clone();
        let dest = models_root.join("models.tar.gz");
        tokio::task::spawn_blocking(move || archive_directory(&src, &dest))
            .await
            .map_err(|e| format!("archive task panicked: {e}"))??;
    }

    if handle.cancelled() {
        cleanup_partial(&root).await;
        return Err("export cancelled".to_string());
    }

    // Manifest last: it describes everything else.
    handle.set_step("hashing export contents", 0.85);
    let hash_root = root.clone();
    let files: Vec<ManifestEntry> = tokio::task::spawn_blocking(move || {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&hash_root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = relative_path(&hash_root, entry.path());
            if rel == "manifest.json" {
                continue;
            }
            let sha256 = match crate::deployment::sha256_file(entry.path()) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!("hash {rel}: {e}");
                    continue;
                }
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push(ManifestEntry {
                path: rel,
                sha256,
                size,
                redacted: false,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    })
    .await
    .map_err(|e| format!("hash task panicked: {e}"))?;

    let files: Vec<ManifestEntry> = files
        .into_iter()
        .map(|mut entry| {
            entry.redacted = redacted_files.contains(&entry.path);
            entry
        })
        .collect();

    let manifest = ExportManifest {
        created_at: Utc::now(),
        gateway_version: env!("CARGO_PKG_VERSION").to_string(),
        files,
    };
    let manifest_json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| format!("serialize manifest.json: {e}"))?;
    tokio::fs::write(root.join("manifest.json"), manifest_json)
        .await
        .map_err(|e| format!("write manifest.json: {e}"))?;

    handle.set_step("done", 1.0);
    Ok(json!({
        "output_dir": options.output_dir,
        "file_count": manifest.files.len(),
        "redacted_files": redacted_files,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::test_row;

    #[test]
    fn hub_tokens_are_redacted_by_key_and_value() {
        let mut config = json!({
            "hf_token": "hf_abcdefghijklmnop",
            "auth_token": "whatever",
            "nested": {"api_key": "xyz"},
            "tokenizer_override": "org/tok",
            "ngl": 32,
        });
        assert!(redact_engine_config(&mut config));
        assert_eq!(config["hf_token"], REDACTION_MARKER);
        assert_eq!(config["auth_token"], REDACTION_MARKER);
        assert_eq!(config["nested"]["api_key"], REDACTION_MARKER);
        // Not credentials:
        assert_eq!(config["tokenizer_override"], "org/tok");
        assert_eq!(config["ngl"], 32);
    }

    #[test]
    fn bare_hub_token_value_is_caught_anywhere() {
        let mut config = json!({"download_auth": "hf_ZZZZZZZZZZZZZZZZZZ"});
        assert!(redact_engine_config(&mut config));
        assert_eq!(config["download_auth"], REDACTION_MARKER);
    }

    #[test]
    fn clean_config_reports_no_redaction() {
        let mut config = json!({"ngl": 32, "context_size": 8192});
        assert!(!redact_engine_config(&mut config));
    }

    #[test]
    fn model_manifest_flags_redaction() {
        let row = test_row("llamacpp", json!({"hf_token": "hf_secretsecretsecret"}));
        let (manifest, redacted) = model_manifest(&row);
        assert!(redacted);
        assert_eq!(manifest["tokens_redacted"], true);
        assert_eq!(manifest["engine_config"]["hf_token"], REDACTION_MARKER);
    }

    #[test]
    fn image_names_sanitize_to_filenames() {
        assert_eq!(
            sanitize_image_name("vllm/vllm-openai:latest"),
            "vllm_vllm-openai_latest"
        );
    }
}
