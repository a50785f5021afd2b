// llama.cpp server engine: command-line synthesis and VRAM estimation for
// quantized GGUF weights.

use regex::Regex;

use crate::config::Config;
use crate::lifecycle::{CommandPlan, Knobs, ModelRow, ModelTask, VramEstimate};

pub const CONTAINER_PORT: u16 = 8080;

pub const ALLOWED_KEYS: &[&str] = &[
    "ngl",
    "tensor_split",
    "batch_size",
    "ubatch_size",
    "threads",
    "context_size",
    "flash_attention",
    "mlock",
    "no_mmap",
    "numa_policy",
    "rope_freq_base",
    "rope_freq_scale",
    "cache_type_k",
    "cache_type_v",
    "parallel_slots",
    "cont_batching",
    "draft_model_path",
    "draft_n",
    "draft_p_min",
    "verbose_logging",
    "log_timestamps",
    "log_colors",
    "chat_template",
    "chat_template_file",
    "jinja_enabled",
    "grammar_file",
    "system_prompt",
    "lora_adapters",
    "lora_init_without_apply",
    "check_tensors",
    "skip_warmup",
    "defrag_thold",
    "enable_embeddings",
    // Size metadata consumed by the VRAM estimator.
    "model_size_gb",
    "num_layers",
    "head_dim",
    "num_kv_heads",
];

/// Multi-part GGUF archives are addressed through their first part; the
/// engine discovers the rest.
pub fn first_part_path(path: &str) -> String {
    let re = Regex::new(r"-(\d{5})-of-(\d{5})\.gguf$").expect("static regex");
    match re.captures(path) {
        Some(caps) => {
            let total = &caps[2];
            re.replace(path, format!("-00001-of-{total}.gguf")).into_owned()
        }
        None => path.to_string(),
    }
}

fn kv_type_bytes(cache_type: &str) -> f64 {
    match cache_type {
        "q8_0" => 1.0,
        "q4_0" => 0.5,
        _ => 2.0, // f16
    }
}

pub fn build_command(row: &ModelRow, config: &Config) -> Result<CommandPlan, Vec<String>> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let knobs = Knobs::new(&row.engine_config);

    let Some(local_path) = row.local_path.as_deref().filter(|p| !p.is_empty()) else {
        return Err(vec!["quantized engine requires local_path to a GGUF file".to_string()]);
    };
    let weight = format!("/models/{}", first_part_path(local_path.trim_start_matches('/')));

    for key in ["cache_type_k", "cache_type_v"] {
        if let Some(ct) = knobs.str(key) {
            if !["f16", "q8_0", "q4_0"].contains(&ct) {
                errors.push(format!("{key} must be one of f16, q8_0, q4_0; got {ct}"));
            }
        }
    }
    if knobs.str("chat_template").is_some() && knobs.str("chat_template_file").is_some() {
        errors.push("chat_template and chat_template_file are mutually exclusive".to_string());
    }

    let mut cmd: Vec<String> = vec![
        "-m".into(),
        weight,
        "--host".into(),
        "0.0.0.0".into(),
        "--port".into(),
        CONTAINER_PORT.to_string(),
        "--alias".into(),
        row.served_model_name.clone(),
        "--api-key".into(),
        config.internal_upstream_secret.clone(),
        // Observability endpoints are non-negotiable: the gateway's health
        // poller and slot diagnostics depend on them.
        "--metrics".into(),
        "--slots".into(),
    ];

    for (key, flag) in [
        ("ngl", "-ngl"),
        ("batch_size", "-b"),
        ("ubatch_size", "-ub"),
        ("threads", "-t"),
        ("context_size", "-c"),
        ("numa_policy", "--numa"),
        ("rope_freq_base", "--rope-freq-base"),
        ("rope_freq_scale", "--rope-freq-scale"),
        ("cache_type_k", "--cache-type-k"),
        ("cache_type_v", "--cache-type-v"),
        ("parallel_slots", "--parallel"),
        ("draft_n", "--draft-max"),
        ("draft_p_min", "--draft-p-min"),
        ("defrag_thold", "--defrag-thold"),
        ("chat_template", "--chat-template"),
    ] {
        if let Some(value) = knobs.scalar_string(key) {
            cmd.push(flag.into());
            cmd.push(value);
        }
    }

    if let Some(split) = knobs.f64_list("tensor_split") {
        cmd.push("--tensor-split".into());
        cmd.push(
            split
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    if let Some(draft) = knobs.str("draft_model_path") {
        cmd.push("--model-draft".into());
        cmd.push(format!("/models/{}", draft.trim_start_matches('/')));
    }

    if knobs.bool("flash_attention").unwrap_or(false) {
        cmd.push("--flash-attn".into());
    }
    if knobs.bool("mlock").unwrap_or(false) {
        cmd.push("--mlock".into());
    }
    if knobs.bool("no_mmap").unwrap_or(false) {
        cmd.push("--no-mmap".into());
    }
    match knobs.bool("cont_batching") {
        Some(true) | None => cmd.push("--cont-batching".into()),
        Some(false) => cmd.push("--no-cont-batching".into()),
    }
    if knobs.bool("verbose_logging").unwrap_or(false) {
        cmd.push("--verbose".into());
    }
    if knobs.bool("log_timestamps").unwrap_or(false) {
        cmd.push("--log-timestamps".into());
    }
    if knobs.bool("log_colors").unwrap_or(false) {
        cmd.push("--log-colors".into());
    }
    if knobs.bool("jinja_enabled").unwrap_or(false) {
        cmd.push("--jinja".into());
    }
    if let Some(template_file) = knobs.str("chat_template_file") {
        cmd.push("--chat-template-file".into());
        cmd.push(format!("/models/{}", template_file.trim_start_matches('/')));
    }
    if let Some(grammar) = knobs.str("grammar_file") {
        cmd.push("--grammar-file".into());
        cmd.push(format!("/models/{}", grammar.trim_start_matches('/')));
    }

    // The system prompt is materialized as a file under the configs mount;
    // the controller writes it before creating the container.
    let mut files = Vec::new();
    if let Some(prompt) = knobs.str("system_prompt") {
        let rel = format!("model-{}-system-prompt.txt", row.id);
        cmd.push("--system-prompt-file".into());
        cmd.push(format!("/configs/{rel}"));
        files.push((rel, prompt.to_string()));
    }

    if let Some(adapters) = row.engine_config.get("lora_adapters").and_then(|v| v.as_array()) {
        for adapter in adapters {
            let Some(path) = adapter["path"].as_str() else {
                warnings.push("lora adapter entry without a path; skipped".to_string());
                continue;
            };
            let mounted = format!("/models/{}", path.trim_start_matches('/'));
            match adapter["scale"].as_f64() {
                Some(scale) if (scale - 1.0).abs() > f64::EPSILON => {
                    cmd.push("--lora-scaled".into());
                    cmd.push(mounted);
                    cmd.push(scale.to_string());
                }
                _ => {
                    cmd.push("--lora".into());
                    cmd.push(mounted);
                }
            }
        }
    }
    if knobs.bool("lora_init_without_apply").unwrap_or(false) {
        cmd.push("--lora-init-without-apply".into());
    }

    if knobs.bool("check_tensors").unwrap_or(true) {
        cmd.push("--check-tensors".into());
    }
    if knobs.bool("skip_warmup").unwrap_or(false) {
        cmd.push("--no-warmup".into());
    }

    if row.task == ModelTask::Embed || knobs.bool("enable_embeddings").unwrap_or(false) {
        cmd.push("--embeddings".into());
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(CommandPlan {
        command: cmd,
        env: Vec::new(),
        container_port: CONTAINER_PORT,
        warnings,
        files,
    })
}

/// Weights are already quantized: the on-disk size is the load size. The
/// GPU share scales with partial offload (ngl below the layer count) and
/// is spread by tensor_split for the per-device fit check.
pub fn estimate_vram(row: &ModelRow, config: &Config) -> VramEstimate {
    let knobs = Knobs::new(&row.engine_config);

    let weight_bytes = row
        .local_path
        .as_deref()
        .map(|p| format!("{}/{}", config.models_dir, first_part_path(p.trim_start_matches('/'))))
        .and_then(|path| std::fs::metadata(path).ok())
        .map(|meta| meta.len())
        .or_else(|| knobs.f64("model_size_gb").map(|gb| (gb * 1e9) as u64))
        .unwrap_or(4_000_000_000);

    let layers = knobs.u64("num_layers").unwrap_or(32);
    let ngl = knobs.u64("ngl").unwrap_or(layers).min(layers);
    let offload_fraction = if layers == 0 { 1.0 } else { ngl as f64 / layers as f64 };

    let context = knobs.u64("context_size").unwrap_or(4096);
    let slots = knobs.u64("parallel_slots").unwrap_or(1).max(1);
    let head_dim = knobs.u64("head_dim").unwrap_or(128);
    let kv_heads = knobs.u64("num_kv_heads").unwrap_or(8);
    let bytes_k = kv_type_bytes(knobs.str("cache_type_k").unwrap_or("f16"));
    let bytes_v = kv_type_bytes(knobs.str("cache_type_v").unwrap_or("f16"));

    let kv_cache_bytes = (context as f64
        * slots as f64
        * layers as f64
        * head_dim as f64
        * kv_heads as f64
        * (bytes_k + bytes_v)) as u64;

    let gpu_weight_bytes = (weight_bytes as f64 * offload_fraction) as u64;
    let base = gpu_weight_bytes + kv_cache_bytes;
    let overhead_bytes = base * 15 / 100;
    let total_bytes = (base + overhead_bytes) * 110 / 100;

    let capacity_bytes = crate::lifecycle::gpu_capacity_bytes(config, &row.selected_gpus);

    // With an explicit tensor split, the largest share must also fit its
    // device; the summed capacity alone can hide a lopsided split.
    let mut fits = total_bytes <= capacity_bytes;
    if let Some(split) = knobs.f64_list("tensor_split") {
        let sum: f64 = split.iter().sum();
        if sum > 0.0 {
            for (i, share) in split.iter().enumerate() {
                let device_bytes = (total_bytes as f64 * share / sum) as u64;
                let ordinal = row.selected_gpus.get(i).copied().unwrap_or(0);
                let device_capacity = crate::lifecycle::single_gpu_capacity_bytes(config, ordinal);
                if device_bytes > device_capacity {
                    fits = false;
                }
            }
        }
    }

    VramEstimate {
        weight_bytes: gpu_weight_bytes,
        kv_cache_bytes,
        overhead_bytes,
        total_bytes,
        capacity_bytes,
        fits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::test_row;
    use serde_json::json;

    fn config() -> Config {
        crate::test_support::minimal_config()
    }

    fn gguf_row(cfg: serde_json::Value) -> ModelRow {
        let mut row = test_row("llamacpp", cfg);
        row.local_path = Some("llama-7b/model.gguf".to_string());
        row
    }

    #[test]
    fn multi_part_archives_resolve_to_first_part() {
        assert_eq!(
            first_part_path("qwen-72b-00003-of-00009.gguf"),
            "qwen-72b-00001-of-00009.gguf"
        );
        assert_eq!(first_part_path("single.gguf"), "single.gguf");
        assert_eq!(first_part_path("dir/part-00001-of-00002.gguf"), "dir/part-00001-of-00002.gguf");
    }

    #[test]
    fn command_always_exposes_metrics_and_slots() {
        let plan = build_command(&gguf_row(json!({})), &config()).unwrap();
        let cmd = plan.command.join(" ");
        assert!(cmd.contains("--metrics"));
        assert!(cmd.contains("--slots"));
        assert!(cmd.contains("--alias test-model"));
        assert!(cmd.contains("--check-tensors"), "check_tensors defaults on");
        assert!(cmd.contains("--cont-batching"));
    }

    #[test]
    fn missing_local_path_is_an_error() {
        let row = test_row("llamacpp", json!({}));
        assert!(build_command(&row, &config()).is_err());
    }

    #[test]
    fn chat_template_conflict_is_an_error() {
        let row = gguf_row(json!({"chat_template": "chatml", "chat_template_file": "t.jinja"}));
        let errors = build_command(&row, &config()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("mutually exclusive")));
    }

    #[test]
    fn bad_cache_type_is_an_error() {
        let row = gguf_row(json!({"cache_type_k": "q5_1"}));
        assert!(build_command(&row, &config()).is_err());
    }

    #[test]
    fn system_prompt_materializes_a_config_file() {
        let row = gguf_row(json!({"system_prompt": "You are terse."}));
        let plan = build_command(&row, &config()).unwrap();
        assert_eq!(plan.files.len(), 1);
        assert!(plan.files[0].0.contains("system-prompt"));
        assert_eq!(plan.files[0].1, "You are terse.");
        assert!(plan.command.join(" ").contains("--system-prompt-file /configs/"));
    }

    #[test]
    fn lora_adapters_render_plain_and_scaled() {
        let row = gguf_row(json!({"lora_adapters": [
            {"path": "loras/a.gguf"},
            {"path": "loras/b.gguf", "scale": 0.5}
        ]}));
        let plan = build_command(&row, &config()).unwrap();
        let cmd = plan.command.join(" ");
        assert!(cmd.contains("--lora /models/loras/a.gguf"));
        assert!(cmd.contains("--lora-scaled /models/loras/b.gguf 0.5"));
    }

    #[test]
    fn embeddings_flag_follows_task() {
        let mut row = gguf_row(json!({}));
        row.task = ModelTask::Embed;
        let plan = build_command(&row, &config()).unwrap();
        assert!(plan.command.contains(&"--embeddings".to_string()));
    }

    #[test]
    fn partial_offload_reduces_gpu_weight_share() {
        let full = gguf_row(json!({"model_size_gb": 8.0, "num_layers": 32, "ngl": 32}));
        let half = gguf_row(json!({"model_size_gb": 8.0, "num_layers": 32, "ngl": 16}));
        let cfg = config();
        let a = estimate_vram(&full, &cfg);
        let b = estimate_vram(&half, &cfg);
        assert_eq!(b.weight_bytes * 2, a.weight_bytes);
    }

    #[test]
    fn kv_cache_scales_with_cache_type() {
        let f16 = gguf_row(json!({"model_size_gb": 8.0, "cache_type_k": "f16", "cache_type_v": "f16"}));
        let q4 = gguf_row(json!({"model_size_gb": 8.0, "cache_type_k": "q4_0", "cache_type_v": "q4_0"}));
        let cfg = config();
        assert_eq!(
            estimate_vram(&f16, &cfg).kv_cache_bytes,
            estimate_vram(&q4, &cfg).kv_cache_bytes * 4
        );
    }
}
