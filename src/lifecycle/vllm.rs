// vLLM engine: command-line synthesis and VRAM estimation.
//
// The engine image's entrypoint is the OpenAI-compatible server; the
// container command is just its argument list. Knobs arrive as the
// model's engine_config JSON bag — recognized keys are rendered to flags,
// unknown keys are preserved untouched (dry-run warns about them).

use crate::config::Config;
use crate::lifecycle::{CommandPlan, Knobs, ModelRow, ModelTask, VramEstimate};

/// Port the server listens on inside the container.
pub const CONTAINER_PORT: u16 = 8000;

/// Keys dry-run accepts without warning. Anything else still passes but
/// earns an `unknown flag` warning with a closest-match suggestion.
pub const ALLOWED_KEYS: &[&str] = &[
    "gpu_memory_utilization",
    "max_model_len",
    "kv_cache_dtype",
    "block_size",
    "swap_space",
    "tensor_parallel_size",
    "pipeline_parallel_size",
    "max_num_batched_tokens",
    "max_num_seqs",
    "enable_prefix_caching",
    "prefix_caching_hash_algo",
    "enable_chunked_prefill",
    "cuda_graph_sizes",
    "dtype",
    "quantization",
    "enforce_eager",
    "attention_backend",
    "trust_remote_code",
    "distributed_executor_backend",
    "speculative_config",
    // Size metadata consumed by the VRAM estimator, not the command line.
    "model_params_b",
    "num_layers",
    "head_dim",
    "num_kv_heads",
];

fn weight_path(row: &ModelRow) -> String {
    match row.local_path.as_deref() {
        Some(path) => format!("/models/{}", path.trim_start_matches('/')),
        None => row.repo_id.clone().unwrap_or_default(),
    }
}

/// Is the tokenizer override a hub repo id (as opposed to a mounted path)?
fn is_repo_id(reference: &str) -> bool {
    !reference.starts_with('/') && !reference.starts_with("./") && reference.contains('/')
}

/// Hub cache layout: `<cache>/models--org--name`.
fn repo_cached_locally(cache_dir: &str, repo_id: &str) -> bool {
    let mangled = format!("models--{}", repo_id.replace('/', "--"));
    std::path::Path::new(cache_dir).join(mangled).is_dir()
}

pub fn build_command(row: &ModelRow, config: &Config) -> Result<CommandPlan, Vec<String>> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let knobs = Knobs::new(&row.engine_config);

    let model_ref = weight_path(row);
    if model_ref.is_empty() {
        errors.push("model has neither local_path nor repo_id".to_string());
    }

    let offline = row.offline_flag || config.offline_mode;
    if offline {
        if row.source == "repo-id" {
            if let Some(repo) = row.repo_id.as_deref() {
                match config.hf_cache_dir.as_deref() {
                    Some(cache) if repo_cached_locally(cache, repo) => {}
                    Some(cache) => errors.push(format!(
                        "offline mode: repo '{repo}' is not present in the local cache at {cache}"
                    )),
                    None => errors.push(format!(
                        "offline mode: repo '{repo}' requires HF_CACHE_DIR with a pre-cached copy"
                    )),
                }
            }
        }
        if let Some(tok) = row.tokenizer_override.as_deref() {
            if is_repo_id(tok) {
                match config.hf_cache_dir.as_deref() {
                    Some(cache) if repo_cached_locally(cache, tok) => {}
                    _ => errors.push(format!(
                        "offline mode: tokenizer '{tok}' is a repo id and is not in the local cache; \
                         pre-cache it or point tokenizer_override at a local config path"
                    )),
                }
            }
        }
    }

    // GGUF weights run on this engine only in a narrow configuration.
    let is_gguf = model_ref.ends_with(".gguf");
    if is_gguf {
        if knobs.u64("tensor_parallel_size").unwrap_or(1) > 1 {
            errors.push("GGUF weights do not support tensor_parallel_size > 1".to_string());
        }
        if matches!(knobs.str("kv_cache_dtype"), Some(dt) if dt != "auto") {
            errors.push("GGUF weights require kv_cache_dtype=auto".to_string());
        }
    }

    if let Some(util) = knobs.f64("gpu_memory_utilization") {
        if !(0.0..=1.0).contains(&util) || util == 0.0 {
            errors.push(format!("gpu_memory_utilization must be in (0,1], got {util}"));
        }
    }

    let mut cmd: Vec<String> = vec![
        "--model".into(),
        model_ref,
        "--host".into(),
        "0.0.0.0".into(),
        "--port".into(),
        CONTAINER_PORT.to_string(),
        "--served-model-name".into(),
        row.served_model_name.clone(),
        "--api-key".into(),
        config.internal_upstream_secret.clone(),
    ];

    if let Some(tok) = row.tokenizer_override.as_deref() {
        cmd.push("--tokenizer".into());
        cmd.push(tok.to_string());
    }
    if let Some(hf_cfg) = row.hf_config_path.as_deref() {
        cmd.push("--hf-config-path".into());
        cmd.push(hf_cfg.to_string());
    }

    for (key, flag) in [
        ("gpu_memory_utilization", "--gpu-memory-utilization"),
        ("max_model_len", "--max-model-len"),
        ("kv_cache_dtype", "--kv-cache-dtype"),
        ("block_size", "--block-size"),
        ("swap_space", "--swap-space"),
        ("tensor_parallel_size", "--tensor-parallel-size"),
        ("pipeline_parallel_size", "--pipeline-parallel-size"),
        ("max_num_batched_tokens", "--max-num-batched-tokens"),
        ("max_num_seqs", "--max-num-seqs"),
        ("prefix_caching_hash_algo", "--prefix-caching-hash-algo"),
        ("dtype", "--dtype"),
        ("quantization", "--quantization"),
        ("distributed_executor_backend", "--distributed-executor-backend"),
    ] {
        if let Some(value) = knobs.scalar_string(key) {
            cmd.push(flag.into());
            cmd.push(value);
        }
    }

    if knobs.bool("enable_prefix_caching").unwrap_or(false) {
        cmd.push("--enable-prefix-caching".into());
    }
    if knobs.bool("enable_chunked_prefill").unwrap_or(false) {
        cmd.push("--enable-chunked-prefill".into());
    }
    if knobs.bool("enforce_eager").unwrap_or(false) {
        cmd.push("--enforce-eager".into());
    }
    if knobs.bool("trust_remote_code").unwrap_or(false) {
        cmd.push("--trust-remote-code".into());
    }
    if let Some(sizes) = knobs.u64_list("cuda_graph_sizes") {
        cmd.push("--cuda-graph-sizes".into());
        cmd.push(
            sizes
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    if let Some(spec) = row.engine_config.get("speculative_config") {
        if spec.is_object() {
            cmd.push("--speculative-config".into());
            cmd.push(spec.to_string());
        } else {
            warnings.push("speculative_config must be an object; ignored".to_string());
        }
    }
    if row.task == ModelTask::Embed {
        cmd.push("--task".into());
        cmd.push("embed".into());
    }

    // Multi-GPU coordination defaults apply unconditionally; a single-GPU
    // start just never exercises them.
    let mut env = vec![
        format!("NCCL_DEBUG={}", config.nccl_debug_level),
        "TORCH_NCCL_BLOCKING_WAIT=0".to_string(),
        "TORCH_NCCL_ASYNC_ERROR_HANDLING=1".to_string(),
        "NCCL_LAUNCH_MODE=GROUP".to_string(),
        format!(
            "TORCH_NCCL_HEARTBEAT_TIMEOUT_SEC={}",
            (config.nccl_timeout_ms / 1000).max(1)
        ),
        format!("VLLM_API_KEY={}", config.internal_upstream_secret),
    ];
    if let Some(backend) = knobs.str("attention_backend") {
        env.push(format!("VLLM_ATTENTION_BACKEND={backend}"));
    }
    if offline {
        env.push("HF_HUB_OFFLINE=1".to_string());
        env.push("TRANSFORMERS_OFFLINE=1".to_string());
    }
    if config.hf_cache_dir.is_some() {
        env.push("HF_HOME=/hf-cache".to_string());
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(CommandPlan {
        command: cmd,
        env,
        container_port: CONTAINER_PORT,
        warnings,
        files: Vec::new(),
    })
}

/// Weight bytes from declared parameter count and dtype, KV cache from
/// context geometry, then 15% runtime overhead and a 10% safety margin.
pub fn estimate_vram(row: &ModelRow, config: &Config) -> VramEstimate {
    let knobs = Knobs::new(&row.engine_config);

    let params_b = knobs.f64("model_params_b").unwrap_or(7.0);
    let dtype_bytes = match knobs.str("dtype").unwrap_or("auto") {
        "float32" | "fp32" => 4.0,
        "fp8" | "int8" => 1.0,
        "int4" | "awq" | "gptq" => 0.5,
        _ => 2.0, // auto / float16 / bfloat16
    };
    let weight_bytes = (params_b * 1e9 * dtype_bytes) as u64;

    let context = knobs.u64("max_model_len").unwrap_or(4096);
    let batch = knobs.u64("max_num_seqs").unwrap_or(256).min(1024);
    let layers = knobs.u64("num_layers").unwrap_or(32);
    let head_dim = knobs.u64("head_dim").unwrap_or(128);
    let kv_heads = knobs.u64("num_kv_heads").unwrap_or(8);
    let kv_precision = match knobs.str("kv_cache_dtype").unwrap_or("auto") {
        "fp8" | "fp8_e4m3" | "fp8_e5m2" => 1.0,
        _ => 2.0,
    };
    let kv_cache_bytes =
        (context as f64 * batch as f64 * layers as f64 * head_dim as f64 * kv_heads as f64
            * 2.0 // K and V
            * kv_precision) as u64;

    let base = weight_bytes + kv_cache_bytes;
    let overhead_bytes = base * 15 / 100;
    let total_bytes = (base + overhead_bytes) * 110 / 100;

    let capacity_bytes = crate::lifecycle::gpu_capacity_bytes(config, &row.selected_gpus);

    VramEstimate {
        weight_bytes,
        kv_cache_bytes,
        overhead_bytes,
        total_bytes,
        capacity_bytes,
        fits: total_bytes <= capacity_bytes,
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

    #[test]
    fn command_includes_served_name_and_api_key() {
        let row = test_row("vllm", json!({"gpu_memory_utilization": 0.9, "max_model_len": 8192}));
        let plan = build_command(&row, &config()).unwrap();
        let cmd = plan.command.join(" ");
        assert!(cmd.contains("--served-model-name test-model"));
        assert!(cmd.contains("--gpu-memory-utilization 0.9"));
        assert!(cmd.contains("--max-model-len 8192"));
        assert!(cmd.contains("--api-key"));
        assert_eq!(plan.container_port, CONTAINER_PORT);
    }

    #[test]
    fn boolean_knobs_render_as_bare_flags() {
        let row = test_row(
            "vllm",
            json!({"enable_prefix_caching": true, "enforce_eager": true, "trust_remote_code": false}),
        );
        let plan = build_command(&row, &config()).unwrap();
        let cmd = plan.command.join(" ");
        assert!(cmd.contains("--enable-prefix-caching"));
        assert!(cmd.contains("--enforce-eager"));
        assert!(!cmd.contains("--trust-remote-code"));
    }

    #[test]
    fn cuda_graph_sizes_join_with_commas() {
        let row = test_row("vllm", json!({"cuda_graph_sizes": [1, 2, 4, 8]}));
        let plan = build_command(&row, &config()).unwrap();
        let cmd = plan.command.join(" ");
        assert!(cmd.contains("--cuda-graph-sizes 1,2,4,8"));
    }

    fn local_row(cfg: serde_json::Value) -> ModelRow {
        let mut row = test_row("vllm", cfg);
        row.source = "local-path".to_string();
        row.repo_id = None;
        row.local_path = Some("llama-7b".to_string());
        row
    }

    #[test]
    fn offline_uncached_tokenizer_repo_fails_validation() {
        let mut row = local_row(json!({}));
        row.offline_flag = true;
        row.tokenizer_override = Some("org/some-tokenizer".to_string());
        let errors = build_command(&row, &config()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("tokenizer")));
    }

    #[test]
    fn offline_uncached_repo_weights_fail_validation() {
        let mut row = test_row("vllm", json!({}));
        row.offline_flag = true;
        let errors = build_command(&row, &config()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("not present in the local cache")
            || e.contains("pre-cached")));
    }

    #[test]
    fn offline_local_tokenizer_path_is_fine() {
        let mut row = local_row(json!({}));
        row.offline_flag = true;
        row.tokenizer_override = Some("/models/tokenizers/llama".to_string());
        assert!(build_command(&row, &config()).is_ok());
    }

    #[test]
    fn gguf_with_tensor_parallel_is_a_hard_error() {
        let mut row = test_row("vllm", json!({"tensor_parallel_size": 2}));
        row.local_path = Some("weights/model.gguf".to_string());
        let errors = build_command(&row, &config()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("tensor_parallel_size")));
    }

    #[test]
    fn invalid_memory_utilization_rejected() {
        let row = test_row("vllm", json!({"gpu_memory_utilization": 1.5}));
        assert!(build_command(&row, &config()).is_err());
    }

    #[test]
    fn offline_sets_hub_env() {
        let mut row = local_row(json!({}));
        row.offline_flag = true;
        let plan = build_command(&row, &config()).unwrap();
        assert!(plan.env.iter().any(|e| e == "HF_HUB_OFFLINE=1"));
        assert!(plan.env.iter().any(|e| e == "TRANSFORMERS_OFFLINE=1"));
    }

    #[test]
    fn vram_estimate_scales_with_dtype() {
        let fp16 = test_row("vllm", json!({"model_params_b": 7.0, "dtype": "bfloat16"}));
        let int4 = test_row("vllm", json!({"model_params_b": 7.0, "dtype": "int4"}));
        let cfg = config();
        let a = estimate_vram(&fp16, &cfg);
        let b = estimate_vram(&int4, &cfg);
        assert!(a.weight_bytes > b.weight_bytes * 3);
        assert!(a.total_bytes > a.weight_bytes + a.kv_cache_bytes);
    }
}
