// Diagnostic log classifier. Maps engine stderr/stdout fragments to a
// (code, message, fix hint) triad so a failed start tells the operator
// what to change instead of dumping a stack trace.

use serde::Serialize;

/// How many raw lines to keep when nothing matches.
const UNMATCHED_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub code: &'static str,
    pub message: &'static str,
    pub fix_hint: &'static str,
    pub matched: bool,
    /// Raw log tail carried alongside for unmatched failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_tail: Option<String>,
}

struct Pattern {
    needles: &'static [&'static str],
    code: &'static str,
    message: &'static str,
    fix_hint: &'static str,
}

/// Ordered: first match wins, so the most specific fragments come first.
const PATTERNS: &[Pattern] = &[
    Pattern {
        needles: &[
            "CUDA out of memory",
            "torch.OutOfMemoryError",
            "cudaMalloc failed",
            "failed to allocate buffer",
            "ggml_backend_cuda_buffer_type_alloc_buffer",
        ],
        code: "insufficient_vram",
        message: "Out of GPU memory while loading model weights",
        fix_hint: "Lower gpu_memory_utilization or choose a smaller model",
    },
    Pattern {
        needles: &[
            "Can't load tokenizer",
            "couldn't connect to 'https://huggingface.co'",
            "We couldn't connect to",
            "is not a local folder and is not a valid model identifier",
        ],
        code: "offline_tokenizer_unavailable",
        message: "Tokenizer is not available in offline mode",
        fix_hint: "Pre-cache the tokenizer or point tokenizer_override at a local config path",
    },
    Pattern {
        needles: &[
            "NCCL timeout",
            "NCCL error",
            "Watchdog caught collective operation timeout",
            "torch.distributed.DistBackendError",
        ],
        code: "coordination_timeout",
        message: "Multi-GPU coordination timed out",
        fix_hint: "Check the GPU interconnect and raise NCCL_TIMEOUT_MS",
    },
    Pattern {
        needles: &[
            "CUDA driver version is insufficient",
            "incompatible with the installed CUDA driver",
            "forward compatibility was attempted on non supported HW",
        ],
        code: "driver_mismatch",
        message: "Host driver is older than the engine image requires",
        fix_hint: "Update the host NVIDIA driver to the image's required minimum",
    },
    Pattern {
        needles: &["Loading model", "model is being loaded"],
        code: "model_loading",
        message: "Model is still loading",
        fix_hint: "Retry with backoff until loading completes",
    },
    Pattern {
        needles: &[
            "context length",
            "exceeds the available context size",
            "maximum context length",
        ],
        code: "context_length_exceeded",
        message: "Request exceeded the model's context length",
        fix_hint: "Shorten the prompt or raise the configured context length",
    },
];

/// Classify a log excerpt. Unmatched output keeps the last lines verbatim
/// with an explicit marker so the operator sees the evidence.
pub fn classify(log_excerpt: &str) -> Diagnosis {
    for pattern in PATTERNS {
        if pattern.needles.iter().any(|n| log_excerpt.contains(n)) {
            return Diagnosis {
                code: pattern.code,
                message: pattern.message,
                fix_hint: pattern.fix_hint,
                matched: true,
                raw_tail: None,
            };
        }
    }

    let tail: Vec<&str> = log_excerpt.lines().rev().take(UNMATCHED_TAIL_LINES).collect();
    let tail: String = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
    Diagnosis {
        code: "unclassified",
        message: "no pattern matched",
        fix_hint: "Inspect the raw container logs",
        matched: false,
        raw_tail: Some(tail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_is_classified_with_vram_hint() {
        let d = classify("torch.OutOfMemoryError: CUDA out of memory. Tried to allocate 20.00 GiB");
        assert_eq!(d.code, "insufficient_vram");
        assert!(d.fix_hint.contains("gpu_memory_utilization"));
        assert!(d.matched);
    }

    #[test]
    fn offline_tokenizer_is_classified() {
        let d = classify("OSError: We couldn't connect to 'https://huggingface.co' to load this file");
        assert_eq!(d.code, "offline_tokenizer_unavailable");
    }

    #[test]
    fn nccl_timeout_is_classified() {
        let d = classify("[rank1] Watchdog caught collective operation timeout: WorkNCCL");
        assert_eq!(d.code, "coordination_timeout");
    }

    #[test]
    fn driver_mismatch_is_classified() {
        let d = classify("RuntimeError: CUDA driver version is insufficient for CUDA runtime version");
        assert_eq!(d.code, "driver_mismatch");
    }

    #[test]
    fn loading_and_context_patterns_match() {
        assert_eq!(classify("{\"error\":{\"message\":\"Loading model\"}}").code, "model_loading");
        assert_eq!(
            classify("the request exceeds the available context size").code,
            "context_length_exceeded"
        );
    }

    #[test]
    fn unmatched_keeps_tail_with_marker() {
        let lines: Vec<String> = (0..40).map(|i| format!("line {i}")).collect();
        let d = classify(&lines.join("\n"));
        assert_eq!(d.code, "unclassified");
        assert_eq!(d.message, "no pattern matched");
        let tail = d.raw_tail.unwrap();
        assert!(tail.contains("line 39"));
        assert!(!tail.contains("line 10"));
    }
}
