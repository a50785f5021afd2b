// Dry-run validation: synthesize the engine command, vet engine_config
// keys against the engine's allowlist, and estimate VRAM — all without
// touching the container runtime.

use serde::Serialize;

use crate::config::Config;
use crate::lifecycle::{llamacpp, vllm, Engine, ModelRow, VramEstimate};

#[derive(Debug, Serialize)]
pub struct DryRunReport {
    pub command_preview: String,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub vram_estimate: VramEstimate,
}

impl DryRunReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Classic two-row Levenshtein, plenty for flag-typo suggestions.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Closest allowlisted key within a small edit distance, for typo hints.
pub fn closest_match<'a>(key: &str, allowed: &[&'a str]) -> Option<&'a str> {
    allowed
        .iter()
        .map(|candidate| (edit_distance(key, candidate), *candidate))
        .filter(|(d, _)| *d <= 3)
        .min_by_key(|(d, _)| *d)
        .map(|(_, candidate)| candidate)
}

fn check_unknown_keys(row: &ModelRow, allowed: &[&str], warnings: &mut Vec<String>) {
    let Some(map) = row.engine_config.as_object() else {
        return;
    };
    for key in map.keys() {
        if allowed.contains(&key.as_str()) {
            continue;
        }
        match closest_match(key, allowed) {
            Some(suggestion) => warnings.push(format!(
                "unknown flag '{key}' (did you mean '{suggestion}'?); passed through unvalidated"
            )),
            None => warnings.push(format!("unknown flag '{key}'; passed through unvalidated")),
        }
    }
}

pub fn run(row: &ModelRow, config: &Config) -> DryRunReport {
    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    let allowed = match row.engine {
        Engine::Vllm => vllm::ALLOWED_KEYS,
        Engine::Llamacpp => llamacpp::ALLOWED_KEYS,
    };
    check_unknown_keys(row, allowed, &mut warnings);

    let (command_preview, vram_estimate) = match row.engine {
        Engine::Vllm => {
            let preview = match vllm::build_command(row, config) {
                Ok(plan) => {
                    warnings.extend(plan.warnings.clone());
                    plan.command.join(" ")
                }
                Err(build_errors) => {
                    errors.extend(build_errors);
                    String::new()
                }
            };
            (preview, vllm::estimate_vram(row, config))
        }
        Engine::Llamacpp => {
            let preview = match llamacpp::build_command(row, config) {
                Ok(plan) => {
                    warnings.extend(plan.warnings.clone());
                    plan.command.join(" ")
                }
                Err(build_errors) => {
                    errors.extend(build_errors);
                    String::new()
                }
            };
            (preview, llamacpp::estimate_vram(row, config))
        }
    };

    if !vram_estimate.fits {
        warnings.push(format!(
            "estimated VRAM {:.1} GiB exceeds the selected GPUs' {:.1} GiB",
            vram_estimate.total_bytes as f64 / (1 << 30) as f64,
            vram_estimate.capacity_bytes as f64 / (1 << 30) as f64,
        ));
    }

    // Soft conflict: CUDA graphs plus custom modeling code is a known
    // instability; eager mode sidesteps it.
    if row.engine == Engine::Vllm {
        let knobs = crate::lifecycle::Knobs::new(&row.engine_config);
        if knobs.bool("enforce_eager") == Some(false) && knobs.bool("trust_remote_code") == Some(true)
        {
            warnings.push(
                "trust_remote_code with CUDA graphs enabled is unstable for some model classes; \
                 consider enforce_eager=true"
                    .to_string(),
            );
        }
    }

    DryRunReport {
        command_preview,
        warnings,
        errors,
        vram_estimate,
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
    fn typo_gets_closest_match_suggestion() {
        let row = test_row("vllm", json!({"gpu_memory_utilisation": 0.9}));
        let report = run(&row, &config());
        assert!(report.ok());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("did you mean 'gpu_memory_utilization'")));
    }

    #[test]
    fn wildly_unknown_key_warns_without_suggestion() {
        let row = test_row("vllm", json!({"frobnicate_level": 11}));
        let report = run(&row, &config());
        assert!(report.warnings.iter().any(|w| w.contains("frobnicate_level")));
        assert!(!report.warnings.iter().any(|w| w.contains("did you mean")));
    }

    #[test]
    fn hard_errors_leave_no_command_preview() {
        let mut row = test_row("vllm", json!({}));
        row.offline_flag = true;
        row.tokenizer_override = Some("org/tok".to_string());
        let report = run(&row, &config());
        assert!(!report.ok());
        assert!(report.command_preview.is_empty());
    }

    #[test]
    fn oversized_model_is_a_warning_not_an_error() {
        let row = test_row("vllm", json!({"model_params_b": 700.0}));
        let report = run(&row, &config());
        assert!(report.ok());
        assert!(report.warnings.iter().any(|w| w.contains("exceeds the selected GPUs")));
    }

    #[test]
    fn eager_conflict_is_soft() {
        let row = test_row(
            "vllm",
            json!({"enforce_eager": false, "trust_remote_code": true}),
        );
        let report = run(&row, &config());
        assert!(report.ok());
        assert!(report.warnings.iter().any(|w| w.contains("enforce_eager")));
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("ngl", "ngl"), 0);
        assert_eq!(edit_distance("ngll", "ngl"), 1);
        assert_eq!(closest_match("tensor_spli", llamacpp::ALLOWED_KEYS), Some("tensor_split"));
        assert_eq!(closest_match("zzzzzzzzzz", llamacpp::ALLOWED_KEYS), None);
    }
}
