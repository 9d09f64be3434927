use crate::pipeline::{describe_limit, Stage, StagePolicies};

use super::{types::Config, ConfigError};

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Worker concurrency and the attempt budget are not 0
/// - Each stage's soft limit is below its hard limit
/// - The queue lease is not 0
/// - The VAD threshold is a probability
/// - An LLM model is named
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    if config.worker.concurrency == 0 {
        return Err(invalid("worker.concurrency cannot be 0"));
    }

    if config.pipeline.max_attempts == 0 {
        return Err(invalid("pipeline.max_attempts cannot be 0"));
    }

    let policies = StagePolicies::from_config(&config.pipeline);
    for stage in Stage::ALL {
        let limits = policies.policy(stage).limits;
        if let (Some(soft), Some(hard)) = (limits.soft, limits.hard) {
            if soft >= hard {
                return Err(invalid(format!(
                    "pipeline.stages.{}: soft limit ({}) must be below the hard limit ({})",
                    stage,
                    describe_limit(soft),
                    describe_limit(hard)
                )));
            }
        }
    }

    if config.worker.lease_secs == 0 {
        return Err(invalid("worker.lease_secs cannot be 0"));
    }

    let threshold = config.vad.confidence_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(invalid(format!(
            "vad.confidence_threshold must be within [0, 1], got {}",
            threshold
        )));
    }

    if config.llm.model.trim().is_empty() {
        return Err(invalid("llm.model cannot be empty"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    fn assert_invalid(toml: &str, needle: &str) {
        let config = load_config_from_str(toml).unwrap();
        match validate_config(&config) {
            Err(ConfigError::ValidationError(message)) => {
                assert!(message.contains(needle), "{}", message)
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        assert_invalid("[server]\nport = 0", "server.port");
    }

    #[test]
    fn test_validate_zero_concurrency_fails() {
        assert_invalid("[worker]\nconcurrency = 0", "worker.concurrency");
    }

    #[test]
    fn test_validate_zero_attempts_fails() {
        assert_invalid("[pipeline]\nmax_attempts = 0", "pipeline.max_attempts");
    }

    #[test]
    fn test_validate_soft_limit_not_below_hard() {
        assert_invalid(
            "[pipeline.stages.transcription]\nsoft_limit_secs = 900\nhard_limit_secs = 900",
            "pipeline.stages.transcription",
        );
    }

    #[test]
    fn test_validate_zero_lease_fails() {
        assert_invalid("[worker]\nlease_secs = 0", "worker.lease_secs");
    }

    #[test]
    fn test_validate_short_lease_with_long_stages() {
        // Leases are renewed while a stage runs, so they may be shorter than any limit
        let config = load_config_from_str("[worker]\nlease_secs = 30").unwrap();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_soft_limit_without_hard_limit() {
        let config = load_config_from_str(
            r#"
[pipeline.stages.diarization]
hard_limit_secs = 0
[pipeline.stages.transcription]
hard_limit_secs = 0
[pipeline.stages.scoring]
hard_limit_secs = 0
"#,
        )
        .unwrap();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_vad_threshold() {
        assert_invalid("[vad]\nconfidence_threshold = 1.5", "vad.confidence_threshold");
    }

    #[test]
    fn test_validate_empty_llm_model() {
        assert_invalid("[llm]\nmodel = \"\"", "llm.model");
    }
}
