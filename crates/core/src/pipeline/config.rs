//! Configuration for the pipeline chain.

use serde::{Deserialize, Serialize};

use super::stage::{Stage, DEFAULT_MAX_ATTEMPTS};

/// Retry and time-limit configuration for the stage chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Attempts allowed per stage, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-stage overrides of the built-in budgets.
    #[serde(default)]
    pub stages: StageSettingsTable,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            stages: StageSettingsTable::default(),
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Overrides for one stage. Unset fields keep the stage default; a limit of
/// 0 disables that limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_limit_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_limit_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_secs: Option<u64>,
}

/// `[pipeline.stages.<stage>]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageSettingsTable {
    #[serde(default)]
    pub normalization: StageSettings,
    #[serde(default)]
    pub vad: StageSettings,
    #[serde(default)]
    pub diarization: StageSettings,
    #[serde(default)]
    pub transcription: StageSettings,
    #[serde(default)]
    pub scoring: StageSettings,
}

impl StageSettingsTable {
    pub fn settings(&self, stage: Stage) -> &StageSettings {
        match stage {
            Stage::Normalization => &self.normalization,
            Stage::Vad => &self.vad,
            Stage::Diarization => &self.diarization,
            Stage::Transcription => &self.transcription,
            Stage::Scoring => &self.scoring,
        }
    }
}
