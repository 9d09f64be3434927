//! The fixed five-stage chain and its time and retry budgets.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::StageName;

use super::config::{PipelineConfig, StageSettings};

/// Attempts allowed per stage within one chain (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Fixed backoff before a failed stage is tried again.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);
pub const SCORING_RETRY_DELAY: Duration = Duration::from_secs(60);

pub const DIARIZATION_SOFT_LIMIT: Duration = Duration::from_secs(8 * 60);
pub const DIARIZATION_HARD_LIMIT: Duration = Duration::from_secs(12 * 60);
pub const TRANSCRIPTION_SOFT_LIMIT: Duration = Duration::from_secs(10 * 60);
pub const TRANSCRIPTION_HARD_LIMIT: Duration = Duration::from_secs(15 * 60);
pub const SCORING_SOFT_LIMIT: Duration = Duration::from_secs(15 * 60);
pub const SCORING_HARD_LIMIT: Duration = Duration::from_secs(20 * 60);

/// One of the five ordered transformations applied to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalization,
    Vad,
    Diarization,
    Transcription,
    Scoring,
}

impl Stage {
    /// All stages in chain order.
    pub const ALL: [Stage; 5] = [
        Stage::Normalization,
        Stage::Vad,
        Stage::Diarization,
        Stage::Transcription,
        Stage::Scoring,
    ];

    pub fn first() -> Stage {
        Stage::Normalization
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Normalization => Some(Stage::Vad),
            Stage::Vad => Some(Stage::Diarization),
            Stage::Diarization => Some(Stage::Transcription),
            Stage::Transcription => Some(Stage::Scoring),
            Stage::Scoring => None,
        }
    }

    pub fn is_last(&self) -> bool {
        self.next().is_none()
    }

    pub fn index(&self) -> usize {
        match self {
            Stage::Normalization => 0,
            Stage::Vad => 1,
            Stage::Diarization => 2,
            Stage::Transcription => 3,
            Stage::Scoring => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.record_name().as_str()
    }

    /// Name written on the stage records of this stage.
    pub fn record_name(&self) -> StageName {
        match self {
            Stage::Normalization => StageName::Normalization,
            Stage::Vad => StageName::Vad,
            Stage::Diarization => StageName::Diarization,
            Stage::Transcription => StageName::Transcription,
            Stage::Scoring => StageName::Scoring,
        }
    }

    pub fn from_record_name(name: StageName) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.record_name() == name)
    }

    /// Built-in time budget. Normalization and VAD are bounded only by I/O.
    pub fn default_limits(&self) -> StageLimits {
        match self {
            Stage::Normalization | Stage::Vad => StageLimits::UNLIMITED,
            Stage::Diarization => StageLimits::new(DIARIZATION_SOFT_LIMIT, DIARIZATION_HARD_LIMIT),
            Stage::Transcription => {
                StageLimits::new(TRANSCRIPTION_SOFT_LIMIT, TRANSCRIPTION_HARD_LIMIT)
            }
            Stage::Scoring => StageLimits::new(SCORING_SOFT_LIMIT, SCORING_HARD_LIMIT),
        }
    }

    pub fn default_retry_delay(&self) -> Duration {
        match self {
            Stage::Scoring => SCORING_RETRY_DELAY,
            _ => DEFAULT_RETRY_DELAY,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable form of a time limit for error messages.
pub fn describe_limit(limit: Duration) -> String {
    if limit.subsec_millis() == 0 {
        format!("{}s", limit.as_secs())
    } else {
        format!("{}ms", limit.as_millis())
    }
}

/// Wall-clock budget for one stage attempt.
///
/// Exceeding `soft` is a recoverable failure recorded by the executor.
/// Exceeding `hard` aborts the attempt without any record update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLimits {
    pub soft: Option<Duration>,
    pub hard: Option<Duration>,
}

impl StageLimits {
    pub const UNLIMITED: StageLimits = StageLimits {
        soft: None,
        hard: None,
    };

    pub const fn new(soft: Duration, hard: Duration) -> Self {
        Self {
            soft: Some(soft),
            hard: Some(hard),
        }
    }
}

/// Resolved time and retry policy for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePolicy {
    pub limits: StageLimits,
    pub retry_delay: Duration,
}

impl StagePolicy {
    pub fn default_for(stage: Stage) -> Self {
        Self {
            limits: stage.default_limits(),
            retry_delay: stage.default_retry_delay(),
        }
    }

    fn from_settings(stage: Stage, settings: &StageSettings) -> Self {
        let defaults = Self::default_for(stage);
        // 0 in configuration turns a limit off
        let limit = |secs: Option<u64>, fallback: Option<Duration>| match secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => fallback,
        };

        Self {
            limits: StageLimits {
                soft: limit(settings.soft_limit_secs, defaults.limits.soft),
                hard: limit(settings.hard_limit_secs, defaults.limits.hard),
            },
            retry_delay: settings
                .retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_delay),
        }
    }
}

/// Policies for every stage plus the shared attempt budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePolicies {
    max_attempts: u32,
    policies: [StagePolicy; 5],
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            policies: Stage::ALL.map(StagePolicy::default_for),
        }
    }
}

impl StagePolicies {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            policies: Stage::ALL.map(|stage| {
                StagePolicy::from_settings(stage, config.stages.settings(stage))
            }),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_policy(mut self, stage: Stage, policy: StagePolicy) -> Self {
        self.policies[stage.index()] = policy;
        self
    }

    /// Same policy for every stage.
    pub fn with_all(mut self, policy: StagePolicy) -> Self {
        self.policies = [policy; 5];
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn policy(&self, stage: Stage) -> StagePolicy {
        self.policies[stage.index()]
    }
}
