//! Core job data types.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form key/value metadata attached to a stage record.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Job
// ============================================================================

/// Lifecycle status of a job (one call recording).
///
/// Transitions are monotonic: `queued -> processing -> {completed, failed}`,
/// and any non-terminal status may move to `cancelled` or `failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further stage may mutate a job in this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the job may move from this status to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Processing) => true,
            (JobStatus::Processing, JobStatus::Completed) => true,
            (from, JobStatus::Failed | JobStatus::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// One recording to be processed end to end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: i64,
    pub user_id: i64,
    pub template_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Opaque storage key of the uploaded recording.
    pub input_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    pub status: JobStatus,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Audio duration in seconds, known once normalization ran.
    pub duration_seconds: Option<i64>,
    /// Scratch directory owned by the job's chain while it runs.
    pub work_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Stage records
// ============================================================================

/// Stage name as persisted on a stage record.
///
/// Besides the five processing stages this includes the `uploaded` hand-off
/// marker and the `completed`/`failed` names used by maintenance tooling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Uploaded,
    Normalization,
    Vad,
    Diarization,
    Transcription,
    Scoring,
    Completed,
    Failed,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Uploaded => "uploaded",
            StageName::Normalization => "normalization",
            StageName::Vad => "vad",
            StageName::Diarization => "diarization",
            StageName::Transcription => "transcription",
            StageName::Scoring => "scoring",
            StageName::Completed => "completed",
            StageName::Failed => "failed",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(StageName::Uploaded),
            "normalization" => Ok(StageName::Normalization),
            "vad" => Ok(StageName::Vad),
            "diarization" => Ok(StageName::Diarization),
            "transcription" => Ok(StageName::Transcription),
            "scoring" => Ok(StageName::Scoring),
            "completed" => Ok(StageName::Completed),
            "failed" => Ok(StageName::Failed),
            other => Err(format!("unknown stage name: {}", other)),
        }
    }
}

/// Status of one stage attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    InProgress,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::InProgress => "in_progress",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(StageStatus::InProgress),
            "completed" => Ok(StageStatus::Completed),
            "failed" => Ok(StageStatus::Failed),
            other => Err(format!("unknown stage status: {}", other)),
        }
    }
}

/// Durable log entry for one attempted execution of one stage.
///
/// Retries never update an earlier record; each attempt gets its own row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRecord {
    pub id: i64,
    pub job_id: i64,
    pub stage: StageName,
    pub status: StageStatus,
    pub task_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

// ============================================================================
// Scoring templates and results
// ============================================================================

/// Business vertical of a scoring template. Each has its own pillar weights.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Vertical {
    Sales,
    Support,
    Collections,
}

impl Vertical {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vertical::Sales => "Sales",
            Vertical::Support => "Support",
            Vertical::Collections => "Collections",
        }
    }
}

impl fmt::Display for Vertical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vertical {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sales" => Ok(Vertical::Sales),
            "support" => Ok(Vertical::Support),
            "collections" => Ok(Vertical::Collections),
            other => Err(format!("unknown vertical: {}", other)),
        }
    }
}

/// Prompt configuration used by the scoring stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringTemplate {
    pub id: i64,
    pub name: String,
    pub vertical: Vertical,
    pub system_prompt: String,
    /// User prompt; `{transcript}` is replaced with the call transcript.
    pub user_prompt_template: String,
    pub version: i64,
    pub is_active: bool,
}

/// One transcribed, speaker-attributed span of a call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    pub speaker_label: String,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Persisted outcome of the scoring stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationResult {
    pub job_id: i64,
    pub template_id: i64,
    pub overall_score: f64,
    pub pillar_scores: BTreeMap<String, f64>,
    pub compliance_flags: serde_json::Value,
    pub fatal_flaw_detected: bool,
    pub fatal_flaw_type: Option<String>,
    pub summary: Option<String>,
    pub recommendations: serde_json::Value,
    pub sentiment_score: Option<f64>,
    pub raw_output: serde_json::Value,
    pub prompt_version: i64,
    pub model_used: String,
    pub processing_duration_secs: f64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Batches
// ============================================================================

/// Status of a submission batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Completed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
        }
    }
}

/// Group of jobs submitted together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    pub id: String,
    pub user_id: i64,
    pub num_jobs: i64,
    pub num_completed: i64,
    pub num_failed: i64,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
