//! Job record storage trait and types.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};

use super::{
    Batch, EvaluationResult, Job, JobStatus, Metadata, ScoringTemplate, StageName, StageRecord,
    TranscriptSegment,
};

/// Error type for job store operations.
#[derive(Debug)]
pub enum JobError {
    /// Record not found.
    NotFound(String),
    /// Operation not allowed in the record's current state.
    InvalidState {
        job_id: i64,
        current_state: String,
        operation: String,
    },
    /// Database error.
    Database(String),
}

impl JobError {
    /// Whether the error means the job already reached a terminal status.
    pub fn is_terminal_conflict(&self) -> bool {
        matches!(self, JobError::InvalidState { current_state, .. }
            if current_state
                .parse::<JobStatus>()
                .map(|s| s.is_terminal())
                .unwrap_or(false))
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::NotFound(what) => write!(f, "Not found: {}", what),
            JobError::InvalidState {
                job_id,
                current_state,
                operation,
            } => write!(
                f,
                "Cannot {} job {}: current status is {}",
                operation, job_id, current_state
            ),
            JobError::Database(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for JobError {}

/// Request to create a new job.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub user_id: i64,
    pub template_id: i64,
    pub input_ref: String,
    pub original_filename: Option<String>,
    pub batch_id: Option<String>,
}

/// Filter for querying jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub user_id: Option<i64>,
    pub batch_id: Option<String>,
    /// Only jobs whose processing started before this instant.
    pub started_before: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl JobFilter {
    pub fn new() -> Self {
        Self {
            status: None,
            user_id: None,
            batch_id: None,
            started_before: None,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn started_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.started_before = Some(cutoff);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Durable storage for jobs, their stage history and the data stages write.
///
/// Every status update is a short transaction; no lock is held across stage
/// boundaries.
pub trait JobStore: Send + Sync {
    // --- jobs -------------------------------------------------------------

    /// Create a job in the `queued` status.
    fn create_job(&self, request: CreateJobRequest) -> Result<Job, JobError>;

    fn get_job(&self, id: i64) -> Result<Option<Job>, JobError>;

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError>;

    fn count_jobs(&self, filter: &JobFilter) -> Result<i64, JobError>;

    /// Move a queued job to `processing`, stamp the start time, remember its
    /// working directory and write the `uploaded` hand-off record, atomically.
    fn begin_processing(&self, id: i64, work_dir: &Path, task_id: &str) -> Result<Job, JobError>;

    /// Record the audio duration found during normalization.
    fn set_duration(&self, id: i64, duration_seconds: i64) -> Result<(), JobError>;

    /// Move a processing job to `completed` and stamp the completion time.
    fn complete_job(&self, id: i64) -> Result<Job, JobError>;

    /// Move a non-terminal job to `failed` with the given message.
    ///
    /// Returns `InvalidState` if the job is already terminal.
    fn fail_job(&self, id: i64, error: &str) -> Result<Job, JobError>;

    /// Move a non-terminal job to `cancelled`.
    fn cancel_job(&self, id: i64, reason: &str) -> Result<Job, JobError>;

    // --- stage records ----------------------------------------------------

    /// Open a new `in_progress` stage record.
    fn start_stage(&self, job_id: i64, stage: StageName, task_id: &str)
        -> Result<StageRecord, JobError>;

    /// Close an `in_progress` record as completed, attaching stage metadata.
    fn complete_stage(&self, record_id: i64, metadata: &Metadata) -> Result<StageRecord, JobError>;

    /// Close an `in_progress` record as failed.
    fn fail_stage(&self, record_id: i64, error: &str) -> Result<StageRecord, JobError>;

    /// All stage records of a job, oldest first.
    fn stage_records(&self, job_id: i64) -> Result<Vec<StageRecord>, JobError>;

    /// `in_progress` records opened before `cutoff`, across all jobs.
    fn stale_stage_records(&self, cutoff: DateTime<Utc>) -> Result<Vec<StageRecord>, JobError>;

    // --- templates --------------------------------------------------------

    fn get_template(&self, id: i64) -> Result<Option<ScoringTemplate>, JobError>;

    /// Insert or replace a template by id.
    fn save_template(&self, template: &ScoringTemplate) -> Result<(), JobError>;

    // --- transcript and evaluation ----------------------------------------

    /// Replace the transcript of a job (a retried transcription rewrites it).
    fn replace_transcript(&self, job_id: i64, segments: &[TranscriptSegment])
        -> Result<(), JobError>;

    fn transcript(&self, job_id: i64) -> Result<Vec<TranscriptSegment>, JobError>;

    /// Insert or replace the evaluation result of a job.
    fn save_evaluation(&self, result: &EvaluationResult) -> Result<(), JobError>;

    fn evaluation(&self, job_id: i64) -> Result<Option<EvaluationResult>, JobError>;

    // --- batches ----------------------------------------------------------

    fn create_batch(&self, user_id: i64, num_jobs: i64) -> Result<Batch, JobError>;

    fn get_batch(&self, id: &str) -> Result<Option<Batch>, JobError>;

    /// Batches still in the `processing` status.
    fn open_batches(&self) -> Result<Vec<Batch>, JobError>;

    /// Recount a batch from its member jobs and close it once all are terminal.
    fn refresh_batch(&self, id: &str) -> Result<Batch, JobError>;
}
