//! Chain payloads, outcomes and errors of the pipeline.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobError, JobStatus};
use crate::queue::QueueError;

use super::artifact::{Artifact, ScoreSummary};
use super::stage::Stage;

/// Everything a stage task needs to know about its chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainContext {
    /// Identifies this chain run; a job has at most one active chain.
    pub chain_id: String,
    pub job_id: i64,
    /// Scratch directory exclusively owned by this chain.
    pub work_dir: PathBuf,
    pub template_id: i64,
}

/// One stage execution request as it travels through the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageTask {
    pub chain: ChainContext,
    pub stage: Stage,
    /// 1 for the first try, incremented on every retry.
    pub attempt: u32,
    pub input: Artifact,
}

impl StageTask {
    pub fn first(chain: ChainContext, input: Artifact) -> Self {
        Self {
            chain,
            stage: Stage::first(),
            attempt: 1,
            input,
        }
    }

    pub fn job_id(&self) -> i64 {
        self.chain.job_id
    }

    /// The same stage again, one attempt later.
    pub fn retry(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// The following stage, fed with `output`.
    pub fn advance(&self, next: Stage, output: Artifact) -> Self {
        Self {
            chain: self.chain.clone(),
            stage: next,
            attempt: 1,
            input: output,
        }
    }
}

/// What the executor decided after one stage attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Stage succeeded; the chain continues with `next`.
    Advanced { next: StageTask },
    /// Last stage succeeded and the job is completed.
    Completed { score: Option<ScoreSummary> },
    /// Attempt failed recoverably; `retry` should run after `delay`.
    RetryScheduled { retry: StageTask, delay: Duration },
    /// Attempt failed terminally; the job has been marked failed.
    Failed { error: String },
    /// The job was already terminal, so nothing ran.
    Skipped { status: JobStatus },
}

impl StageOutcome {
    /// Whether the chain ends with this outcome.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            StageOutcome::Advanced { .. } | StageOutcome::RetryScheduled { .. }
        )
    }
}

/// Result type of a stage collaborator failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    /// Transient: subprocess failure, flaky model load, soft timeout.
    #[error("{0}")]
    Retryable(String),

    /// Retrying cannot help: bad template, missing input, wrong artifact.
    #[error("{0}")]
    Fatal(String),
}

impl StageError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(m) | Self::Fatal(m) => m,
        }
    }
}

impl From<std::io::Error> for StageError {
    fn from(e: std::io::Error) -> Self {
        StageError::retryable(format!("I/O error: {}", e))
    }
}

impl From<JobError> for StageError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::NotFound(_) => StageError::fatal(e.to_string()),
            _ => StageError::retryable(e.to_string()),
        }
    }
}

/// Infrastructure failure of the executor itself (not of a collaborator).
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error(transparent)]
    Store(#[from] JobError),
}

/// Failure to start a chain.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("job {job_id} is {status}, expected queued")]
    NotQueued { job_id: i64, status: JobStatus },

    #[error("failed to allocate working directory {path:?}: {reason}")]
    WorkDir { path: PathBuf, reason: String },

    #[error(transparent)]
    Store(#[from] JobError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Failure while handling a queued task; the task is handed back for redelivery.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] JobError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
