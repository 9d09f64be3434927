//! Queue payloads and errors.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::StageTask;

/// Work items carried by the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Allocate a working directory for a queued job and start its chain.
    StartPipeline {
        job_id: i64,
        input_ref: String,
        template_id: i64,
    },
    /// One stage attempt.
    RunStage(StageTask),
    /// A chain ended without its own failure handling running.
    ChainFailed {
        job_id: i64,
        chain_id: String,
        work_dir: Option<PathBuf>,
        reason: String,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::StartPipeline { .. } => "start_pipeline",
            TaskPayload::RunStage(_) => "run_stage",
            TaskPayload::ChainFailed { .. } => "chain_failed",
        }
    }

    pub fn job_id(&self) -> i64 {
        match self {
            TaskPayload::StartPipeline { job_id, .. } | TaskPayload::ChainFailed { job_id, .. } => {
                *job_id
            }
            TaskPayload::RunStage(task) => task.job_id(),
        }
    }
}

/// A task stored in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub payload: TaskPayload,
    pub available_at: DateTime<Utc>,
    /// Times the task has been handed to a worker.
    pub deliveries: u32,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A task handed to one worker until acked, released or its lease expires.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedTask {
    pub id: String,
    pub payload: TaskPayload,
    pub deliveries: u32,
    pub lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Deliverable now.
    pub ready: u64,
    /// Waiting for a retry delay to pass.
    pub delayed: u64,
    /// Held by a worker.
    pub leased: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.ready + self.delayed + self.leased
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(String),

    #[error("invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("task not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}
