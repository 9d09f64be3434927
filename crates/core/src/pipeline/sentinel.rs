//! Failure handling for chains that ended without reaching their own.
//!
//! Runs when an attempt was aborted (hard time limit, panic) or the executor
//! hit an infrastructure error. Safe to run any number of times for the same
//! job.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::job::{JobError, JobStore};
use crate::metrics::{CHAIN_FAILURES, JOBS_FINISHED};

use super::workdir::WorkDirs;

/// What the sentinel changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SentinelReport {
    /// False when the job was already terminal.
    pub job_marked_failed: bool,
    pub work_dir_released: bool,
}

pub struct FailureSentinel {
    job_store: Arc<dyn JobStore>,
    work_dirs: WorkDirs,
}

impl FailureSentinel {
    pub fn new(job_store: Arc<dyn JobStore>, work_dirs: WorkDirs) -> Self {
        Self {
            job_store,
            work_dirs,
        }
    }

    /// Mark the job failed with `reason` unless it is already terminal, then
    /// release its working directory.
    ///
    /// `work_dir` falls back to the directory recorded on the job.
    pub async fn on_chain_failure(
        &self,
        job_id: i64,
        work_dir: Option<&Path>,
        reason: &str,
    ) -> Result<SentinelReport, JobError> {
        CHAIN_FAILURES.inc();

        let job = match self.job_store.fail_job(job_id, reason) {
            Ok(job) => {
                error!("Job {} failed: {}", job_id, reason);
                JOBS_FINISHED.with_label_values(&["failed"]).inc();
                Some(job)
            }
            Err(e) if e.is_terminal_conflict() => {
                info!("Job {} already terminal, keeping its status", job_id);
                None
            }
            Err(e) => return Err(e),
        };
        let job_marked_failed = job.is_some();

        let recorded = match job {
            Some(job) => job.work_dir,
            None if work_dir.is_none() => self.job_store.get_job(job_id)?.and_then(|j| j.work_dir),
            None => None,
        };

        let work_dir_released = match work_dir.or(recorded.as_deref()) {
            Some(dir) => self.work_dirs.release(dir).await,
            None => false,
        };

        Ok(SentinelReport {
            job_marked_failed,
            work_dir_released,
        })
    }
}
