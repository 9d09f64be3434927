//! Job submission and chain start.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::job::{CreateJobRequest, Job, JobStatus, JobStore};
use crate::metrics::{JOBS_FINISHED, JOBS_STARTED};
use crate::queue::{TaskPayload, TaskQueue};

use super::artifact::Artifact;
use super::stage::Stage;
use super::types::{ChainContext, CoordinatorError, StageTask};
use super::workdir::WorkDirs;

/// A new job to process.
#[derive(Debug, Clone)]
pub struct SubmitJobRequest {
    pub user_id: i64,
    pub template_id: i64,
    pub input_ref: String,
    pub original_filename: Option<String>,
    pub batch_id: Option<String>,
}

/// Returned once a chain has been started.
#[derive(Debug, Clone, Serialize)]
pub struct ChainHandle {
    pub chain_id: String,
    pub job_id: i64,
    pub work_dir: PathBuf,
    /// Queue id of the first stage task.
    pub first_task_id: String,
    pub stages: Vec<Stage>,
}

/// Creates jobs and turns queued jobs into running chains.
pub struct PipelineCoordinator {
    job_store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    work_dirs: WorkDirs,
}

impl PipelineCoordinator {
    pub fn new(job_store: Arc<dyn JobStore>, queue: Arc<dyn TaskQueue>, work_dirs: WorkDirs) -> Self {
        Self {
            job_store,
            queue,
            work_dirs,
        }
    }

    /// Create a queued job and schedule the start of its pipeline.
    pub fn submit(&self, request: SubmitJobRequest) -> Result<Job, CoordinatorError> {
        let job = self.job_store.create_job(CreateJobRequest {
            user_id: request.user_id,
            template_id: request.template_id,
            input_ref: request.input_ref.clone(),
            original_filename: request.original_filename,
            batch_id: request.batch_id,
        })?;

        self.queue.enqueue(
            &TaskPayload::StartPipeline {
                job_id: job.id,
                input_ref: request.input_ref,
                template_id: request.template_id,
            },
            Duration::ZERO,
        )?;

        info!("Submitted job {} (template {})", job.id, job.template_id);
        Ok(job)
    }

    /// Start the stage chain of a queued job.
    ///
    /// Allocates the working directory, moves the job to `processing` with its
    /// `uploaded` record, and enqueues the first stage. Any failure before the
    /// first stage is enqueued marks the job failed here, since no chain
    /// exists yet to do it.
    pub async fn start_pipeline(
        &self,
        job_id: i64,
        input_ref: &str,
        template_id: i64,
        task_id: &str,
    ) -> Result<ChainHandle, CoordinatorError> {
        let job = self
            .job_store
            .get_job(job_id)?
            .ok_or(CoordinatorError::JobNotFound(job_id))?;

        if job.status != JobStatus::Queued {
            return Err(CoordinatorError::NotQueued {
                job_id,
                status: job.status,
            });
        }

        let work_dir = match self.work_dirs.allocate(job_id).await {
            Ok(dir) => dir,
            Err(e) => {
                let path = self.work_dirs.root().to_path_buf();
                let reason = e.to_string();
                self.fail_before_start(job_id, &format!("Failed to allocate working directory: {}", reason));
                return Err(CoordinatorError::WorkDir { path, reason });
            }
        };

        if let Err(e) = self.job_store.begin_processing(job_id, &work_dir, task_id) {
            // Lost a race with another delivery or a cancellation; the job is untouched
            self.work_dirs.release(&work_dir).await;
            return Err(e.into());
        }

        let chain = ChainContext {
            chain_id: uuid::Uuid::new_v4().to_string(),
            job_id,
            work_dir: work_dir.clone(),
            template_id,
        };
        let first = StageTask::first(
            chain.clone(),
            Artifact::Upload {
                input_ref: input_ref.to_string(),
            },
        );

        let first_task_id = match self.queue.enqueue(&TaskPayload::RunStage(first), Duration::ZERO) {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to enqueue first stage of job {}: {}", job_id, e);
                self.fail_before_start(job_id, &format!("Failed to start pipeline: {}", e));
                self.work_dirs.release(&work_dir).await;
                return Err(e.into());
            }
        };

        JOBS_STARTED.inc();
        info!(
            "Started chain {} for job {} in {:?}",
            chain.chain_id, job_id, work_dir
        );

        Ok(ChainHandle {
            chain_id: chain.chain_id,
            job_id,
            work_dir,
            first_task_id,
            stages: Stage::ALL.to_vec(),
        })
    }

    /// Cancel a job. Its chain stops before the next stage begins.
    pub fn cancel(&self, job_id: i64, reason: &str) -> Result<Job, CoordinatorError> {
        let job = self.job_store.cancel_job(job_id, reason)?;
        JOBS_FINISHED.with_label_values(&["cancelled"]).inc();
        info!("Cancelled job {}: {}", job_id, reason);
        Ok(job)
    }

    fn fail_before_start(&self, job_id: i64, message: &str) {
        match self.job_store.fail_job(job_id, message) {
            Ok(_) => {
                JOBS_FINISHED.with_label_values(&["failed"]).inc();
            }
            Err(e) => warn!("Could not mark job {} failed: {}", job_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{SqliteJobStore, StageName, StageStatus};
    use crate::queue::SqliteTaskQueue;

    struct Fixture {
        store: Arc<SqliteJobStore>,
        queue: Arc<SqliteTaskQueue>,
        coordinator: PipelineCoordinator,
        root: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let queue = Arc::new(SqliteTaskQueue::in_memory().unwrap());
        let coordinator =
            PipelineCoordinator::new(store.clone(), queue.clone(), WorkDirs::new(root.path()));
        Fixture {
            store,
            queue,
            coordinator,
            root,
        }
    }

    fn request() -> SubmitJobRequest {
        SubmitJobRequest {
            user_id: 3,
            template_id: 1,
            input_ref: "uploads/call.wav".to_string(),
            original_filename: Some("call.wav".to_string()),
            batch_id: None,
        }
    }

    #[test]
    fn test_submit_creates_queued_job_and_start_task() {
        let f = fixture();
        let job = f.coordinator.submit(request()).unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let tasks = f.queue.pending_for_job(job.id).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            tasks[0].payload,
            TaskPayload::StartPipeline {
                job_id: job.id,
                input_ref: "uploads/call.wav".to_string(),
                template_id: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_start_pipeline_moves_job_to_processing() {
        let f = fixture();
        let job = f.coordinator.submit(request()).unwrap();

        let handle = f
            .coordinator
            .start_pipeline(job.id, "uploads/call.wav", 1, "start-task")
            .await
            .unwrap();
        assert_eq!(handle.stages, Stage::ALL.to_vec());
        assert!(handle.work_dir.starts_with(f.root.path()));
        assert!(handle.work_dir.is_dir());

        let job = f.store.get_job(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.processing_started_at.is_some());
        assert_eq!(job.work_dir.as_deref(), Some(handle.work_dir.as_path()));

        let records = f.store.stage_records(job.id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, StageName::Uploaded);
        assert_eq!(records[0].status, StageStatus::Completed);

        let tasks = f.queue.pending_for_job(job.id).unwrap();
        let first = tasks.iter().find(|t| t.id == handle.first_task_id).unwrap();
        match &first.payload {
            TaskPayload::RunStage(task) => {
                assert_eq!(task.stage, Stage::Normalization);
                assert_eq!(task.attempt, 1);
                assert_eq!(task.chain.chain_id, handle.chain_id);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_pipeline_twice_is_refused() {
        let f = fixture();
        let job = f.coordinator.submit(request()).unwrap();
        f.coordinator
            .start_pipeline(job.id, "uploads/call.wav", 1, "a")
            .await
            .unwrap();

        let err = f
            .coordinator
            .start_pipeline(job.id, "uploads/call.wav", 1, "b")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::NotQueued {
                status: JobStatus::Processing,
                ..
            }
        ));
        // No second chain, no second hand-off record
        assert_eq!(f.store.stage_records(job.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unallocatable_work_dir_fails_job() {
        let f = fixture();
        // A file where the root directory should be
        let blocked = f.root.path().join("not-a-dir");
        std::fs::write(&blocked, b"x").unwrap();
        let coordinator =
            PipelineCoordinator::new(f.store.clone(), f.queue.clone(), WorkDirs::new(&blocked));

        let job = coordinator.submit(request()).unwrap();
        let err = coordinator
            .start_pipeline(job.id, "uploads/call.wav", 1, "t")
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::WorkDir { .. }));

        let job = f.store.get_job(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job
            .error_message
            .unwrap()
            .starts_with("Failed to allocate working directory"));
    }

    #[test]
    fn test_cancel() {
        let f = fixture();
        let job = f.coordinator.submit(request()).unwrap();
        let job = f.coordinator.cancel(job.id, "operator request").unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(f.coordinator.cancel(job.id, "again").is_err());
    }
}
