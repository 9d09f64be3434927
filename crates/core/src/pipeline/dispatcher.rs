//! Routes queued tasks to the coordinator, executor and sentinel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::metrics::STAGE_HARD_TIMEOUTS;
use crate::queue::{LeasedTask, TaskPayload, TaskQueue};
use crate::worker::{AbortReason, TaskHandler};

use super::coordinator::PipelineCoordinator;
use super::executor::StageExecutor;
use super::sentinel::FailureSentinel;
use super::stage::describe_limit;
use super::types::{CoordinatorError, DispatchError, ExecutorError, StageOutcome, StageTask};

pub struct TaskDispatcher {
    coordinator: Arc<PipelineCoordinator>,
    executor: Arc<StageExecutor>,
    sentinel: Arc<FailureSentinel>,
    queue: Arc<dyn TaskQueue>,
}

impl TaskDispatcher {
    pub fn new(
        coordinator: Arc<PipelineCoordinator>,
        executor: Arc<StageExecutor>,
        sentinel: Arc<FailureSentinel>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            coordinator,
            executor,
            sentinel,
            queue,
        }
    }

    async fn start_pipeline(
        &self,
        task_id: &str,
        job_id: i64,
        input_ref: &str,
        template_id: i64,
    ) -> Result<(), DispatchError> {
        match self
            .coordinator
            .start_pipeline(job_id, input_ref, template_id, task_id)
            .await
        {
            Ok(_) => Ok(()),
            // Redelivered start, or the job was cancelled before it began
            Err(CoordinatorError::NotQueued { status, .. }) => {
                debug!("Job {} is {}, ignoring start task {}", job_id, status, task_id);
                Ok(())
            }
            Err(CoordinatorError::JobNotFound(_)) => {
                warn!("Start task {} refers to unknown job {}", task_id, job_id);
                Ok(())
            }
            // The coordinator already failed the job
            Err(CoordinatorError::WorkDir { .. }) | Err(CoordinatorError::Queue(_)) => Ok(()),
            Err(CoordinatorError::Store(e)) if e.is_terminal_conflict() => Ok(()),
            Err(CoordinatorError::Store(e)) => Err(e.into()),
        }
    }

    async fn run_stage(
        &self,
        task_id: &str,
        task: &StageTask,
    ) -> Result<(), DispatchError> {
        match self.executor.execute(task, task_id).await {
            Ok(StageOutcome::Advanced { next }) => {
                self.queue
                    .enqueue(&TaskPayload::RunStage(next), Duration::ZERO)?;
            }
            Ok(StageOutcome::RetryScheduled { retry, delay }) => {
                self.queue.enqueue(&TaskPayload::RunStage(retry), delay)?;
            }
            Ok(StageOutcome::Completed { .. })
            | Ok(StageOutcome::Failed { .. })
            | Ok(StageOutcome::Skipped { .. }) => {}
            Err(ExecutorError::JobNotFound(job_id)) => {
                warn!("Stage task {} refers to unknown job {}", task_id, job_id);
            }
            Err(ExecutorError::Store(e)) => {
                error!(
                    "Job {}: {} stage hit a store error: {}",
                    task.job_id(),
                    task.stage,
                    e
                );
                self.queue.enqueue(
                    &TaskPayload::ChainFailed {
                        job_id: task.job_id(),
                        chain_id: task.chain.chain_id.clone(),
                        work_dir: Some(task.chain.work_dir.clone()),
                        reason: format!("{} stage failed unexpectedly: {}", task.stage, e),
                    },
                    Duration::ZERO,
                )?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for TaskDispatcher {
    async fn handle(&self, task: &LeasedTask) -> Result<(), DispatchError> {
        match &task.payload {
            TaskPayload::StartPipeline {
                job_id,
                input_ref,
                template_id,
            } => {
                self.start_pipeline(&task.id, *job_id, input_ref, *template_id)
                    .await
            }
            TaskPayload::RunStage(stage_task) => self.run_stage(&task.id, stage_task).await,
            TaskPayload::ChainFailed {
                job_id,
                work_dir,
                reason,
                ..
            } => {
                self.sentinel
                    .on_chain_failure(*job_id, work_dir.as_deref(), reason)
                    .await?;
                Ok(())
            }
        }
    }

    fn hard_limit(&self, payload: &TaskPayload) -> Option<Duration> {
        match payload {
            TaskPayload::RunStage(task) => self.executor.policies().policy(task.stage).limits.hard,
            _ => None,
        }
    }

    async fn on_aborted(&self, task: &LeasedTask, reason: AbortReason) {
        let TaskPayload::RunStage(stage_task) = &task.payload else {
            warn!("{} task {} aborted: {}", task.payload.kind(), task.id, reason);
            return;
        };

        let stage = stage_task.stage;
        let message = match &reason {
            AbortReason::HardTimeout(limit) => {
                STAGE_HARD_TIMEOUTS.with_label_values(&[stage.as_str()]).inc();
                format!(
                    "{} stage timed out: hard time limit of {} exceeded",
                    stage,
                    describe_limit(*limit)
                )
            }
            AbortReason::Panicked(msg) => format!("{} stage failed unexpectedly: {}", stage, msg),
        };

        let payload = TaskPayload::ChainFailed {
            job_id: stage_task.job_id(),
            chain_id: stage_task.chain.chain_id.clone(),
            work_dir: Some(stage_task.chain.work_dir.clone()),
            reason: message.clone(),
        };

        if let Err(e) = self.queue.enqueue(&payload, Duration::ZERO) {
            warn!(
                "Could not enqueue chain failure for job {}, handling it inline: {}",
                stage_task.job_id(),
                e
            );
            if let Err(e) = self
                .sentinel
                .on_chain_failure(
                    stage_task.job_id(),
                    Some(&stage_task.chain.work_dir),
                    &message,
                )
                .await
            {
                error!(
                    "Chain failure of job {} left for reconciliation: {}",
                    stage_task.job_id(),
                    e
                );
            }
        }
    }
}
