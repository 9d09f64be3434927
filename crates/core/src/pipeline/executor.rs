//! Stage executor: the wrapper applied identically to every stage attempt.
//!
//! One call to [`StageExecutor::execute`] is one attempt:
//! 1. refuse to run if the job is already terminal (e.g. cancelled between stages)
//! 2. open an `in_progress` stage record
//! 3. run the stage collaborator under the stage's soft time limit
//! 4. close the record and decide: advance, retry, complete or fail
//!
//! Hard time limits are not enforced here. A hard limit means the attempt is
//! aborted from outside, leaving the record `in_progress` for the
//! reconciliation sweep.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::job::JobStore;
use crate::metrics::{JOBS_FINISHED, STAGE_ATTEMPTS, STAGE_DURATION, STAGE_RETRIES};
use crate::stages::{Collaborators, StageContext, StageOutput};

use super::artifact::Artifact;
use super::stage::{describe_limit, StagePolicies};
use super::types::{ExecutorError, StageError, StageOutcome, StageTask};
use super::workdir::WorkDirs;

/// Runs stage attempts and applies the retry policy.
pub struct StageExecutor {
    job_store: Arc<dyn JobStore>,
    collaborators: Collaborators,
    policies: StagePolicies,
    work_dirs: WorkDirs,
}

impl StageExecutor {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        collaborators: Collaborators,
        policies: StagePolicies,
        work_dirs: WorkDirs,
    ) -> Self {
        Self {
            job_store,
            collaborators,
            policies,
            work_dirs,
        }
    }

    pub fn policies(&self) -> &StagePolicies {
        &self.policies
    }

    /// Run one attempt of `task.stage`. `task_id` is the queue task delivering it.
    pub async fn execute(
        &self,
        task: &StageTask,
        task_id: &str,
    ) -> Result<StageOutcome, ExecutorError> {
        let job_id = task.job_id();
        let stage = task.stage;

        let job = self
            .job_store
            .get_job(job_id)?
            .ok_or(ExecutorError::JobNotFound(job_id))?;

        if job.status.is_terminal() {
            info!(
                "Job {} is {}, stopping chain before {} stage",
                job_id, job.status, stage
            );
            self.work_dirs.release(&task.chain.work_dir).await;
            return Ok(StageOutcome::Skipped { status: job.status });
        }

        let record = self
            .job_store
            .start_stage(job_id, stage.record_name(), task_id)?;

        debug!(
            "Job {}: {} stage attempt {} started (record {})",
            job_id, stage, task.attempt, record.id
        );

        let ctx = StageContext {
            job_id,
            template_id: task.chain.template_id,
            work_dir: task.chain.work_dir.clone(),
            attempt: task.attempt,
            task_id: task_id.to_string(),
        };

        let started = Instant::now();
        let result = self.invoke_with_soft_limit(task, &ctx).await;
        STAGE_DURATION
            .with_label_values(&[stage.as_str()])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(output) => self.on_success(task, record.id, output).await,
            Err(err) => self.on_failure(task, record.id, err).await,
        }
    }

    async fn invoke_with_soft_limit(
        &self,
        task: &StageTask,
        ctx: &StageContext,
    ) -> Result<StageOutput<Artifact>, StageError> {
        let invocation = self.collaborators.invoke(task.stage, ctx, &task.input);

        match self.policies.policy(task.stage).limits.soft {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => Err(StageError::retryable(format!(
                    "{} stage timed out: soft time limit of {} exceeded",
                    task.stage,
                    describe_limit(limit)
                ))),
            },
            None => invocation.await,
        }
    }

    async fn on_success(
        &self,
        task: &StageTask,
        record_id: i64,
        output: StageOutput<Artifact>,
    ) -> Result<StageOutcome, ExecutorError> {
        let job_id = task.job_id();
        self.job_store.complete_stage(record_id, &output.metadata)?;
        STAGE_ATTEMPTS
            .with_label_values(&[task.stage.as_str(), "completed"])
            .inc();

        if let Some(next) = task.stage.next() {
            info!("Job {}: {} stage completed", job_id, task.stage);
            return Ok(StageOutcome::Advanced {
                next: task.advance(next, output.value),
            });
        }

        match self.job_store.complete_job(job_id) {
            Ok(_) => {
                info!("Job {} completed", job_id);
                JOBS_FINISHED.with_label_values(&["completed"]).inc();
            }
            Err(e) if e.is_terminal_conflict() => {
                warn!("Job {} finished its last stage but is already terminal: {}", job_id, e);
            }
            Err(e) => return Err(e.into()),
        }
        self.work_dirs.release(&task.chain.work_dir).await;

        let score = match output.value {
            Artifact::Score(summary) => Some(summary),
            _ => None,
        };
        Ok(StageOutcome::Completed { score })
    }

    async fn on_failure(
        &self,
        task: &StageTask,
        record_id: i64,
        err: StageError,
    ) -> Result<StageOutcome, ExecutorError> {
        let job_id = task.job_id();
        let message = err.message().to_string();
        self.job_store.fail_stage(record_id, &message)?;

        let max_attempts = self.policies.max_attempts();
        if err.is_retryable() && task.attempt < max_attempts {
            let delay = self.policies.policy(task.stage).retry_delay;
            warn!(
                "Job {}: {} stage attempt {}/{} failed, retrying in {:?}: {}",
                job_id, task.stage, task.attempt, max_attempts, delay, message
            );
            STAGE_ATTEMPTS
                .with_label_values(&[task.stage.as_str(), "retry"])
                .inc();
            STAGE_RETRIES.with_label_values(&[task.stage.as_str()]).inc();
            return Ok(StageOutcome::RetryScheduled {
                retry: task.retry(),
                delay,
            });
        }

        error!(
            "Job {}: {} stage failed on attempt {}/{}: {}",
            job_id, task.stage, task.attempt, max_attempts, message
        );
        STAGE_ATTEMPTS
            .with_label_values(&[task.stage.as_str(), "failed"])
            .inc();

        self.fail_job(task, &message).await?;
        Ok(StageOutcome::Failed { error: message })
    }

    /// Mark the job failed (unless it is already terminal) and release its directory.
    async fn fail_job(&self, task: &StageTask, message: &str) -> Result<(), ExecutorError> {
        let job_id = task.job_id();
        match self.job_store.fail_job(job_id, message) {
            Ok(_) => {
                JOBS_FINISHED.with_label_values(&["failed"]).inc();
            }
            Err(e) if e.is_terminal_conflict() => {
                debug!("Job {} already terminal, keeping its status: {}", job_id, e);
            }
            Err(e) => return Err(e.into()),
        }
        self.work_dirs.release(&task.chain.work_dir).await;
        Ok(())
    }
}
