//! Periodic sweep that closes what crashed or killed workers left open.
//!
//! A hard time limit or a dead worker leaves the attempt's stage record
//! `in_progress` forever, and possibly its job `processing`. The sweep fails
//! such records once they are older than their stage could legitimately run,
//! and fails jobs that have been processing for far too long. Work a worker
//! still holds a lease on, or a retry still waiting in the queue, is left
//! alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::job::{
    BatchStatus, Job, JobError, JobFilter, JobStatus, JobStore, StageRecord, StageStatus,
};
use crate::metrics::{JOBS_FINISHED, RECONCILED_JOBS, RECONCILED_STAGE_RECORDS};
use crate::queue::{Task, TaskQueue};

use super::stage::{Stage, StagePolicies};
use super::workdir::WorkDirs;

/// Configuration for the reconciliation sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds between sweeps.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Slack added to a stage's hard limit before its record counts as stuck.
    #[serde(default = "default_grace")]
    pub grace_secs: u64,

    /// Budget assumed for stages without a hard limit.
    #[serde(default = "default_unbounded_stage")]
    pub unbounded_stage_secs: u64,

    /// Jobs processing longer than this are failed, unless they still have a
    /// task in the queue.
    #[serde(default = "default_job_max_age")]
    pub job_max_age_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_interval() -> u64 {
    300
}

fn default_grace() -> u64 {
    300
}

fn default_unbounded_stage() -> u64 {
    1800
}

fn default_job_max_age() -> u64 {
    7200 // 2 hours
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval(),
            grace_secs: default_grace(),
            unbounded_stage_secs: default_unbounded_stage(),
            job_max_age_secs: default_job_max_age(),
        }
    }
}

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub stuck_records: usize,
    pub failed_jobs: usize,
    pub batches_closed: usize,
    /// Overdue jobs spared because a task of theirs is still queued or leased.
    pub skipped_live: usize,
}

pub struct Reconciler {
    config: ReconcilerConfig,
    job_store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    policies: StagePolicies,
    work_dirs: WorkDirs,

    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        job_store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        policies: StagePolicies,
        work_dirs: WorkDirs,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            job_store,
            queue,
            policies,
            work_dirs,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// How long a record of `stage` may stay `in_progress`.
    fn stuck_after(&self, stage: Option<Stage>) -> Duration {
        let budget = stage
            .and_then(|s| self.policies.policy(s).limits.hard)
            .unwrap_or(Duration::from_secs(self.config.unbounded_stage_secs));
        budget + Duration::from_secs(self.config.grace_secs)
    }

    fn shortest_stuck_after(&self) -> Duration {
        Stage::ALL
            .into_iter()
            .map(|s| self.stuck_after(Some(s)))
            .min()
            .unwrap_or_else(|| self.stuck_after(None))
    }

    /// Unacked tasks of a job. `None` when the queue could not be read, in
    /// which case the job is treated as live.
    fn pending_tasks(&self, job_id: i64) -> Option<Vec<Task>> {
        match self.queue.pending_for_job(job_id) {
            Ok(tasks) => Some(tasks),
            Err(e) => {
                warn!("Failed to read queued tasks of job {}: {}", job_id, e);
                None
            }
        }
    }

    /// A worker is running a task of this job and keeps renewing its lease.
    fn has_active_lease(&self, job_id: i64, now: DateTime<Utc>) -> bool {
        match self.pending_tasks(job_id) {
            Some(tasks) => tasks.iter().any(|t| {
                t.leased_by.is_some() && t.lease_expires_at.map(|at| at > now).unwrap_or(false)
            }),
            None => true,
        }
    }

    /// Run one sweep as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, JobError> {
        let mut report = SweepReport::default();

        let cutoff = now - to_chrono(self.shortest_stuck_after());
        for record in self.job_store.stale_stage_records(cutoff)? {
            let stage = Stage::from_record_name(record.stage);
            let stuck_after = self.stuck_after(stage);
            if record.started_at + to_chrono(stuck_after) > now {
                continue;
            }
            if self.has_active_lease(record.job_id, now) {
                debug!(
                    "Job {}: {} record {} is old but its task is still leased",
                    record.job_id, record.stage, record.id
                );
                continue;
            }
            if self.close_stuck_record(&record, stuck_after, &mut report).await? {
                report.stuck_records += 1;
            }
        }

        let max_age = Duration::from_secs(self.config.job_max_age_secs);
        let filter = JobFilter::new()
            .with_status(JobStatus::Processing)
            .started_before(now - to_chrono(max_age))
            .with_limit(500);
        for job in self.job_store.list_jobs(&filter)? {
            // A retry still queued or running may yet finish the job
            let live = self.pending_tasks(job.id).map_or(true, |t| !t.is_empty());
            if live {
                debug!("Job {} is overdue but still has queued work", job.id);
                report.skipped_live += 1;
                continue;
            }
            self.fail_overdue_job(&job, max_age, &mut report).await?;
        }

        for batch in self.job_store.open_batches()? {
            match self.job_store.refresh_batch(&batch.id) {
                Ok(b) if b.status == BatchStatus::Completed => {
                    info!(
                        "Batch {} finished: {} completed, {} failed",
                        b.id, b.num_completed, b.num_failed
                    );
                    report.batches_closed += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to refresh batch {}: {}", batch.id, e),
            }
        }

        if report != SweepReport::default() {
            info!(
                "Reconciliation: {} stuck records, {} jobs failed, {} batches closed, {} overdue jobs still live",
                report.stuck_records, report.failed_jobs, report.batches_closed, report.skipped_live
            );
        } else {
            debug!("Reconciliation found nothing to do");
        }

        Ok(report)
    }

    /// Returns false when the record was closed by someone else meanwhile.
    async fn close_stuck_record(
        &self,
        record: &StageRecord,
        stuck_after: Duration,
        report: &mut SweepReport,
    ) -> Result<bool, JobError> {
        let message = format!(
            "{} stage stuck in progress for more than {}s",
            record.stage,
            stuck_after.as_secs()
        );

        match self.job_store.fail_stage(record.id, &message) {
            Ok(_) => {}
            Err(JobError::InvalidState { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
        warn!("Job {}: {}", record.job_id, message);
        RECONCILED_STAGE_RECORDS.inc();

        // Only the latest record speaks for the job; an older orphan may sit
        // behind a retry that is still running
        let is_latest = self
            .job_store
            .stage_records(record.job_id)?
            .last()
            .map(|r| r.id == record.id)
            .unwrap_or(false);
        if !is_latest {
            return Ok(true);
        }

        if let Some(job) = self.job_store.get_job(record.job_id)? {
            if job.status == JobStatus::Processing {
                self.fail_job(&job, &message, report).await?;
            }
        }
        Ok(true)
    }

    async fn fail_overdue_job(
        &self,
        job: &Job,
        max_age: Duration,
        report: &mut SweepReport,
    ) -> Result<(), JobError> {
        let message = format!(
            "Job exceeded maximum processing time of {}s",
            max_age.as_secs()
        );

        for record in self.job_store.stage_records(job.id)? {
            if record.status != StageStatus::InProgress {
                continue;
            }
            match self.job_store.fail_stage(record.id, &message) {
                Ok(_) => {
                    RECONCILED_STAGE_RECORDS.inc();
                    report.stuck_records += 1;
                }
                Err(JobError::InvalidState { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.fail_job(job, &message, report).await
    }

    async fn fail_job(
        &self,
        job: &Job,
        message: &str,
        report: &mut SweepReport,
    ) -> Result<(), JobError> {
        match self.job_store.fail_job(job.id, message) {
            Ok(_) => {
                error!("Job {} failed by reconciliation: {}", job.id, message);
                RECONCILED_JOBS.inc();
                JOBS_FINISHED.with_label_values(&["failed"]).inc();
                report.failed_jobs += 1;
            }
            Err(e) if e.is_terminal_conflict() => return Ok(()),
            Err(e) => return Err(e),
        }

        if let Some(dir) = &job.work_dir {
            self.work_dirs.release(dir).await;
        }
        Ok(())
    }

    /// Start the periodic sweep.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("Reconciliation disabled");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Reconciler already running");
            return;
        }

        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_secs(self.config.interval_secs);

        tokio::spawn(async move {
            info!("Reconciliation loop started (every {:?})", interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Reconciliation loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if !this.running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = this.sweep(Utc::now()).await {
                            warn!("Reconciliation sweep failed: {}", e);
                        }
                    }
                }
            }
            info!("Reconciliation loop stopped");
        });
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::job::{CreateJobRequest, SqliteJobStore, StageName};
    use crate::queue::{SqliteTaskQueue, TaskPayload};

    struct Fixture {
        store: Arc<SqliteJobStore>,
        queue: Arc<SqliteTaskQueue>,
        reconciler: Reconciler,
        root: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let queue = Arc::new(SqliteTaskQueue::in_memory().unwrap());
        let reconciler = Reconciler::new(
            ReconcilerConfig::default(),
            store.clone(),
            queue.clone(),
            StagePolicies::default(),
            WorkDirs::new(root.path()),
        );
        Fixture {
            store,
            queue,
            reconciler,
            root,
        }
    }

    async fn processing_job(f: &Fixture, batch_id: Option<String>) -> (i64, PathBuf) {
        let job = f
            .store
            .create_job(CreateJobRequest {
                user_id: 1,
                template_id: 1,
                input_ref: "in.wav".to_string(),
                original_filename: None,
                batch_id,
            })
            .unwrap();
        let dir = WorkDirs::new(f.root.path()).allocate(job.id).await.unwrap();
        f.store.begin_processing(job.id, &dir, "start").unwrap();
        (job.id, dir)
    }

    fn minutes(m: i64) -> chrono::Duration {
        chrono::Duration::minutes(m)
    }

    #[tokio::test]
    async fn test_recent_records_are_left_alone() {
        let f = fixture();
        let (job_id, _) = processing_job(&f, None).await;
        f.store.start_stage(job_id, StageName::Diarization, "t").unwrap();

        let report = f.reconciler.sweep(Utc::now() + minutes(10)).await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(
            f.store.get_job(job_id).unwrap().unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_stuck_latest_record_fails_job() {
        let f = fixture();
        let (job_id, dir) = processing_job(&f, None).await;
        f.store.start_stage(job_id, StageName::Diarization, "t").unwrap();

        // Diarization: 12 min hard limit + 5 min grace
        let report = f.reconciler.sweep(Utc::now() + minutes(18)).await.unwrap();
        assert_eq!(report.stuck_records, 1);
        assert_eq!(report.failed_jobs, 1);

        let records = f.store.stage_records(job_id).unwrap();
        let last = records.last().unwrap();
        assert_eq!(last.status, StageStatus::Failed);
        assert!(last.error_message.as_deref().unwrap().contains("stuck"));

        let job = f.store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("stuck"));
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_unbounded_stage_uses_fallback_budget() {
        let f = fixture();
        let (job_id, _) = processing_job(&f, None).await;
        f.store.start_stage(job_id, StageName::Normalization, "t").unwrap();

        // 30 min fallback + 5 min grace
        let report = f.reconciler.sweep(Utc::now() + minutes(20)).await.unwrap();
        assert_eq!(report.stuck_records, 0);

        let report = f.reconciler.sweep(Utc::now() + minutes(36)).await.unwrap();
        assert_eq!(report.stuck_records, 1);
    }

    #[tokio::test]
    async fn test_orphan_behind_newer_record_keeps_job_running() {
        let f = fixture();
        let (job_id, _) = processing_job(&f, None).await;
        let orphan = f.store.start_stage(job_id, StageName::Diarization, "t1").unwrap();
        f.store.start_stage(job_id, StageName::Transcription, "t2").unwrap();

        // Diarization budget (17 min) passed, transcription budget (20 min) not
        let report = f.reconciler.sweep(Utc::now() + minutes(18)).await.unwrap();
        assert_eq!(report.stuck_records, 1);
        assert_eq!(report.failed_jobs, 0);

        let records = f.store.stage_records(job_id).unwrap();
        let closed = records.iter().find(|r| r.id == orphan.id).unwrap();
        assert_eq!(closed.status, StageStatus::Failed);
        assert_eq!(
            f.store.get_job(job_id).unwrap().unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_overdue_job_is_failed() {
        let f = fixture();
        let (job_id, dir) = processing_job(&f, None).await;

        let report = f.reconciler.sweep(Utc::now() + minutes(121)).await.unwrap();
        assert_eq!(report.failed_jobs, 1);

        let job = f.store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("Job exceeded maximum processing time of 7200s")
        );
        assert!(!dir.exists());
    }

    fn start_task(job_id: i64) -> TaskPayload {
        TaskPayload::StartPipeline {
            job_id,
            input_ref: "in.wav".to_string(),
            template_id: 1,
        }
    }

    #[tokio::test]
    async fn test_overdue_job_with_queued_retry_is_kept() {
        let f = fixture();
        let (job_id, dir) = processing_job(&f, None).await;
        // A retry waiting out its backoff
        f.queue
            .enqueue(&start_task(job_id), Duration::from_secs(60))
            .unwrap();

        let report = f.reconciler.sweep(Utc::now() + minutes(121)).await.unwrap();
        assert_eq!(report.failed_jobs, 0);
        assert_eq!(report.skipped_live, 1);
        assert_eq!(
            f.store.get_job(job_id).unwrap().unwrap().status,
            JobStatus::Processing
        );
        assert!(dir.exists());
    }

    #[tokio::test]
    async fn test_old_record_with_active_lease_is_kept() {
        let f = fixture();
        let (job_id, _) = processing_job(&f, None).await;
        f.store.start_stage(job_id, StageName::Normalization, "t").unwrap();
        f.queue.enqueue(&start_task(job_id), Duration::ZERO).unwrap();
        f.queue
            .lease("w", Duration::from_secs(3 * 60 * 60))
            .unwrap()
            .unwrap();

        // Past the unbounded budget, but the worker still renews its lease
        let report = f.reconciler.sweep(Utc::now() + minutes(40)).await.unwrap();
        assert_eq!(report.stuck_records, 0);
        let records = f.store.stage_records(job_id).unwrap();
        assert_eq!(records.last().unwrap().status, StageStatus::InProgress);

        // Once the lease lapses the record is closed
        let report = f.reconciler.sweep(Utc::now() + minutes(200)).await.unwrap();
        assert_eq!(report.stuck_records, 1);
    }

    #[tokio::test]
    async fn test_sweep_closes_finished_batches() {
        let f = fixture();
        let batch = f.store.create_batch(1, 1).unwrap();
        let (job_id, _) = processing_job(&f, Some(batch.id.clone())).await;
        f.store.complete_job(job_id).unwrap();

        let report = f.reconciler.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.batches_closed, 1);

        let batch = f.store.get_batch(&batch.id).unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.num_completed, 1);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: ReconcilerConfig = toml::from_str("interval_secs = 60").unwrap();
        assert!(config.enabled);
        assert_eq!(config.interval_secs, 60);
        assert_eq!(config.grace_secs, 300);
        assert_eq!(config.job_max_age_secs, 7200);
    }
}
