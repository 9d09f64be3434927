//! Pipeline lifecycle integration tests.
//!
//! These tests run whole chains through the worker pool against a
//! file-backed SQLite database, with mock stage collaborators:
//! - Job and stage record transitions on success
//! - Retry budget and fatal failures
//! - Soft and hard time limits
//! - Cancellation and duplicate start deliveries
//! - Scoring through the LLM scorer
//! - Reconciliation of records left behind by aborted attempts

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use callaudit_core::{
    job::{Job, JobStatus, JobStore, SqliteJobStore, StageName, StageRecord, StageStatus, Vertical},
    pipeline::{
        FailureSentinel, PipelineCoordinator, Reconciler, ReconcilerConfig, Stage, StageExecutor,
        StageLimits, StagePolicies, StagePolicy, TaskDispatcher, WorkDirs,
    },
    queue::{SqliteTaskQueue, TaskPayload, TaskQueue},
    stages::{Collaborators, LlmScorer, ScoringConfig},
    testing::{
        fixtures::{collections_violation_response, sales_response, sample_template, submit_request},
        MockBehavior, MockLlmClient, MockStages,
    },
    worker::{WorkerConfig, WorkerPool},
};

/// Test helper wiring a coordinator, executor and pool to one database.
struct TestHarness {
    store: Arc<SqliteJobStore>,
    queue: Arc<SqliteTaskQueue>,
    coordinator: Arc<PipelineCoordinator>,
    pool: WorkerPool,
    mocks: MockStages,
    work_root: PathBuf,
    _temp_dir: TempDir,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_policies(fast_policies())
    }

    fn with_policies(policies: StagePolicies) -> Self {
        let mocks = MockStages::new();
        Self::build(policies, mocks.clone(), |_| mocks.collaborators())
    }

    fn build(
        policies: StagePolicies,
        mocks: MockStages,
        collaborators: impl FnOnce(Arc<SqliteJobStore>) -> Collaborators,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("callaudit.db");
        let work_root = temp_dir.path().join("work");

        let store = Arc::new(SqliteJobStore::new(&db_path).expect("Failed to create job store"));
        let queue = Arc::new(SqliteTaskQueue::new(&db_path).expect("Failed to create queue"));
        store
            .save_template(&sample_template(1, Vertical::Sales))
            .expect("Failed to save template");
        store
            .save_template(&sample_template(2, Vertical::Collections))
            .expect("Failed to save template");

        let work_dirs = WorkDirs::new(&work_root);
        let coordinator = Arc::new(PipelineCoordinator::new(
            store.clone(),
            queue.clone(),
            work_dirs.clone(),
        ));
        let executor = Arc::new(StageExecutor::new(
            store.clone(),
            collaborators(store.clone()),
            policies,
            work_dirs.clone(),
        ));
        let sentinel = Arc::new(FailureSentinel::new(store.clone(), work_dirs));
        let dispatcher = Arc::new(TaskDispatcher::new(
            coordinator.clone(),
            executor,
            sentinel,
            queue.clone(),
        ));

        let config = WorkerConfig {
            concurrency: 2,
            poll_interval_ms: 10,
            lease_secs: 60,
            work_root: work_root.clone(),
            redelivery_delay_secs: 0,
        };
        let pool = WorkerPool::new(config, queue.clone(), dispatcher);

        Self {
            store,
            queue,
            coordinator,
            pool,
            mocks,
            work_root,
            _temp_dir: temp_dir,
        }
    }

    fn submit(&self, template_id: i64) -> i64 {
        self.coordinator
            .submit(submit_request(template_id, "uploads/call-0001.wav"))
            .expect("Failed to submit job")
            .id
    }

    fn job(&self, id: i64) -> Job {
        self.store.get_job(id).unwrap().expect("job exists")
    }

    fn records(&self, id: i64) -> Vec<StageRecord> {
        self.store.stage_records(id).unwrap()
    }

    async fn wait_for_status(&self, id: i64, status: JobStatus) -> Job {
        for _ in 0..500 {
            let job = self.job(id);
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "job {} never reached {:?}, still {:?}",
            id,
            status,
            self.job(id).status
        );
    }

    async fn wait_until(&self, mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn work_dir_count(&self) -> usize {
        match std::fs::read_dir(&self.work_root) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

/// Default limits, no retry delay.
fn fast_policies() -> StagePolicies {
    StagePolicies::default().with_all(StagePolicy {
        limits: StageLimits::UNLIMITED,
        retry_delay: Duration::ZERO,
    })
}

fn stage_names(records: &[StageRecord]) -> Vec<StageName> {
    records.iter().map(|r| r.stage).collect()
}

fn assert_released(path: Option<&Path>) {
    let path = path.expect("job has a working directory");
    assert!(!path.exists(), "{:?} still exists", path);
}

#[tokio::test]
async fn test_successful_chain_completes_every_stage() {
    let harness = TestHarness::new();
    let job_id = harness.submit(1);
    assert_eq!(harness.job(job_id).status, JobStatus::Queued);

    harness.pool.start().await;
    let job = harness.wait_for_status(job_id, JobStatus::Completed).await;
    harness.pool.stop().await;

    assert!(job.processing_started_at.is_some());
    assert!(job.processing_completed_at.is_some());
    assert!(job.error_message.is_none());

    let records = harness.records(job_id);
    assert_eq!(
        stage_names(&records),
        vec![
            StageName::Uploaded,
            StageName::Normalization,
            StageName::Vad,
            StageName::Diarization,
            StageName::Transcription,
            StageName::Scoring,
        ]
    );
    assert!(records.iter().all(|r| r.status == StageStatus::Completed));
    assert!(records.iter().all(|r| r.finished_at.is_some()));

    for stage in Stage::ALL {
        assert_eq!(harness.mocks.invocations(stage), 1, "{}", stage);
    }
    assert_released(job.work_dir.as_deref());
    assert_eq!(harness.work_dir_count(), 0);
}

#[tokio::test]
async fn test_normalization_exhausts_retry_budget() {
    let harness = TestHarness::new();
    harness.mocks.set_behavior(
        Stage::Normalization,
        MockBehavior::FailRetryable("FFmpeg error: invalid data found".to_string()),
    );
    let job_id = harness.submit(1);

    harness.pool.start().await;
    let job = harness.wait_for_status(job_id, JobStatus::Failed).await;
    harness.pool.stop().await;

    assert_eq!(
        job.error_message.as_deref(),
        Some("FFmpeg error: invalid data found")
    );
    assert_eq!(harness.mocks.invocations(Stage::Normalization), 3);
    assert_eq!(harness.mocks.invocations(Stage::Vad), 0);

    let records = harness.records(job_id);
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].stage, StageName::Uploaded);
    for record in &records[1..] {
        assert_eq!(record.stage, StageName::Normalization);
        assert_eq!(record.status, StageStatus::Failed);
        assert_eq!(
            record.error_message.as_deref(),
            Some("FFmpeg error: invalid data found")
        );
    }
    assert_released(job.work_dir.as_deref());
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let harness = TestHarness::new();
    harness
        .mocks
        .set_behavior(Stage::Transcription, MockBehavior::FailTimes(2));
    let job_id = harness.submit(1);

    harness.pool.start().await;
    harness.wait_for_status(job_id, JobStatus::Completed).await;
    harness.pool.stop().await;

    let transcription: Vec<_> = harness
        .records(job_id)
        .into_iter()
        .filter(|r| r.stage == StageName::Transcription)
        .collect();
    assert_eq!(transcription.len(), 3);
    assert_eq!(transcription[0].status, StageStatus::Failed);
    assert_eq!(transcription[1].status, StageStatus::Failed);
    assert_eq!(transcription[2].status, StageStatus::Completed);
    assert_eq!(harness.mocks.invocations(Stage::Scoring), 1);
}

#[tokio::test]
async fn test_fatal_failure_is_not_retried() {
    let harness = TestHarness::new();
    harness.mocks.set_behavior(
        Stage::Diarization,
        MockBehavior::FailFatal("Audio file not found".to_string()),
    );
    let job_id = harness.submit(1);

    harness.pool.start().await;
    let job = harness.wait_for_status(job_id, JobStatus::Failed).await;
    harness.pool.stop().await;

    assert_eq!(job.error_message.as_deref(), Some("Audio file not found"));
    assert_eq!(harness.mocks.invocations(Stage::Diarization), 1);
    assert_eq!(harness.mocks.invocations(Stage::Transcription), 0);
    assert_eq!(harness.records(job_id).len(), 4);
}

#[tokio::test]
async fn test_soft_time_limit_counts_as_retryable_failure() {
    let policies = fast_policies().with_policy(
        Stage::Vad,
        StagePolicy {
            limits: StageLimits {
                soft: Some(Duration::from_millis(100)),
                hard: None,
            },
            retry_delay: Duration::ZERO,
        },
    );
    let harness = TestHarness::with_policies(policies);
    harness
        .mocks
        .set_behavior(Stage::Vad, MockBehavior::Hang(Duration::from_secs(5)));
    let job_id = harness.submit(1);

    harness.pool.start().await;
    let job = harness.wait_for_status(job_id, JobStatus::Failed).await;
    harness.pool.stop().await;

    let expected = "vad stage timed out: soft time limit of 100ms exceeded";
    assert_eq!(job.error_message.as_deref(), Some(expected));
    assert_eq!(harness.mocks.invocations(Stage::Vad), 3);

    let vad: Vec<_> = harness
        .records(job_id)
        .into_iter()
        .filter(|r| r.stage == StageName::Vad)
        .collect();
    assert_eq!(vad.len(), 3);
    assert!(vad
        .iter()
        .all(|r| r.status == StageStatus::Failed && r.error_message.as_deref() == Some(expected)));
}

#[tokio::test]
async fn test_hard_time_limit_fails_job_through_sentinel() {
    let policies = fast_policies().with_policy(
        Stage::Scoring,
        StagePolicy {
            limits: StageLimits {
                soft: None,
                hard: Some(Duration::from_millis(200)),
            },
            retry_delay: Duration::ZERO,
        },
    );
    let harness = TestHarness::with_policies(policies);
    harness
        .mocks
        .set_behavior(Stage::Scoring, MockBehavior::Hang(Duration::from_secs(30)));
    let job_id = harness.submit(1);

    harness.pool.start().await;
    let job = harness.wait_for_status(job_id, JobStatus::Failed).await;
    harness.wait_until(|| harness.work_dir_count() == 0).await;
    harness.pool.stop().await;

    let message = job.error_message.expect("failure message");
    assert!(message.contains("timed out"), "{}", message);
    assert_eq!(
        message,
        "scoring stage timed out: hard time limit of 200ms exceeded"
    );

    // The aborted attempt never closes its own record
    let records = harness.records(job_id);
    let scoring = records.last().unwrap();
    assert_eq!(scoring.stage, StageName::Scoring);
    assert_eq!(scoring.status, StageStatus::InProgress);

    assert_eq!(harness.mocks.invocations(Stage::Scoring), 1);
    assert_eq!(harness.pool.status().hard_timeouts, 1);
    assert_released(job.work_dir.as_deref());
}

#[tokio::test]
async fn test_panicking_stage_fails_job() {
    let harness = TestHarness::new();
    harness.mocks.set_behavior(
        Stage::Diarization,
        MockBehavior::Panic("model crashed".to_string()),
    );
    let job_id = harness.submit(1);

    harness.pool.start().await;
    let job = harness.wait_for_status(job_id, JobStatus::Failed).await;
    harness.pool.stop().await;

    let message = job.error_message.unwrap();
    assert!(message.starts_with("diarization stage failed unexpectedly"), "{}", message);
    assert!(message.contains("model crashed"), "{}", message);
    assert_eq!(harness.mocks.invocations(Stage::Diarization), 1);
}

#[tokio::test]
async fn test_cancelled_job_stops_before_next_stage() {
    let harness = TestHarness::new();
    harness
        .mocks
        .set_behavior(Stage::Vad, MockBehavior::Hang(Duration::from_millis(300)));
    let job_id = harness.submit(1);

    harness.pool.start().await;
    harness
        .wait_until(|| harness.mocks.invocations(Stage::Vad) == 1)
        .await;
    let cancelled = harness
        .coordinator
        .cancel(job_id, "Cancelled by user")
        .unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    harness.wait_until(|| harness.work_dir_count() == 0).await;
    harness
        .wait_until(|| harness.queue.stats().map(|s| s.total() == 0).unwrap_or(false))
        .await;
    harness.pool.stop().await;

    let job = harness.job(job_id);
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_message.as_deref(), Some("Cancelled by user"));
    assert_eq!(harness.mocks.invocations(Stage::Diarization), 0);
}

#[tokio::test]
async fn test_duplicate_start_runs_one_chain() {
    let harness = TestHarness::new();
    let job_id = harness.submit(1);
    // A redelivered start for the same job
    harness
        .queue
        .enqueue(
            &TaskPayload::StartPipeline {
                job_id,
                input_ref: "uploads/call-0001.wav".to_string(),
                template_id: 1,
            },
            Duration::ZERO,
        )
        .unwrap();

    harness.pool.start().await;
    harness.wait_for_status(job_id, JobStatus::Completed).await;
    harness
        .wait_until(|| harness.queue.stats().map(|s| s.total() == 0).unwrap_or(false))
        .await;
    harness.pool.stop().await;

    let uploaded = harness
        .records(job_id)
        .into_iter()
        .filter(|r| r.stage == StageName::Uploaded)
        .count();
    assert_eq!(uploaded, 1);
    assert_eq!(harness.mocks.invocations(Stage::Normalization), 1);
    assert_eq!(harness.mocks.invocations(Stage::Scoring), 1);
}

#[tokio::test]
async fn test_jobs_run_independently() {
    let harness = TestHarness::new();
    harness
        .mocks
        .set_behavior(Stage::Scoring, MockBehavior::FailTimes(1));
    let first = harness.submit(1);
    let second = harness.submit(1);

    harness.pool.start().await;
    harness.wait_for_status(first, JobStatus::Completed).await;
    harness.wait_for_status(second, JobStatus::Completed).await;
    harness.pool.stop().await;

    let first_dir = harness.job(first).work_dir.unwrap();
    let second_dir = harness.job(second).work_dir.unwrap();
    assert_ne!(first_dir, second_dir);
    assert_eq!(harness.mocks.invocations(Stage::Scoring), 3);
}

fn llm_harness(llm: MockLlmClient) -> TestHarness {
    let mocks = MockStages::new();
    let stage_mocks = mocks.clone();
    TestHarness::build(fast_policies(), mocks, move |store| {
        let mut collaborators = stage_mocks.collaborators();
        collaborators.scorer = Arc::new(LlmScorer::new(
            Arc::new(llm),
            store,
            ScoringConfig::default(),
        ));
        collaborators
    })
}

#[tokio::test]
async fn test_collections_fatal_flaw_zeroes_score() {
    let llm = MockLlmClient::new();
    llm.push_response(collections_violation_response());
    let harness = llm_harness(llm.clone());
    let job_id = harness.submit(2);

    harness.pool.start().await;
    harness.wait_for_status(job_id, JobStatus::Completed).await;
    harness.pool.stop().await;

    let evaluation = harness.store.evaluation(job_id).unwrap().expect("evaluation saved");
    assert_eq!(evaluation.overall_score, 0.0);
    assert!(evaluation.fatal_flaw_detected);
    assert_eq!(
        evaluation.fatal_flaw_type.as_deref(),
        Some("threatened legal action")
    );
    assert_eq!(evaluation.pillar_scores.get("CMP"), Some(&40.0));
    assert_eq!(evaluation.model_used, "mock-llm");

    let requests = llm.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].prompt.contains("[Agent]"));

    let scoring = harness.records(job_id).pop().unwrap();
    assert_eq!(scoring.stage, StageName::Scoring);
    assert_eq!(scoring.metadata.get("fatal_flaw"), Some(&serde_json::json!(true)));
}

#[tokio::test]
async fn test_sales_call_is_scored_by_weighted_pillars() {
    let llm = MockLlmClient::new();
    llm.push_response(sales_response());
    let harness = llm_harness(llm);
    let job_id = harness.submit(1);

    harness.pool.start().await;
    harness.wait_for_status(job_id, JobStatus::Completed).await;
    harness.pool.stop().await;

    let evaluation = harness.store.evaluation(job_id).unwrap().unwrap();
    assert!((evaluation.overall_score - 79.5).abs() < 1e-9);
    assert!(!evaluation.fatal_flaw_detected);
    assert_eq!(evaluation.pillar_scores.len(), 5);
    assert_eq!(evaluation.summary.as_deref(), Some("Well handled sale."));
}

#[tokio::test]
async fn test_reconciler_closes_record_left_by_hard_timeout() {
    let policies = fast_policies().with_policy(
        Stage::Transcription,
        StagePolicy {
            limits: StageLimits {
                soft: None,
                hard: Some(Duration::from_millis(100)),
            },
            retry_delay: Duration::ZERO,
        },
    );
    let harness = TestHarness::with_policies(policies.clone());
    harness
        .mocks
        .set_behavior(Stage::Transcription, MockBehavior::Hang(Duration::from_secs(30)));
    let job_id = harness.submit(1);

    harness.pool.start().await;
    harness.wait_for_status(job_id, JobStatus::Failed).await;
    harness.pool.stop().await;

    let reconciler = Reconciler::new(
        ReconcilerConfig {
            grace_secs: 0,
            ..ReconcilerConfig::default()
        },
        harness.store.clone(),
        harness.queue.clone(),
        policies,
        WorkDirs::new(&harness.work_root),
    );
    let report = reconciler
        .sweep(chrono::Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(report.stuck_records, 1);
    assert_eq!(report.failed_jobs, 0);

    let transcription = harness.records(job_id).pop().unwrap();
    assert_eq!(transcription.stage, StageName::Transcription);
    assert_eq!(transcription.status, StageStatus::Failed);

    // The sentinel's message stays on the job
    let job = harness.job(job_id);
    assert!(job
        .error_message
        .unwrap()
        .starts_with("transcription stage timed out: hard time limit"));

    let again = reconciler
        .sweep(chrono::Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(again.stuck_records, 0);
}
