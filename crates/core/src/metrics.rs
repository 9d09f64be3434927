//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Stage attempts (results, durations, retries, hard timeouts)
//! - Job lifecycle (started, finished by status, chain failures)
//! - Maintenance sweeps, worker tasks and model usage

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Stage Metrics
// =============================================================================

/// Stage attempts by stage and result.
pub static STAGE_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("callaudit_stage_attempts_total", "Total stage attempts"),
        &["stage", "result"], // "completed", "retry", "failed"
    )
    .unwrap()
});

/// Stage attempt duration in seconds.
pub static STAGE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "callaudit_stage_duration_seconds",
            "Duration of stage attempts",
        )
        .buckets(vec![
            0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0, 1200.0,
        ]),
        &["stage"],
    )
    .unwrap()
});

/// Retries scheduled by stage.
pub static STAGE_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("callaudit_stage_retries_total", "Total stage retries scheduled"),
        &["stage"],
    )
    .unwrap()
});

/// Stage attempts aborted by their hard time limit.
pub static STAGE_HARD_TIMEOUTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "callaudit_stage_hard_timeouts_total",
            "Stage attempts aborted at the hard time limit",
        ),
        &["stage"],
    )
    .unwrap()
});

// =============================================================================
// Job Metrics
// =============================================================================

/// Chains started.
pub static JOBS_STARTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("callaudit_jobs_started_total", "Total pipeline chains started").unwrap()
});

/// Jobs reaching a terminal status, by status.
pub static JOBS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("callaudit_jobs_finished_total", "Total jobs finished"),
        &["status"], // "completed", "failed", "cancelled"
    )
    .unwrap()
});

/// Chain failures handled by the failure sentinel.
pub static CHAIN_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "callaudit_chain_failures_total",
        "Chain failures handled by the failure sentinel",
    )
    .unwrap()
});

// =============================================================================
// Maintenance Metrics
// =============================================================================

/// Stuck stage records marked failed by the reconciliation sweep.
pub static RECONCILED_STAGE_RECORDS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "callaudit_reconciled_stage_records_total",
        "Stuck stage records marked failed",
    )
    .unwrap()
});

/// Jobs failed by the reconciliation sweep.
pub static RECONCILED_JOBS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "callaudit_reconciled_jobs_total",
        "Stuck jobs marked failed",
    )
    .unwrap()
});

// =============================================================================
// Worker Metrics
// =============================================================================

/// Queue tasks handled by kind and result.
pub static TASKS_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("callaudit_tasks_processed_total", "Total queue tasks handled"),
        &["kind", "result"], // "ok", "error", "panicked", "timed_out", "dead_lettered"
    )
    .unwrap()
});

// =============================================================================
// Model Metrics
// =============================================================================

/// Worker-local model loads by model and result.
pub static MODEL_LOADS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("callaudit_model_loads_total", "Total model load attempts"),
        &["model", "result"],
    )
    .unwrap()
});

/// LLM token usage.
pub static LLM_TOKENS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("callaudit_llm_tokens_total", "Total LLM tokens used"),
        &["provider", "direction"], // direction: "input", "output"
    )
    .unwrap()
});

/// Get all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        Box::new(STAGE_ATTEMPTS.clone()),
        Box::new(STAGE_DURATION.clone()),
        Box::new(STAGE_RETRIES.clone()),
        Box::new(STAGE_HARD_TIMEOUTS.clone()),
        Box::new(JOBS_STARTED.clone()),
        Box::new(JOBS_FINISHED.clone()),
        Box::new(CHAIN_FAILURES.clone()),
        Box::new(RECONCILED_STAGE_RECORDS.clone()),
        Box::new(RECONCILED_JOBS.clone()),
        Box::new(TASKS_PROCESSED.clone()),
        Box::new(MODEL_LOADS.clone()),
        Box::new(LLM_TOKENS.clone()),
    ]
}
