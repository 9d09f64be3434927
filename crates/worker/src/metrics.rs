//! Prometheus metrics for the worker process.
//!
//! This module provides metrics for:
//! - HTTP request metrics of the ops endpoints
//! - Worker pool and reconciler state
//! - Queue depth and job counts (collected on scrape)

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use callaudit_core::job::{JobFilter, JobStatus};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "callaudit_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("callaudit_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

// =============================================================================
// Worker Metrics (collected dynamically)
// =============================================================================

/// Whether the worker pool is leasing tasks.
pub static POOL_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "callaudit_worker_pool_running",
        "Whether the worker pool is running (1 = running)",
    )
    .unwrap()
});

/// Workers currently handling a task.
pub static WORKERS_BUSY: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("callaudit_workers_busy", "Workers currently handling a task").unwrap()
});

/// Whether the reconciliation loop is running.
pub static RECONCILER_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "callaudit_reconciler_running",
        "Whether the reconciliation loop is running (1 = running)",
    )
    .unwrap()
});

/// Queued tasks by state.
pub static QUEUE_TASKS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("callaudit_queue_tasks", "Queued tasks by state"),
        &["state"], // "ready", "delayed", "leased"
    )
    .unwrap()
});

/// Jobs by current status.
pub static JOBS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("callaudit_jobs_by_status", "Current job count by status"),
        &["status"],
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();

    // Worker
    registry.register(Box::new(POOL_RUNNING.clone())).unwrap();
    registry.register(Box::new(WORKERS_BUSY.clone())).unwrap();
    registry
        .register(Box::new(RECONCILER_RUNNING.clone()))
        .unwrap();
    registry.register(Box::new(QUEUE_TASKS.clone())).unwrap();
    registry.register(Box::new(JOBS_BY_STATUS.clone())).unwrap();

    // Core metrics (stages, jobs, queue workers, models, LLM)
    for metric in callaudit_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

pub const JOB_STATUSES: [JobStatus; 5] = [
    JobStatus::Queued,
    JobStatus::Processing,
    JobStatus::Completed,
    JobStatus::Failed,
    JobStatus::Cancelled,
];

/// Refresh the gauges from the pool, the queue and the job store.
pub fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let pool = state.pool().status();
    POOL_RUNNING.set(if pool.running { 1 } else { 0 });
    WORKERS_BUSY.set(pool.busy as i64);
    RECONCILER_RUNNING.set(if state.reconciler().is_running() { 1 } else { 0 });

    if let Ok(stats) = state.queue().stats() {
        QUEUE_TASKS.with_label_values(&["ready"]).set(stats.ready as i64);
        QUEUE_TASKS.with_label_values(&["delayed"]).set(stats.delayed as i64);
        QUEUE_TASKS.with_label_values(&["leased"]).set(stats.leased as i64);
    }

    for status in JOB_STATUSES {
        let filter = JobFilter::new().with_status(status);
        if let Ok(count) = state.job_store().count_jobs(&filter) {
            JOBS_BY_STATUS
                .with_label_values(&[status.as_str()])
                .set(count);
        }
    }
}

/// Normalize a path for metric labels (replace IDs with placeholders).
pub fn normalize_path(path: &str) -> String {
    let numeric_regex = regex_lite::Regex::new(r"/\d+(/|$)").unwrap();
    numeric_regex.replace_all(path, "/{id}$1").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_numeric() {
        assert_eq!(normalize_path("/api/v1/jobs/42"), "/api/v1/jobs/{id}");
        assert_eq!(
            normalize_path("/api/v1/jobs/42/stages"),
            "/api/v1/jobs/{id}/stages"
        );
    }

    #[test]
    fn test_normalize_path_no_ids() {
        assert_eq!(normalize_path("/api/v1/health"), "/api/v1/health");
    }

    #[test]
    fn test_registry_contains_worker_and_core_metrics() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/test", "200"])
            .inc();
        POOL_RUNNING.set(0);
        QUEUE_TASKS.with_label_values(&["ready"]).set(0);
        JOBS_BY_STATUS.with_label_values(&["queued"]).set(0);
        callaudit_core::metrics::JOBS_STARTED.inc();

        let output = encode_metrics();
        assert!(output.contains("# HELP"));
        assert!(output.contains("callaudit_http_requests_total"));
        assert!(output.contains("callaudit_worker_pool_running"));
        assert!(output.contains("callaudit_queue_tasks"));
        assert!(output.contains("callaudit_jobs_by_status"));
        assert!(output.contains("callaudit_jobs_started_total"));
    }
}
