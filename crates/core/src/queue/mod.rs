//! Durable task queue.
//!
//! Delivery is at-least-once: a task is acked only after its handler returns.
//! A worker keeps renewing the lease of the task it runs; one that dies
//! mid-task leaves a lease that expires, and the task is delivered again.

mod sqlite_queue;
mod types;

use std::time::Duration;

pub use sqlite_queue::SqliteTaskQueue;
pub use types::{LeasedTask, QueueError, QueueStats, Task, TaskPayload};

/// A queue of [`TaskPayload`]s with delayed delivery and leases.
pub trait TaskQueue: Send + Sync {
    /// Add a task that becomes deliverable after `delay`. Returns its id.
    fn enqueue(&self, payload: &TaskPayload, delay: Duration) -> Result<String, QueueError>;

    /// Take the oldest deliverable task for `worker`, holding it for `lease_for`.
    fn lease(&self, worker: &str, lease_for: Duration) -> Result<Option<LeasedTask>, QueueError>;

    /// Remove a task after its handler finished.
    fn ack(&self, id: &str) -> Result<(), QueueError>;

    /// Push the lease of a task `worker` still holds `lease_for` into the future.
    fn extend_lease(&self, id: &str, worker: &str, lease_for: Duration) -> Result<(), QueueError>;

    /// Hand a leased task back, deliverable again after `delay`.
    fn release(&self, id: &str, delay: Duration) -> Result<(), QueueError>;

    /// Tasks of one job that have not been acked, oldest first.
    fn pending_for_job(&self, job_id: i64) -> Result<Vec<Task>, QueueError>;

    fn stats(&self) -> Result<QueueStats, QueueError>;
}
