//! Worker pool that drains the task queue.

mod config;
mod pool;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::pipeline::DispatchError;
use crate::queue::{LeasedTask, TaskPayload};

pub use config::WorkerConfig;
pub use pool::{PoolStatus, WorkerPool};

/// Why a task was dropped without its handler finishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The task's hard time limit elapsed.
    HardTimeout(Duration),
    /// The handler panicked.
    Panicked(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::HardTimeout(limit) => write!(f, "hard timeout after {:?}", limit),
            AbortReason::Panicked(msg) => write!(f, "panicked: {}", msg),
        }
    }
}

/// Handles the tasks leased by the pool.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process one task. An error hands the task back for redelivery.
    async fn handle(&self, task: &LeasedTask) -> Result<(), DispatchError>;

    /// Wall-clock limit after which the pool drops the task.
    fn hard_limit(&self, _payload: &TaskPayload) -> Option<Duration> {
        None
    }

    /// Called after a task was dropped. The task is acked afterwards.
    async fn on_aborted(&self, task: &LeasedTask, reason: AbortReason);
}
