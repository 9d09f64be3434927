//! Worker pool configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of tasks processed in parallel by this process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How long an idle worker waits before polling the queue again (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long a leased task stays invisible to other workers. The lease is
    /// renewed while its handler runs, so this bounds how long the task of a
    /// crashed worker waits before redelivery.
    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    /// Root under which per-job working directories are created.
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,

    /// Delay before a task whose handler errored is delivered again.
    #[serde(default = "default_redelivery_delay")]
    pub redelivery_delay_secs: u64,
}

fn default_concurrency() -> usize {
    2
}

fn default_poll_interval() -> u64 {
    500
}

fn default_lease() -> u64 {
    60
}

fn default_work_root() -> PathBuf {
    PathBuf::from("work")
}

fn default_redelivery_delay() -> u64 {
    10
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
            lease_secs: default_lease(),
            work_root: default_work_root(),
            redelivery_delay_secs: default_redelivery_delay(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// How often a running task's lease is renewed.
    pub fn lease_renewal_interval(&self) -> Duration {
        (self.lease() / 3).max(Duration::from_millis(10))
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_secs(self.redelivery_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.lease(), Duration::from_secs(60));
        assert_eq!(config.lease_renewal_interval(), Duration::from_secs(20));
        assert_eq!(config.work_root, PathBuf::from("work"));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: WorkerConfig = toml::from_str(
            r#"
            concurrency = 8
            work_root = "/var/lib/callaudit/work"
        "#,
        )
        .unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.work_root, PathBuf::from("/var/lib/callaudit/work"));
        assert_eq!(config.redelivery_delay_secs, 10);
    }
}
