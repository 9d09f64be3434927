use std::sync::Arc;

use callaudit_core::{
    job::JobStore, pipeline::Reconciler, queue::TaskQueue, Config, SanitizedConfig, WorkerPool,
};

/// Shared state of the ops endpoints
pub struct AppState {
    config: Config,
    job_store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    pool: Arc<WorkerPool>,
    reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(
        config: Config,
        job_store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        pool: Arc<WorkerPool>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            config,
            job_store,
            queue,
            pool,
            reconciler,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn job_store(&self) -> &dyn JobStore {
        self.job_store.as_ref()
    }

    pub fn queue(&self) -> &dyn TaskQueue {
        self.queue.as_ref()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }
}
