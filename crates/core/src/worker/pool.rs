//! Fixed-size pool of queue workers.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::metrics::TASKS_PROCESSED;
use crate::queue::{LeasedTask, TaskQueue};

use super::{AbortReason, TaskHandler, WorkerConfig};

#[derive(Debug, Default)]
struct Counters {
    busy: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    hard_timeouts: AtomicU64,
}

/// Snapshot of pool activity.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub running: bool,
    pub workers: usize,
    pub busy: usize,
    /// Tasks whose handler returned successfully.
    pub processed: u64,
    /// Tasks handed back after a handler error.
    pub failed: u64,
    pub hard_timeouts: u64,
}

/// Runs `concurrency` workers, each leasing and handling one task at a time.
pub struct WorkerPool {
    config: WorkerConfig,
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn TaskHandler>,

    // Runtime state
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            handler,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Spawn the workers.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Worker pool already running");
            return;
        }

        let mut handles = self.handles.lock().await;
        for index in 0..self.config.concurrency {
            handles.push(self.spawn_worker(index));
        }

        info!("Worker pool started with {} workers", self.config.concurrency);
    }

    /// Stop leasing new tasks and wait for in-flight ones to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Worker pool not running");
            return;
        }

        info!("Stopping worker pool");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker exited abnormally: {}", e);
            }
        }

        info!("Worker pool stopped");
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            running: self.running.load(Ordering::Relaxed),
            workers: self.config.concurrency,
            busy: self.counters.busy.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            hard_timeouts: self.counters.hard_timeouts.load(Ordering::Relaxed),
        }
    }

    fn spawn_worker(&self, index: usize) -> JoinHandle<()> {
        let name = format!("worker-{}-{}", std::process::id(), index);
        let running = Arc::clone(&self.running);
        let queue = Arc::clone(&self.queue);
        let handler = Arc::clone(&self.handler);
        let counters = Arc::clone(&self.counters);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            debug!("{} started", name);
            loop {
                if !running.load(Ordering::Relaxed) {
                    break;
                }

                match queue.lease(&name, config.lease()) {
                    Ok(Some(task)) => {
                        Self::process(&queue, &handler, &counters, &config, &name, task).await;
                        // Drain without sleeping while there is work
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("{} failed to lease a task: {}", name, e),
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(config.poll_interval()) => {}
                }
            }
            debug!("{} stopped", name);
        })
    }

    async fn process(
        queue: &Arc<dyn TaskQueue>,
        handler: &Arc<dyn TaskHandler>,
        counters: &Counters,
        config: &WorkerConfig,
        worker: &str,
        task: LeasedTask,
    ) {
        let kind = task.payload.kind();
        debug!(
            "Handling {} task {} for job {} (delivery {})",
            kind,
            task.id,
            task.payload.job_id(),
            task.deliveries
        );

        counters.busy.fetch_add(1, Ordering::Relaxed);
        let limit = handler.hard_limit(&task.payload);

        let mut join = {
            let handler = Arc::clone(handler);
            let task = task.clone();
            tokio::spawn(async move { handler.handle(&task).await })
        };

        let run = async {
            match limit {
                Some(limit) => match tokio::time::timeout(limit, &mut join).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        // Drop the attempt mid-flight, as if its worker was killed
                        join.abort();
                        None
                    }
                },
                None => Some((&mut join).await),
            }
        };
        let finished = Self::renewing_lease(queue, worker, &task, config, run).await;

        match finished {
            Some(Ok(Ok(()))) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                TASKS_PROCESSED.with_label_values(&[kind, "ok"]).inc();
                Self::ack(queue, &task);
            }
            Some(Ok(Err(e))) => {
                warn!(
                    "{} task {} for job {} failed, redelivering: {}",
                    kind,
                    task.id,
                    task.payload.job_id(),
                    e
                );
                counters.failed.fetch_add(1, Ordering::Relaxed);
                TASKS_PROCESSED.with_label_values(&[kind, "error"]).inc();
                if let Err(e) = queue.release(&task.id, config.redelivery_delay()) {
                    warn!("Failed to release task {}: {}", task.id, e);
                }
            }
            Some(Err(join_err)) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    join_err.to_string()
                };
                error!("{} task {} panicked: {}", kind, task.id, message);
                TASKS_PROCESSED.with_label_values(&[kind, "panicked"]).inc();
                handler.on_aborted(&task, AbortReason::Panicked(message)).await;
                Self::ack(queue, &task);
            }
            None => {
                let limit = limit.unwrap_or_default();
                error!(
                    "{} task {} for job {} exceeded its hard time limit of {:?}",
                    kind,
                    task.id,
                    task.payload.job_id(),
                    limit
                );
                counters.hard_timeouts.fetch_add(1, Ordering::Relaxed);
                TASKS_PROCESSED.with_label_values(&[kind, "timed_out"]).inc();
                handler.on_aborted(&task, AbortReason::HardTimeout(limit)).await;
                Self::ack(queue, &task);
            }
        }

        counters.busy.fetch_sub(1, Ordering::Relaxed);
    }

    /// Drive `run` to completion while keeping the task's lease alive, so a
    /// long stage is never handed to a second worker.
    async fn renewing_lease<T>(
        queue: &Arc<dyn TaskQueue>,
        worker: &str,
        task: &LeasedTask,
        config: &WorkerConfig,
        run: impl Future<Output = T>,
    ) -> T {
        tokio::pin!(run);
        let period = config.lease_renewal_interval();
        let mut renew = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                out = &mut run => return out,
                _ = renew.tick() => {
                    if let Err(e) = queue.extend_lease(&task.id, worker, config.lease()) {
                        warn!("Failed to renew lease of task {}: {}", task.id, e);
                    }
                }
            }
        }
    }

    fn ack(queue: &Arc<dyn TaskQueue>, task: &LeasedTask) {
        // An unacked task comes back once its lease expires
        if let Err(e) = queue.ack(&task.id) {
            warn!("Failed to ack task {}: {}", task.id, e);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
