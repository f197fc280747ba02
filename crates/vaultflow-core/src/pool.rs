//! Fixed-size worker pool over a bounded queue
//!
//! Each pool spawns exactly `worker_count` long-lived tasks that share the
//! receiving half of a bounded `mpsc` channel. A worker finishes one job
//! before pulling the next, so in-flight jobs never exceed `worker_count`.
//!
//! ```text
//!  submit() ──▶ [ bounded queue ] ──▶ worker 0 ─┐
//!     ▲  (waits when full)          ──▶ worker 1 ─┼─▶ handler(job)
//!     │                             ──▶ worker N ─┘
//!  cancel ──▶ submit() hands the job back
//! ```
//!
//! [`WorkerPool::wait`] closes the queue, lets the workers drain everything
//! already enqueued and joins them.

use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Worker pool configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker tasks
    pub worker_count: usize,
    /// Bounded queue capacity
    pub queue_depth: usize,
}

impl PoolConfig {
    /// `worker_count` workers with a queue of twice that depth
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        Self {
            worker_count,
            queue_depth: worker_count * 2,
        }
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(8)
    }
}

/// Worker pool counters
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl WorkerStats {
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Highest number of jobs observed running at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    fn job_started(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
    }

    fn job_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A fixed set of workers pulling jobs of type `J` from a bounded queue
pub struct WorkerPool<J> {
    name: String,
    sender: Option<mpsc::Sender<J>>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    stats: Arc<WorkerStats>,
}

impl<J> std::fmt::Debug for WorkerPool<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.workers.len())
            .field("in_flight", &self.stats.in_flight())
            .finish()
    }
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawn `config.worker_count` workers running `handler` for each job.
    ///
    /// `cancel` only stops new submissions; jobs already queued are still
    /// handed to `handler`, which is expected to observe the same token.
    pub fn spawn<H, Fut>(
        name: impl Into<String>,
        config: PoolConfig,
        cancel: CancellationToken,
        handler: H,
    ) -> Self
    where
        H: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let worker_count = config.worker_count.max(1);
        let (sender, receiver) = mpsc::channel(config.queue_depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let handler = Arc::new(handler);
        let stats = Arc::new(WorkerStats::default());

        let workers = (0..worker_count)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let handler = Arc::clone(&handler);
                let stats = Arc::clone(&stats);
                let pool = name.clone();
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = receiver.lock().await;
                            rx.recv().await
                        };
                        let Some(job) = job else { break };

                        stats.job_started();
                        handler(job).await;
                        stats.job_finished();
                    }
                    debug!("Worker {}/{} exiting", pool, id);
                })
            })
            .collect();

        debug!(
            "Spawned pool '{}' with {} workers (queue depth {})",
            name, worker_count, config.queue_depth
        );

        Self {
            name,
            sender: Some(sender),
            workers,
            cancel,
            stats,
        }
    }

    /// Enqueue a job, waiting while the queue is full.
    ///
    /// Returns the job back if the pool's token fires before a slot frees up
    /// or the queue is already closed.
    pub async fn submit(&self, job: J) -> Result<(), J> {
        let Some(sender) = &self.sender else {
            return Err(job);
        };
        if self.cancel.is_cancelled() {
            return Err(job);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(job),
            permit = sender.reserve() => match permit {
                Ok(permit) => {
                    permit.send(job);
                    self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(_) => Err(job),
            },
        }
    }

    /// Close the queue, drain enqueued jobs and join every worker.
    pub async fn wait(mut self) {
        self.sender.take();
        for result in join_all(self.workers.drain(..)).await {
            if let Err(e) = result {
                error!("Worker in pool '{}' terminated abnormally: {}", self.name, e);
            }
        }
        debug!(
            "Pool '{}' drained: {} jobs completed",
            self.name,
            self.stats.completed.load(Ordering::Relaxed)
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }
}
