//! Batch engine
//!
//! Drives one submission end to end:
//!
//! ```text
//! operations ──▶ split_into_batches ──▶ WorkerPool ──▶ Retrier(VaultApi) ──▶ ResultCollector
//!  (indexed)      (kind + destination)   (N workers)    (per batch)           (slot per index)
//! ```
//!
//! Every submitted operation gets exactly one result. Batches complete in
//! any order; results come back in index order. A batch that exhausts its
//! retries fails only its own items.
//!
//! The optional submission timeout cancels a child token; items already
//! finished keep their results and the rest report `Cancelled`.

use crate::batch::{split_into_batches, Batch};
use crate::client::VaultApi;
use crate::collector::{ResultCollector, RunStatsSnapshot};
use crate::config::EngineConfig;
use crate::error::{ErrorKind, ItemError, Result, VaultError};
use crate::pool::{PoolConfig, WorkerPool};
use crate::retry::{Retrier, RetryConfig};
use crate::types::{Destination, Operation, OperationResult, RecordOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum operations per batch
    pub batch_size: usize,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    /// Deadline for one call to [`BatchEngine::run`]
    pub submission_timeout: Option<Duration>,
    /// Cancel the rest of the run when a batch fails authentication
    pub abort_on_auth: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            batch_size: 25,
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            submission_timeout: None,
            abort_on_auth: false,
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            pool: PoolConfig::new(config.worker_count).with_queue_depth(config.queue_depth()),
            retry: config.retry_config(),
            submission_timeout: config.submission_timeout(),
            abort_on_auth: false,
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_submission_timeout(mut self, timeout: Duration) -> Self {
        self.submission_timeout = Some(timeout);
        self
    }

    pub fn with_abort_on_auth(mut self, abort: bool) -> Self {
        self.abort_on_auth = abort;
        self
    }
}

/// Outcome of one submission
#[derive(Debug, Clone)]
pub struct RunReport {
    /// One result per submitted operation, in index order
    pub results: Vec<OperationResult>,
    pub stats: RunStatsSnapshot,
    pub elapsed: Duration,
    /// The submission deadline fired before every batch finished
    pub timed_out: bool,
    /// A batch failed with HTTP 401
    pub auth_failed: bool,
}

impl RunReport {
    fn empty() -> Self {
        Self {
            results: Vec::new(),
            stats: RunStatsSnapshot::default(),
            elapsed: Duration::ZERO,
            timed_out: false,
            auth_failed: false,
        }
    }

    pub fn is_complete_success(&self) -> bool {
        self.results.iter().all(OperationResult::is_success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &OperationResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

/// The batched, retrying, concurrency-bounded engine
pub struct BatchEngine {
    name: String,
    api: Arc<dyn VaultApi>,
    retrier: Arc<Retrier>,
    options: EngineOptions,
}

impl std::fmt::Debug for BatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEngine")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

impl BatchEngine {
    pub fn new(api: Arc<dyn VaultApi>, options: EngineOptions) -> Self {
        let retrier = Arc::new(Retrier::new(options.retry.clone()));
        Self {
            name: "engine".to_string(),
            api,
            retrier,
            options,
        }
    }

    /// Name used for the worker pool and in logs
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the jitter source, e.g. with a seeded one
    pub fn with_retrier(mut self, retrier: Retrier) -> Self {
        self.retrier = Arc::new(retrier);
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Execute `operations` and return one result per operation.
    ///
    /// Indices must be exactly `0..operations.len()` in any order. Fails only
    /// on invalid input; remote failures are reported per item.
    pub async fn run(
        &self,
        operations: Vec<Operation>,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        validate_indices(&operations)?;
        if operations.is_empty() {
            return Ok(RunReport::empty());
        }

        let start = Instant::now();
        let total = operations.len();
        let collector = Arc::new(ResultCollector::new(total));
        let auth_failed = Arc::new(AtomicBool::new(false));
        let run_cancel = cancel.child_token();

        let deadline = self.options.submission_timeout.map(|timeout| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => false,
                    _ = tokio::time::sleep(timeout) => {
                        token.cancel();
                        true
                    }
                }
            })
        });

        let batches = split_into_batches(operations, self.options.batch_size);
        debug!(
            "{}: {} operations in {} batches",
            self.name,
            total,
            batches.len()
        );

        let pool = {
            let api = Arc::clone(&self.api);
            let retrier = Arc::clone(&self.retrier);
            let collector = Arc::clone(&collector);
            let auth_failed = Arc::clone(&auth_failed);
            let run_cancel = run_cancel.clone();
            let abort_on_auth = self.options.abort_on_auth;
            WorkerPool::spawn(
                self.name.clone(),
                self.options.pool,
                run_cancel.clone(),
                move |batch: Batch| {
                    let api = Arc::clone(&api);
                    let retrier = Arc::clone(&retrier);
                    let collector = Arc::clone(&collector);
                    let auth_failed = Arc::clone(&auth_failed);
                    let run_cancel = run_cancel.clone();
                    async move {
                        let auth_failure =
                            dispatch_batch(api.as_ref(), &retrier, &collector, batch, &run_cancel)
                                .await;
                        if auth_failure {
                            auth_failed.store(true, Ordering::Release);
                            if abort_on_auth {
                                run_cancel.cancel();
                            }
                        }
                    }
                },
            )
        };

        let mut unsubmitted = 0usize;
        let mut batches = batches.into_iter();
        for batch in batches.by_ref() {
            if let Err(batch) = pool.submit(batch).await {
                unsubmitted += batch.len();
                break;
            }
        }
        unsubmitted += batches.map(|b| b.len()).sum::<usize>();
        pool.wait().await;

        let timed_out = match deadline {
            Some(handle) => {
                run_cancel.cancel();
                handle.await.unwrap_or(false)
            }
            None => false,
        };
        if unsubmitted > 0 {
            warn!(
                "{}: {} operations not dispatched before cancellation",
                self.name, unsubmitted
            );
        }

        let (results, stats) = collector.finish();
        let report = RunReport {
            results,
            stats,
            elapsed: start.elapsed(),
            timed_out,
            auth_failed: auth_failed.load(Ordering::Acquire),
        };
        info!(
            "{}: {} succeeded ({} after retry), {} failed, {} cancelled in {:?} ({} batches, {} attempts)",
            self.name,
            stats.succeeded,
            stats.retried_succeeded,
            stats.failed,
            stats.cancelled,
            report.elapsed,
            stats.batches,
            stats.attempts
        );
        Ok(report)
    }

    /// Tokenize `values` into `destination`, results in input order
    pub async fn tokenize_values<I, S>(
        &self,
        values: I,
        destination: &Destination,
        cancel: &CancellationToken,
    ) -> Result<RunReport>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let operations = values
            .into_iter()
            .enumerate()
            .map(|(index, value)| Operation::tokenize(index, value, destination.clone()))
            .collect();
        self.run(operations, cancel).await
    }

    /// Detokenize `tokens`, results in input order
    pub async fn detokenize_tokens<I, S>(
        &self,
        tokens: I,
        destination: &Destination,
        cancel: &CancellationToken,
    ) -> Result<RunReport>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let operations = tokens
            .into_iter()
            .enumerate()
            .map(|(index, token)| Operation::detokenize(index, token, destination.clone()))
            .collect();
        self.run(operations, cancel).await
    }
}

/// Indices must cover `0..len` exactly once
fn validate_indices(operations: &[Operation]) -> Result<()> {
    let mut seen = vec![false; operations.len()];
    for op in operations {
        match seen.get_mut(op.index) {
            Some(slot) if !*slot => *slot = true,
            Some(_) => {
                return Err(VaultError::config(format!(
                    "duplicate operation index {}",
                    op.index
                )))
            }
            None => {
                return Err(VaultError::config(format!(
                    "operation index {} out of range for {} operations",
                    op.index,
                    operations.len()
                )))
            }
        }
    }
    Ok(())
}

/// Send one batch through the retrier and record its items.
///
/// Returns `true` if the batch failed authentication.
async fn dispatch_batch(
    api: &dyn VaultApi,
    retrier: &Retrier,
    collector: &ResultCollector,
    batch: Batch,
    cancel: &CancellationToken,
) -> bool {
    let outcome = retrier.run(cancel, || api.execute(&batch)).await;
    let retried = outcome.attempts > 1;
    collector.record_batch(outcome.attempts, outcome.rate_limited, outcome.result.is_err());

    let records = match outcome.result {
        Ok(records) if records.len() == batch.len() => records,
        Ok(records) => {
            let e = VaultError::malformed(format!(
                "expected {} records, got {}",
                batch.len(),
                records.len()
            ));
            error!("{} batch to {} failed: {}", batch.kind(), batch.destination(), e);
            fail_batch(collector, &batch, &e);
            return false;
        }
        Err(e) => {
            if e.kind() == ErrorKind::Cancelled {
                debug!("{} batch to {} cancelled", batch.kind(), batch.destination());
            } else {
                error!(
                    "{} batch of {} to {} failed after {} attempts: {}",
                    batch.kind(),
                    batch.len(),
                    batch.destination(),
                    outcome.attempts,
                    e
                );
            }
            fail_batch(collector, &batch, &e);
            return e.is_auth_failure();
        }
    };

    for (op, record) in batch.iter().zip(records) {
        let result = match record {
            RecordOutcome::Value(value) => OperationResult::success(op.index, value),
            RecordOutcome::Rejected(message) => {
                OperationResult::failure(op.index, ItemError::rejected(message))
            }
        };
        collector.record(result, retried);
    }
    false
}

fn fail_batch(collector: &ResultCollector, batch: &Batch, error: &VaultError) {
    let item_error = ItemError::from(error);
    for index in batch.indices() {
        collector.record(OperationResult::failure(index, item_error.clone()), false);
    }
}
