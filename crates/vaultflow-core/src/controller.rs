//! Two-phase bulk delete
//!
//! Drains a table by repeating fetch-then-delete until nothing is left:
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!   fetch pages 0..fetch_workers ──▶ ids empty? ──no──▶ delete batches
//!   (fetch engine, retried)           │ yes               (delete engine, retried)
//!            │ 401                     ▼
//!            ▼                   ExhaustedSuccess / ExhaustedWithFailures
//!   AbortedAuthFailure
//! ```
//!
//! Deleted records no longer occupy the front of the table, so every
//! iteration fetches from the start again, skipped past the identifiers that
//! already failed to delete. Those stay in the table ahead of everything not
//! yet attempted; each one is attempted and counted once. A 404 on fetch
//! means the table is empty. The loop ends once a fetch yields nothing new.

use crate::client::VaultApi;
use crate::config::{AppConfig, BulkDeleteConfig};
use crate::engine::{BatchEngine, EngineOptions};
use crate::error::{ErrorKind, Result};
use crate::pool::PoolConfig;
use crate::retry::{Retrier, RetryConfig};
use crate::types::{Destination, Operation, OperationValue};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Terminal state of one drained resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainState {
    /// Still looping; never returned from [`BulkDeleteController::drain`]
    Iterating,
    ExhaustedSuccess,
    ExhaustedWithFailures,
    AbortedAuthFailure,
    Cancelled,
}

impl DrainState {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::ExhaustedSuccess)
    }
}

impl fmt::Display for DrainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Iterating => "iterating",
            Self::ExhaustedSuccess => "exhausted_success",
            Self::ExhaustedWithFailures => "exhausted_with_failures",
            Self::AbortedAuthFailure => "aborted_auth_failure",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Accounting for one drained resource
#[derive(Debug, Clone, Serialize)]
pub struct ResourceReport {
    pub resource: String,
    pub state: DrainState,
    pub deleted: u64,
    pub failed_items: u64,
    pub failed_batches: u64,
    pub fetch_failures: u64,
    pub iterations: u64,
    /// Stopped because `max_records_per_resource` was reached
    pub ceiling_reached: bool,
    pub elapsed_ms: u64,
}

impl ResourceReport {
    fn new(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            state: DrainState::Iterating,
            deleted: 0,
            failed_items: 0,
            failed_batches: 0,
            fetch_failures: 0,
            iterations: 0,
            ceiling_reached: false,
            elapsed_ms: 0,
        }
    }

    fn has_failures(&self) -> bool {
        self.failed_batches > 0 || self.failed_items > 0 || self.fetch_failures > 0
    }

    fn exhausted(&self) -> DrainState {
        if self.has_failures() {
            DrainState::ExhaustedWithFailures
        } else {
            DrainState::ExhaustedSuccess
        }
    }
}

/// Bulk delete settings
#[derive(Debug, Clone)]
pub struct BulkDeleteOptions {
    pub vault_id: String,
    /// Column holding the record identifier
    pub id_column: String,
    pub fetch_limit: u64,
    pub fetch_workers: usize,
    pub delete_batch_size: usize,
    pub delete_workers: usize,
    pub max_records_per_resource: Option<u64>,
    pub retry: RetryConfig,
}

impl BulkDeleteOptions {
    pub fn new(vault_id: impl Into<String>) -> Self {
        let defaults = BulkDeleteConfig::default();
        Self {
            vault_id: vault_id.into(),
            id_column: defaults.id_column,
            fetch_limit: defaults.fetch_limit,
            fetch_workers: defaults.fetch_workers,
            delete_batch_size: defaults.delete_batch_size,
            delete_workers: defaults.delete_workers,
            max_records_per_resource: defaults.max_records_per_resource,
            retry: RetryConfig::default(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let bulk = &config.bulk_delete;
        Self {
            vault_id: config.vault.vault_id.clone(),
            id_column: bulk.id_column.clone(),
            fetch_limit: bulk.fetch_limit,
            fetch_workers: bulk.fetch_workers,
            delete_batch_size: bulk.delete_batch_size,
            delete_workers: bulk.delete_workers,
            max_records_per_resource: bulk.max_records_per_resource,
            retry: config.engine.retry_config(),
        }
    }

    pub fn with_fetch(mut self, limit: u64, workers: usize) -> Self {
        self.fetch_limit = limit;
        self.fetch_workers = workers;
        self
    }

    pub fn with_delete(mut self, batch_size: usize, workers: usize) -> Self {
        self.delete_batch_size = batch_size;
        self.delete_workers = workers;
        self
    }

    pub fn with_max_records(mut self, max: u64) -> Self {
        self.max_records_per_resource = Some(max);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Fetch-then-delete controller with one engine per phase
pub struct BulkDeleteController {
    fetch: BatchEngine,
    delete: BatchEngine,
    options: BulkDeleteOptions,
}

impl fmt::Debug for BulkDeleteController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkDeleteController")
            .field("options", &self.options)
            .finish()
    }
}

impl BulkDeleteController {
    pub fn new(api: Arc<dyn VaultApi>, options: BulkDeleteOptions) -> Self {
        let fetch = BatchEngine::new(
            Arc::clone(&api),
            EngineOptions::default()
                .with_batch_size(1)
                .with_pool(PoolConfig::new(options.fetch_workers))
                .with_retry(options.retry.clone())
                .with_abort_on_auth(true),
        )
        .with_name("fetch");
        let delete = BatchEngine::new(
            api,
            EngineOptions::default()
                .with_batch_size(options.delete_batch_size)
                .with_pool(PoolConfig::new(options.delete_workers))
                .with_retry(options.retry.clone())
                .with_abort_on_auth(true),
        )
        .with_name("delete");

        Self {
            fetch,
            delete,
            options,
        }
    }

    /// Use seeded jitter in both phases
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.fetch = self
            .fetch
            .with_retrier(Retrier::with_seed(self.options.retry.clone(), seed));
        self.delete = self
            .delete
            .with_retrier(Retrier::with_seed(self.options.retry.clone(), seed.wrapping_add(1)));
        self
    }

    pub fn options(&self) -> &BulkDeleteOptions {
        &self.options
    }

    /// Drain one table until it is empty, the ceiling is reached, a 401 is
    /// seen, or `cancel` fires.
    pub async fn drain(&self, table: &str, cancel: &CancellationToken) -> Result<ResourceReport> {
        let start = Instant::now();
        let destination = Destination::new(&self.options.vault_id, table, &self.options.id_column);
        let mut report = ResourceReport::new(table);
        let mut failed_ids = HashSet::new();

        info!("Draining {}", destination);
        while report.state == DrainState::Iterating {
            if cancel.is_cancelled() {
                report.state = DrainState::Cancelled;
                break;
            }
            if self
                .options
                .max_records_per_resource
                .is_some_and(|max| report.deleted >= max)
            {
                report.ceiling_reached = true;
                report.state = report.exhausted();
                break;
            }
            report.iterations += 1;
            self.iterate(&destination, &mut report, &mut failed_ids, cancel)
                .await?;
        }

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        match report.state {
            DrainState::ExhaustedSuccess => info!(
                "{}: drained, {} deleted in {} iterations",
                table, report.deleted, report.iterations
            ),
            DrainState::AbortedAuthFailure => error!(
                "{}: aborted on authentication failure after {} deletions",
                table, report.deleted
            ),
            state => warn!(
                "{}: finished {} with {} deleted, {} failed batches, {} fetch failures",
                table, state, report.deleted, report.failed_batches, report.fetch_failures
            ),
        }
        Ok(report)
    }

    /// One fetch phase plus one delete phase; sets `report.state` when the
    /// loop must stop.
    ///
    /// `failed_ids` holds identifiers whose delete failed permanently in an
    /// earlier iteration of this resource.
    async fn iterate(
        &self,
        destination: &Destination,
        report: &mut ResourceReport,
        failed_ids: &mut HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let limit = self.options.fetch_limit.max(1);
        let base = failed_ids.len() as u64;
        let pages = (0..self.options.fetch_workers.max(1))
            .map(|page| {
                Operation::fetch_ids(page, base + page as u64 * limit, limit, destination.clone())
            })
            .collect();

        let fetched = self.fetch.run(pages, cancel).await?;
        if fetched.auth_failed {
            report.state = DrainState::AbortedAuthFailure;
            return Ok(());
        }
        if cancel.is_cancelled() {
            report.state = DrainState::Cancelled;
            return Ok(());
        }

        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for result in &fetched.results {
            match &result.outcome {
                Ok(OperationValue::Identifiers(page)) => ids.extend(
                    page.iter()
                        .filter(|id| !failed_ids.contains(id.as_str()))
                        .filter(|id| seen.insert(id.as_str()))
                        .cloned(),
                ),
                Ok(OperationValue::Single(_)) => {}
                Err(e) => {
                    warn!("{}: fetch of page {} failed: {}", destination.table, result.index, e);
                    report.fetch_failures += 1;
                }
            }
        }

        if ids.is_empty() {
            debug!(
                "{}: nothing new to fetch ({} known failures)",
                destination.table,
                failed_ids.len()
            );
            report.state = report.exhausted();
            return Ok(());
        }

        let mut last_iteration = false;
        if let Some(max) = self.options.max_records_per_resource {
            let allowance = max.saturating_sub(report.deleted);
            if ids.len() as u64 >= allowance {
                ids.truncate(allowance as usize);
                last_iteration = true;
            }
        }

        let attempted = ids.len();
        let operations = ids
            .iter()
            .enumerate()
            .map(|(index, id)| Operation::delete(index, id.clone(), destination.clone()))
            .collect();
        let deleted = self.delete.run(operations, cancel).await?;

        for result in &deleted.results {
            let permanent = result
                .error()
                .is_some_and(|e| e.kind != ErrorKind::Cancelled);
            if let (true, Some(id)) = (permanent, ids.get(result.index)) {
                failed_ids.insert(id.clone());
            }
        }

        report.deleted += deleted.stats.succeeded;
        report.failed_items += deleted.stats.failed;
        report.failed_batches += deleted.stats.failed_batches;
        debug!(
            "{}: iteration {} deleted {}/{}",
            destination.table, report.iterations, deleted.stats.succeeded, attempted
        );

        if deleted.auth_failed {
            report.state = DrainState::AbortedAuthFailure;
        } else if cancel.is_cancelled() {
            report.state = DrainState::Cancelled;
        } else if last_iteration {
            report.ceiling_reached = true;
            report.state = report.exhausted();
        }
        Ok(())
    }

    /// Drain tables one after another.
    ///
    /// Stops early on cancellation or an authentication failure, since the
    /// same token is used for every table.
    pub async fn drain_all<S: AsRef<str>>(
        &self,
        tables: &[S],
        cancel: &CancellationToken,
    ) -> Result<Vec<ResourceReport>> {
        let mut reports = Vec::with_capacity(tables.len());
        for (i, table) in tables.iter().enumerate() {
            let report = self.drain(table.as_ref(), cancel).await?;
            let stop = matches!(
                report.state,
                DrainState::AbortedAuthFailure | DrainState::Cancelled
            );
            reports.push(report);
            if stop {
                let skipped = tables.len() - i - 1;
                if skipped > 0 {
                    warn!("Skipping {} remaining tables", skipped);
                }
                break;
            }
        }
        Ok(reports)
    }
}
