//! Testing utilities
//!
//! [`MockVaultApi`] is an in-memory vault implementing [`VaultApi`], so the
//! engine and the bulk delete controller can be exercised without a network.
//!
//! # Example
//!
//! ```rust,ignore
//! use vaultflow_core::testing::MockVaultApi;
//!
//! let api = MockVaultApi::new()
//!     .with_table("persons", (0..100).map(|i| format!("id{}", i)))
//!     .fail_next(OperationKind::Delete, vec![VaultError::from_status(503, None, "busy")]);
//!
//! let report = controller.drain("persons", &cancel).await?;
//! assert_eq!(api.remaining("persons"), 0);
//! ```
//!
//! Tokens are derived from values (`tok-<value>`), so detokenizing a token
//! produced by the mock yields the original value back.

use crate::batch::Batch;
use crate::client::VaultApi;
use crate::error::{Result, VaultError};
use crate::types::{OperationKind, OperationValue, Payload, RecordOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TOKEN_PREFIX: &str = "tok-";

type LatencyFn = dyn Fn(&Batch) -> Duration + Send + Sync;

/// A mock vault for testing
#[derive(Clone)]
pub struct MockVaultApi {
    tables: Arc<Mutex<HashMap<String, Vec<String>>>>,
    scripted: Arc<Mutex<HashMap<OperationKind, VecDeque<VaultError>>>>,
    always: Arc<Mutex<HashMap<OperationKind, VaultError>>>,
    rejected: Arc<Mutex<HashSet<String>>>,
    latency: Arc<Mutex<Option<Arc<LatencyFn>>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<HashMap<OperationKind, u64>>>,
    total_calls: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MockVaultApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockVaultApi")
            .field("tables", &self.tables.lock().len())
            .field("total_calls", &self.total_calls())
            .finish()
    }
}

impl Default for MockVaultApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVaultApi {
    /// Create an empty mock vault
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(HashMap::new())),
            scripted: Arc::new(Mutex::new(HashMap::new())),
            always: Arc::new(Mutex::new(HashMap::new())),
            rejected: Arc::new(Mutex::new(HashSet::new())),
            latency: Arc::new(Mutex::new(None)),
            deleted: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(HashMap::new())),
            total_calls: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Seed a table with record identifiers
    pub fn with_table<I, S>(self, table: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables
            .lock()
            .insert(table.into(), ids.into_iter().map(Into::into).collect());
        self
    }

    /// Return these errors, in order, for the next calls of `kind`
    pub fn fail_next(self, kind: OperationKind, errors: Vec<VaultError>) -> Self {
        self.scripted.lock().entry(kind).or_default().extend(errors);
        self
    }

    /// Fail every call of `kind` once scripted errors are used up
    pub fn fail_always(self, kind: OperationKind, error: VaultError) -> Self {
        self.always.lock().insert(kind, error);
        self
    }

    /// Reject this value or token per record inside a successful response
    pub fn reject(self, payload: impl Into<String>) -> Self {
        self.rejected.lock().insert(payload.into());
        self
    }

    /// Fixed latency for every call
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = Some(Arc::new(move |_: &Batch| latency));
        self
    }

    /// Latency computed per batch
    pub fn with_latency_fn<F>(self, f: F) -> Self
    where
        F: Fn(&Batch) -> Duration + Send + Sync + 'static,
    {
        *self.latency.lock() = Some(Arc::new(f));
        self
    }

    /// Identifiers still stored in `table`
    pub fn remaining(&self, table: &str) -> usize {
        self.tables.lock().get(table).map_or(0, Vec::len)
    }

    /// Every identifier deleted so far, in deletion order
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    pub fn calls(&self, kind: OperationKind) -> u64 {
        self.calls.lock().get(&kind).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Highest number of calls observed running at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    fn next_failure(&self, kind: OperationKind) -> Option<VaultError> {
        if let Some(error) = self.scripted.lock().get_mut(&kind).and_then(VecDeque::pop_front) {
            return Some(error);
        }
        self.always.lock().get(&kind).cloned()
    }

    fn outcome_for(&self, op_payload: &Payload) -> RecordOutcome {
        let rejected = op_payload
            .as_str()
            .is_some_and(|s| self.rejected.lock().contains(s));
        if rejected {
            return RecordOutcome::rejected("rejected by mock vault");
        }
        match op_payload {
            Payload::Value(value) => RecordOutcome::value(format!("{}{}", TOKEN_PREFIX, value)),
            Payload::Token(token) => match token.strip_prefix(TOKEN_PREFIX) {
                Some(value) => RecordOutcome::value(value),
                None => RecordOutcome::rejected(format!("token {} not found", token)),
            },
            Payload::Identifier(id) => RecordOutcome::value(id.clone()),
            Payload::Page { .. } => RecordOutcome::rejected("page payload in item batch"),
        }
    }

    fn fetch(&self, batch: &Batch) -> Vec<RecordOutcome> {
        let tables = self.tables.lock();
        let ids = tables.get(&batch.destination().table);
        batch
            .iter()
            .map(|op| {
                let page = match (&op.payload, ids) {
                    (Payload::Page { offset, limit }, Some(ids)) => ids
                        .iter()
                        .skip(*offset as usize)
                        .take(*limit as usize)
                        .cloned()
                        .collect(),
                    _ => Vec::new(),
                };
                RecordOutcome::Value(OperationValue::Identifiers(page))
            })
            .collect()
    }

    fn delete(&self, batch: &Batch) -> Vec<RecordOutcome> {
        let outcomes: Vec<_> = batch.iter().map(|op| self.outcome_for(&op.payload)).collect();
        let removed: Vec<&str> = batch
            .iter()
            .zip(&outcomes)
            .filter(|(_, outcome)| matches!(outcome, RecordOutcome::Value(_)))
            .filter_map(|(op, _)| op.payload.as_str())
            .collect();
        let lookup: HashSet<&str> = removed.iter().copied().collect();

        let mut tables = self.tables.lock();
        if let Some(ids) = tables.get_mut(&batch.destination().table) {
            ids.retain(|id| !lookup.contains(id.as_str()));
        }
        self.deleted
            .lock()
            .extend(removed.into_iter().map(str::to_string));
        outcomes
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl VaultApi for MockVaultApi {
    async fn execute(&self, batch: &Batch) -> Result<Vec<RecordOutcome>> {
        let kind = batch.kind();
        *self.calls.lock().entry(kind).or_default() += 1;
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
        let _guard = InFlightGuard(&self.in_flight);

        let latency = self.latency.lock().clone().map(|f| f(batch));
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.next_failure(kind) {
            return Err(error);
        }

        Ok(match kind {
            OperationKind::FetchIds => self.fetch(batch),
            OperationKind::Delete => self.delete(batch),
            OperationKind::Tokenize | OperationKind::Detokenize => {
                batch.iter().map(|op| self.outcome_for(&op.payload)).collect()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Destination, Operation};

    fn batch(ops: Vec<Operation>) -> Batch {
        Batch::new(ops).unwrap()
    }

    #[tokio::test]
    async fn test_tokenize_round_trip_through_mock() {
        let api = MockVaultApi::new();
        let dest = Destination::new("v", "persons", "email");

        let tokens = api
            .execute(&batch(vec![Operation::tokenize(0, "alice", dest.clone())]))
            .await
            .unwrap();
        assert_eq!(tokens, vec![RecordOutcome::value("tok-alice")]);

        let values = api
            .execute(&batch(vec![Operation::detokenize(0, "tok-alice", dest)]))
            .await
            .unwrap();
        assert_eq!(values, vec![RecordOutcome::value("alice")]);
    }

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let api = MockVaultApi::new().fail_next(
            OperationKind::Tokenize,
            vec![VaultError::from_status(503, None, "busy")],
        );
        let b = batch(vec![Operation::tokenize(0, "x", Destination::new("v", "t", "c"))]);
        assert!(api.execute(&b).await.is_err());
        assert!(api.execute(&b).await.is_ok());
        assert_eq!(api.calls(OperationKind::Tokenize), 2);
    }

    #[tokio::test]
    async fn test_fetch_and_delete_shrink_table() {
        let api = MockVaultApi::new().with_table("t", ["a", "b", "c"]);
        let dest = Destination::new("v", "t", "skyflow_id");

        let page = api
            .execute(&batch(vec![Operation::fetch_ids(0, 1, 10, dest.clone())]))
            .await
            .unwrap();
        assert_eq!(
            page,
            vec![RecordOutcome::Value(OperationValue::Identifiers(vec![
                "b".to_string(),
                "c".to_string()
            ]))]
        );

        api.execute(&batch(vec![Operation::delete(0, "a", dest)]))
            .await
            .unwrap();
        assert_eq!(api.remaining("t"), 2);
        assert_eq!(api.deleted(), vec!["a"]);
    }
}
