//! Grouping and splitting operations into API-shaped batches
//!
//! Operations are bucketed by [`BatchKey`] (operation kind plus destination)
//! in first-seen order, then each bucket is cut into consecutive slices of at
//! most `max_batch_size`. The transformation is pure and deterministic for a
//! fixed input order.
//!
//! ```rust,ignore
//! let batches = split_into_batches(operations, 25);
//! for batch in &batches {
//!     assert!(batch.len() <= 25);
//! }
//! ```

use crate::types::{Destination, Operation, OperationKind};
use std::collections::HashMap;

/// Key shared by every operation inside one batch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub kind: OperationKind,
    pub destination: Destination,
}

/// An ordered, non-empty group of operations sent as one API call
#[derive(Debug, Clone)]
pub struct Batch {
    key: BatchKey,
    operations: Vec<Operation>,
}

impl Batch {
    /// Build a batch from operations that share one kind and destination.
    ///
    /// Returns `None` if `operations` is empty or mixes keys.
    pub fn new(operations: Vec<Operation>) -> Option<Self> {
        let first = operations.first()?;
        let key = BatchKey {
            kind: first.kind(),
            destination: first.destination.clone(),
        };
        let uniform = operations
            .iter()
            .all(|op| op.kind() == key.kind && op.destination == key.destination);
        uniform.then_some(Self { key, operations })
    }

    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    pub fn kind(&self) -> OperationKind {
        self.key.kind
    }

    pub fn destination(&self) -> &Destination {
        &self.key.destination
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Source indices covered by this batch, in batch order
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.operations.iter().map(|op| op.index)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.operations.iter()
    }
}

/// Largest batch the API accepts for a kind, given the configured size.
///
/// Page fetches are one request per page, so they never share a batch.
fn effective_batch_size(kind: OperationKind, max_batch_size: usize) -> usize {
    match kind {
        OperationKind::FetchIds => 1,
        _ => max_batch_size.max(1),
    }
}

/// Group operations by kind and destination, then split each group into
/// batches of at most `max_batch_size`.
pub fn split_into_batches(operations: Vec<Operation>, max_batch_size: usize) -> Vec<Batch> {
    let mut buckets: Vec<(BatchKey, Vec<Operation>)> = Vec::new();
    let mut positions: HashMap<BatchKey, usize> = HashMap::new();

    for op in operations {
        let key = BatchKey {
            kind: op.kind(),
            destination: op.destination.clone(),
        };
        let slot = *positions.entry(key.clone()).or_insert_with(|| {
            buckets.push((key, Vec::new()));
            buckets.len() - 1
        });
        buckets[slot].1.push(op);
    }

    let mut batches = Vec::new();
    for (key, ops) in buckets {
        let size = effective_batch_size(key.kind, max_batch_size);
        let mut ops = ops.into_iter().peekable();
        while ops.peek().is_some() {
            let chunk: Vec<Operation> = ops.by_ref().take(size).collect();
            batches.push(Batch {
                key: key.clone(),
                operations: chunk,
            });
        }
    }
    batches
}

/// Turn identifiers into delete operations, indexed from zero, and split them.
pub fn delete_batches(ids: Vec<String>, destination: &Destination, batch_size: usize) -> Vec<Batch> {
    let operations = ids
        .into_iter()
        .enumerate()
        .map(|(index, id)| Operation::delete(index, id, destination.clone()))
        .collect();
    split_into_batches(operations, batch_size)
}
