use std::collections::{HashMap, HashSet};

use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::loader_op::PendingCall;
use crate::wire::{ChildId, Headers, ParentId};

/// A parent identifier paired with the maximum number of children wanted for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub parent: ParentId,
    pub limit: i32,
}

impl Key {
    pub fn new(parent: ParentId, limit: i32) -> Self {
        Self { parent, limit }
    }

    /// Keys may share a batch only when their limits are equal.
    pub fn is_batch_compatible(&self, other: &Key) -> bool {
        self.limit == other.limit
    }
}

/// Calls accumulated for one limit value until the batch is dispatched.
///
/// A batch is consumed by [`Batch::resolve`], so it can only ever be
/// dispatched once.
#[derive(Debug)]
pub struct Batch {
    limit: i32,
    deadline: Instant,
    pending: Vec<PendingCall>,
}

impl Batch {
    pub fn new(limit: i32, deadline: Instant) -> Self {
        Self { limit, deadline, pending: Vec::new() }
    }

    pub fn limit(&self) -> i32 {
        self.limit
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Adds a call to the batch.
    ///
    /// A call whose limit differs from the batch's is refused: it is resolved
    /// with [`Error::InvariantViolation`] right away and the same error is
    /// returned. The batch itself is left untouched.
    pub fn push(&mut self, call: PendingCall) -> Result<()> {
        let key_limit = call.key().limit;
        if key_limit != self.limit {
            let err = Error::InvariantViolation { batch_limit: self.limit, key_limit };
            tracing::error!(
                key = ?call.key(),
                batch_limit = self.limit,
                "incompatible key offered to batch"
            );
            call.send_response(Err(err.clone()));
            return Err(err);
        }
        self.pending.push(call);
        Ok(())
    }

    /// Distinct parent ids, in the order they were first requested.
    pub fn parent_ids(&self) -> Vec<ParentId> {
        let mut seen = HashSet::with_capacity(self.pending.len());
        self.pending
            .iter()
            .map(|call| call.key().parent)
            .filter(|parent| seen.insert(*parent))
            .collect()
    }

    /// Headers forwarded with the grouped request: those of the first call.
    pub fn headers(&self) -> Headers {
        self.pending.first().map(|call| call.headers().clone()).unwrap_or_default()
    }

    /// Resolves every call in the batch from the outcome of its grouped lookup.
    ///
    /// Parents absent from a successful outcome get an empty list. A failed
    /// outcome is handed to every call.
    pub fn resolve(self, outcome: Result<HashMap<ParentId, Vec<ChildId>>>) {
        match outcome {
            Ok(children_by_parent) => {
                for call in self.pending {
                    let children =
                        children_by_parent.get(&call.key().parent).cloned().unwrap_or_default();
                    call.send_response(Ok(children));
                }
            }
            Err(err) => {
                for call in self.pending {
                    call.send_response(Err(err.clone()));
                }
            }
        }
    }
}
