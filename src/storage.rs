//! Storage behind the backend services, and the strategies used to answer a
//! grouped children lookup.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};

use crate::error::{Error, Result};
use crate::wire::{ChildId, ParentId};

/// Queries a backend service can run. Each method is one storage round trip.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// At most `limit` parent ids.
    async fn list_parents(&self, limit: usize) -> Result<Vec<ParentId>>;

    /// At most `limit` children of one parent.
    async fn children_of(&self, parent: ParentId, limit: usize) -> Result<Vec<ChildId>>;

    /// At most `limit` children of each of `parents`, in one set-membership query. Parents
    /// without children may be absent from the result.
    async fn children_of_any(
        &self,
        parents: &[ParentId],
        limit: usize,
    ) -> Result<HashMap<ParentId, Vec<ChildId>>>;
}

/// How a grouped lookup is turned into storage queries. Every strategy
/// returns the same mapping for the same input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStrategy {
    /// One `children_of_any` query for the whole group.
    SetMembership,
    /// One `children_of` query per parent, at most `concurrency` in flight.
    /// Kept for comparison.
    FanOut { concurrency: usize },
}

impl Default for LookupStrategy {
    fn default() -> Self {
        LookupStrategy::SetMembership
    }
}

/// Children of every parent in `parents`, at most `limit` each.
///
/// Every requested parent is present in the result; parents without children
/// map to an empty list.
#[tracing::instrument(skip(store, parents), fields(parents = parents.len()))]
pub async fn grouped_lookup<S: Store + ?Sized>(
    store: &S,
    strategy: LookupStrategy,
    limit: i32,
    parents: &[ParentId],
) -> Result<HashMap<ParentId, Vec<ChildId>>> {
    let limit = checked_limit(limit)?;
    let mut seen = HashSet::with_capacity(parents.len());
    let distinct: Vec<ParentId> = parents.iter().copied().filter(|p| seen.insert(*p)).collect();

    let mut found = match strategy {
        LookupStrategy::SetMembership => store.children_of_any(&distinct, limit).await?,
        LookupStrategy::FanOut { concurrency } => {
            stream::iter(distinct.iter().copied())
                .map(|parent| async move {
                    store.children_of(parent, limit).await.map(|children| (parent, children))
                })
                .buffer_unordered(concurrency.max(1))
                .try_collect::<HashMap<_, _>>()
                .await?
        }
    };

    for parent in distinct {
        found.entry(parent).or_default();
    }
    Ok(found)
}

/// Storage rejects negative limits the way a SQL `LIMIT` does.
pub fn checked_limit(limit: i32) -> Result<usize> {
    usize::try_from(limit)
        .map_err(|_| Error::backend(format!("LIMIT must not be negative, got {}", limit)))
}

/// Whether [`MemoryStore::synthetic`] can number `parents` parents with
/// `children_per_parent` children each without running out of ids.
pub fn synthetic_fits(parents: usize, children_per_parent: usize) -> bool {
    ParentId::try_from(parents).is_ok()
        && parents
            .checked_mul(children_per_parent)
            .map_or(false, |children| ChildId::try_from(children).is_ok())
}

/// In-process store, used by the demo services and by tests.
///
/// Children keep insertion order; a limited read returns the first `limit`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    parents: Vec<ParentId>,
    children: HashMap<ParentId, Vec<ChildId>>,
    round_trips: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `parents` parents numbered from 1, each with `children_per_parent`
    /// children numbered globally from 1. Every third parent has none.
    ///
    /// Ids are clamped to the id range; see [`synthetic_fits`] for a check.
    pub fn synthetic(parents: usize, children_per_parent: usize) -> Self {
        let last_parent = ParentId::try_from(parents).unwrap_or(ParentId::MAX);
        let mut store = Self::new();
        let mut next_child: ChildId = 1;
        for parent in 1..=last_parent {
            store.insert_parent(parent);
            if parent % 3 == 0 {
                continue;
            }
            for _ in 0..children_per_parent {
                store.insert_child(parent, next_child);
                next_child = next_child.saturating_add(1);
            }
        }
        store
    }

    pub fn insert_parent(&mut self, parent: ParentId) {
        self.parents.push(parent);
    }

    pub fn insert_child(&mut self, parent: ParentId, child: ChildId) {
        self.children.entry(parent).or_default().push(child);
    }

    /// Makes every following query fail, or succeed again.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of queries served so far.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    fn begin_query(&self) -> Result<()> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::backend("connection refused"));
        }
        Ok(())
    }

    fn limited(&self, parent: ParentId, limit: usize) -> Option<Vec<ChildId>> {
        self.children.get(&parent).map(|c| c.iter().take(limit).copied().collect())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_parents(&self, limit: usize) -> Result<Vec<ParentId>> {
        self.begin_query()?;
        Ok(self.parents.iter().take(limit).copied().collect())
    }

    async fn children_of(&self, parent: ParentId, limit: usize) -> Result<Vec<ChildId>> {
        self.begin_query()?;
        Ok(self.limited(parent, limit).unwrap_or_default())
    }

    async fn children_of_any(
        &self,
        parents: &[ParentId],
        limit: usize,
    ) -> Result<HashMap<ParentId, Vec<ChildId>>> {
        self.begin_query()?;
        // Like a GROUP BY, parents without rows produce no group.
        Ok(parents
            .iter()
            .filter_map(|parent| self.limited(*parent, limit).map(|c| (*parent, c)))
            .filter(|(_, c)| !c.is_empty())
            .collect())
    }
}
