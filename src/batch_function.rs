use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::wire::{ChildId, Headers, ParentId};

/// A `BatchFunction` defines how a [`Loader`](crate::Loader) fetches the children of a
/// group of parents in one backend round trip. It receives the limit shared by every key of
/// the batch, the distinct parent ids requested during the batch window (in first-requested
/// order), and the correlation headers of the batch.
///
/// The returned map does not have to contain every requested parent. Parents missing from it
/// resolve to an empty list. An `Err` is shared by every caller whose key was in the batch.
///
/// [`Client`](crate::Client) is the production implementation. Tests substitute in-memory
/// fakes.
#[async_trait]
pub trait BatchFunction: Send + Sync + 'static {
    async fn load(
        &self,
        limit: i32,
        parent_ids: &[ParentId],
        headers: &Headers,
    ) -> Result<HashMap<ParentId, Vec<ChildId>>>;
}
