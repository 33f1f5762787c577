use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    batch_function::BatchFunction,
    error::Result,
    pool::{Dialer, Pool, TcpDialer},
    wire::{Call, ChildId, Headers, ListChildrenRequest, ListParentsRequest, ParentId},
};

/// Issues calls to one backend service over pooled connections.
///
/// Each call checks a connection out of the pool, runs exactly one exchange on
/// it and checks it back in. A connection that failed its exchange is tainted
/// and the pool drops it instead of idling it. Calls are never retried.
pub struct Client<D: Dialer = TcpDialer> {
    pool: Arc<Pool<D>>,
    exchange_timeout: Option<Duration>,
}

impl<D: Dialer> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self { pool: self.pool.clone(), exchange_timeout: self.exchange_timeout }
    }
}

impl Client<TcpDialer> {
    /// A client with its own pool of TCP connections to `addr`.
    pub fn connect(addr: impl Into<String>) -> Self {
        Self::new(Arc::new(Pool::new(TcpDialer::new(addr))))
    }
}

impl<D: Dialer> Client<D> {
    pub fn new(pool: Arc<Pool<D>>) -> Self {
        Self { pool, exchange_timeout: None }
    }

    /// Bounds every exchange by `timeout`. `None` waits indefinitely.
    pub fn with_exchange_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &Arc<Pool<D>> {
        &self.pool
    }

    /// One request/response exchange on a pooled connection.
    pub async fn call<C: Call>(&self, request: &C) -> Result<C::Response> {
        let mut conn = self.pool.acquire().await?;
        let result = match self.exchange_timeout {
            Some(timeout) => conn.exchange_timeout(request, timeout).await,
            None => conn.exchange(request).await,
        };
        self.pool.release(conn);
        result
    }

    /// Up to `limit` parent ids.
    pub async fn list_parents(&self, limit: i32, headers: Headers) -> Result<Vec<ParentId>> {
        let response = self.call(&ListParentsRequest { limit, headers }).await?;
        Ok(response.ids)
    }

    /// Up to `limit` children for each of `parent_ids`, in one exchange.
    pub async fn list_children(
        &self,
        limit: i32,
        parent_ids: Vec<ParentId>,
        headers: Headers,
    ) -> Result<HashMap<ParentId, Vec<ChildId>>> {
        let response = self.call(&ListChildrenRequest { limit, parent_ids, headers }).await?;
        Ok(response.children_by_parent)
    }
}

#[async_trait]
impl<D: Dialer> BatchFunction for Client<D> {
    async fn load(
        &self,
        limit: i32,
        parent_ids: &[ParentId],
        headers: &Headers,
    ) -> Result<HashMap<ParentId, Vec<ChildId>>> {
        self.list_children(limit, parent_ids.to_vec(), headers.clone()).await
    }
}
