//! Resolver-side composition: list parents with one call, then fetch each
//! parent's children through the coalescing [`Loader`].

use std::future::Future;
use std::sync::Arc;

use futures::future;

use crate::{
    batch::Key,
    client::Client,
    config::Config,
    error::Result,
    loader::Loader,
    pool::{Dialer, TcpDialer},
    wire::{ChildId, Headers, ParentId},
};

/// A statically typed reference to a parent, handed from the parent resolver
/// to the children resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParentRef {
    pub id: ParentId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Post {
    pub id: ChildId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub id: ParentId,
    pub posts: Vec<Post>,
}

pub struct Gateway<D: Dialer = TcpDialer> {
    threads: Client<D>,
    posts: Loader,
}

impl Gateway<TcpDialer> {
    /// Builds one pool per backend from `config`. Must be called from within a
    /// tokio runtime.
    pub fn from_config(config: &Config) -> Self {
        let threads = Client::connect(config.threads_addr.clone())
            .with_exchange_timeout(config.exchange_timeout);
        let posts = Client::connect(config.posts_addr.clone())
            .with_exchange_timeout(config.exchange_timeout);
        Self::new(threads, Loader::with_shared(Arc::new(posts), config.batch.clone()))
    }
}

impl<D: Dialer> Gateway<D> {
    pub fn new(threads: Client<D>, posts: Loader) -> Self {
        Self { threads, posts }
    }

    pub fn posts_loader(&self) -> &Loader {
        &self.posts
    }

    pub async fn threads(&self, limit: i32, headers: Headers) -> Result<Vec<ParentRef>> {
        let ids = self.threads.list_parents(limit, headers).await?;
        Ok(ids.into_iter().map(|id| ParentRef { id }).collect())
    }

    /// Posts of one thread. Concurrent calls within a batch window share one
    /// backend exchange.
    pub fn posts(
        &self,
        thread: ParentRef,
        limit: i32,
        headers: Headers,
    ) -> impl Future<Output = Result<Vec<Post>>> {
        let load = self.posts.load(Key::new(thread.id, limit), headers);
        async move { Ok(load.await?.into_iter().map(|id| Post { id }).collect()) }
    }

    /// Up to `thread_limit` threads, each with up to `post_limit` posts.
    ///
    /// Issues one parents exchange and, batching permitting, one children
    /// exchange regardless of how many threads come back.
    #[tracing::instrument(skip(self, headers))]
    pub async fn threads_with_posts(
        &self,
        thread_limit: i32,
        post_limit: i32,
        headers: Headers,
    ) -> Result<Vec<Thread>> {
        let threads = self.threads(thread_limit, headers.clone()).await?;
        let loads: Vec<_> =
            threads.iter().map(|t| self.posts(*t, post_limit, headers.clone())).collect();
        // Every key is already enqueued; no need to wait out the window.
        self.posts.flush();

        let posts = future::try_join_all(loads).await?;
        Ok(threads
            .into_iter()
            .zip(posts)
            .map(|(thread, posts)| Thread { id: thread.id, posts })
            .collect())
    }
}
