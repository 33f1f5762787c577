//! Backend side: an accept loop that runs one request loop per connection.
//!
//! A connection carries one request at a time. Each request envelope is
//! decoded, answered by a [`Handler`] and the response flushed before the next
//! request is read. Concurrency comes from running one such loop per accepted
//! connection.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::TcpListener;
use tracing::field;
use tracing_futures::Instrument;

use crate::error::Result;
use crate::storage::{self, LookupStrategy, Store};
use crate::wire::{
    self, Call, ListChildrenRequest, ListChildrenResponse, ListParentsRequest, ListParentsResponse,
};

/// Answers one kind of request envelope.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type Request: Call;

    async fn handle(
        &self,
        request: Self::Request,
    ) -> Result<<Self::Request as Call>::Response>;
}

/// Answers `ListChildrenRequest`s with one grouped lookup each.
pub struct ChildrenHandler<S: ?Sized> {
    store: Arc<S>,
    strategy: LookupStrategy,
}

impl<S: Store + ?Sized> ChildrenHandler<S> {
    pub fn new(store: Arc<S>, strategy: LookupStrategy) -> Self {
        Self { store, strategy }
    }
}

#[async_trait]
impl<S: Store + ?Sized> Handler for ChildrenHandler<S> {
    type Request = ListChildrenRequest;

    async fn handle(&self, request: ListChildrenRequest) -> Result<ListChildrenResponse> {
        let children_by_parent = storage::grouped_lookup(
            &*self.store,
            self.strategy,
            request.limit,
            &request.parent_ids,
        )
        .await?;
        Ok(ListChildrenResponse { children_by_parent })
    }
}

/// Answers `ListParentsRequest`s.
pub struct ParentsHandler<S: ?Sized> {
    store: Arc<S>,
}

impl<S: Store + ?Sized> ParentsHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: Store + ?Sized> Handler for ParentsHandler<S> {
    type Request = ListParentsRequest;

    async fn handle(&self, request: ListParentsRequest) -> Result<ListParentsResponse> {
        let limit = storage::checked_limit(request.limit)?;
        let ids = self.store.list_parents(limit).await?;
        Ok(ListParentsResponse { ids })
    }
}

/// Serves requests on one connection until the peer closes it.
///
/// Returns `Ok(())` on a clean end of stream. A decode failure or a failed
/// lookup ends the loop with that error and no response is written; the
/// connection is closed when the stream is dropped.
pub async fn process_connection<T, H>(stream: T, handler: &H) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    H: Handler + ?Sized,
{
    let mut stream = BufStream::new(stream);
    loop {
        let request: H::Request = match wire::read_frame(&mut stream).await? {
            Some(request) => request,
            None => {
                tracing::info!("closing connection");
                return Ok(());
            }
        };

        // Correlation headers are recorded, never interpreted.
        let span = tracing::info_span!(
            "process_request",
            call = <H::Request as Call>::NAME,
            headers = field::debug(request.headers()),
        );
        let response = handler.handle(request).instrument(span).await?;
        wire::write_frame(&mut stream, &response).await?;
    }
}

/// Accepts connections until `shutdown` completes, running
/// [`process_connection`] for each on its own task.
pub async fn serve<H, F>(listener: TcpListener, handler: Arc<H>, shutdown: F) -> Result<()>
where
    H: Handler,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = &mut shutdown => {
                tracing::info!("shutting down listener");
                return Ok(());
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "set_nodelay failed");
        }
        tracing::info!(%peer, "received connection");

        let handler = handler.clone();
        tokio::spawn(
            async move {
                if let Err(e) = process_connection(stream, &*handler).await {
                    tracing::warn!(error = %e, "connection aborted");
                }
            }
            .instrument(tracing::info_span!("connection", %peer)),
        );
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::error::Error;
    use crate::storage::MemoryStore;
    use crate::wire::Headers;

    fn handler() -> ChildrenHandler<MemoryStore> {
        let mut store = MemoryStore::new();
        store.insert_child(1, 10);
        store.insert_child(1, 11);
        ChildrenHandler::new(Arc::new(store), LookupStrategy::SetMembership)
    }

    #[tokio::test]
    async fn clean_close_ends_the_loop() {
        let (mut client, server) = tokio::io::duplex(1024);
        let handler = handler();
        let serving = tokio::spawn(async move { process_connection(server, &handler).await });

        let request =
            ListChildrenRequest { limit: 1, parent_ids: vec![1, 2], headers: Headers::new() };
        wire::write_frame(&mut client, &request).await.unwrap();
        let response: ListChildrenResponse = wire::read_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(response.children_by_parent[&1], vec![10]);
        assert_eq!(response.children_by_parent[&2], Vec::<i32>::new());

        drop(client);
        assert!(serving.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn undecodable_request_aborts_the_loop() {
        let (mut client, server) = tokio::io::duplex(1024);
        let handler = handler();
        let serving = tokio::spawn(async move { process_connection(server, &handler).await });

        client.write_all(&[0, 0, 0, 1, 0xff]).await.unwrap();
        let err = serving.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Decode(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn failed_lookup_aborts_without_response() {
        let (mut client, server) = tokio::io::duplex(1024);
        let handler = handler();
        handler.store.set_unavailable(true);
        let serving = tokio::spawn(async move { process_connection(server, &handler).await });

        let request =
            ListChildrenRequest { limit: 1, parent_ids: vec![1], headers: Headers::new() };
        wire::write_frame(&mut client, &request).await.unwrap();

        assert!(matches!(serving.await.unwrap(), Err(Error::Backend { .. })));
        let next = wire::read_frame::<_, ListChildrenResponse>(&mut client).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn parents_handler_lists_up_to_limit() {
        let handler = ParentsHandler::new(Arc::new(MemoryStore::synthetic(5, 0)));
        let response =
            handler.handle(ListParentsRequest { limit: 2, headers: Headers::new() }).await.unwrap();
        assert_eq!(response.ids, vec![1, 2]);
        let negative = handler.handle(ListParentsRequest { limit: -1, headers: Headers::new() });
        assert!(negative.await.is_err());
    }
}
