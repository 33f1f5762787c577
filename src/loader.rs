use std::future::Future;
use std::ops::Drop;
use std::sync::Arc;

use futures::future;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{
    batch::Key,
    batch_function::BatchFunction,
    config::BatchConfig,
    error::{Error, Result},
    loader_op::{LoaderOp, PendingCall},
    loader_worker::LoaderWorker,
    wire::{ChildId, Headers, ParentId},
    worker_stats::WorkerStats,
};

/// Coalesces per-parent child lookups into grouped backend calls, primarily intended for
/// mitigating GraphQL's N+1 problem.
///
/// Every [`Loader::load`] joins the open batch for its key's limit. A batch is dispatched once,
/// through the [`BatchFunction`], when its window elapses or when it reaches capacity, whichever
/// comes first. Results are never cached: a key loaded again after its batch was dispatched is
/// fetched again.
///
/// The `Loader` struct acts as an intermediary between the async domain in which `load` calls are
/// invoked and the pseudo-single-threaded domain of the `LoaderWorker`. Callers can invoke the
/// `Loader` from multiple parallel tasks, and the loader will enqueue the requested operations on
/// the request queue for processing by its `LoaderWorker`.
pub struct Loader {
    request_tx: mpsc::UnboundedSender<LoaderOp>,
    load_task_handle: tokio::task::JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Drop for Loader {
    fn drop(&mut self) {
        let stats = self.stats.lock().clone();
        tracing::info!(?stats, "Loader dropped. Terminating LoaderWorker.");
        self.load_task_handle.abort();
    }
}

impl Loader {
    /// Creates a new Loader dispatching through `batch_fn`. Must be called from within a tokio
    /// runtime.
    pub fn new<F: BatchFunction>(batch_fn: F, config: BatchConfig) -> Self {
        Self::with_shared(Arc::new(batch_fn), config)
    }

    /// Like [`Loader::new`], for a batch function that is also used elsewhere.
    pub fn with_shared<F: BatchFunction>(batch_fn: Arc<F>, config: BatchConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        Self {
            request_tx: tx,
            load_task_handle: tokio::task::spawn(
                LoaderWorker::new(batch_fn, rx, config, stats.clone()).start(),
            ),
            stats,
        }
    }

    /// Loads the children of `key.parent`, at most `key.limit` of them.
    ///
    /// The key is enqueued before this returns; the returned future only waits for the batch to
    /// be resolved. Dropping the future does not remove the key from its batch.
    pub fn load(&self, key: Key, headers: Headers) -> impl Future<Output = Result<Vec<ChildId>>> {
        let (response_tx, response_rx) = oneshot::channel();
        let sent = self
            .request_tx
            .send(LoaderOp::Load(PendingCall::new(key, headers, response_tx)))
            .is_ok();
        async move {
            if !sent {
                return Err(Error::LoaderClosed);
            }
            response_rx.await.unwrap_or(Err(Error::LoaderClosed))
        }
    }

    /// Loads the children of several parents with the same limit.
    ///
    /// All keys are enqueued before this returns, so they land in the same batch unless it fills
    /// up in between.
    pub fn load_many(
        &self,
        parents: &[ParentId],
        limit: i32,
        headers: Headers,
    ) -> impl Future<Output = Vec<Result<Vec<ChildId>>>> {
        let loads: Vec<_> = parents
            .iter()
            .map(|parent| self.load(Key::new(*parent, limit), headers.clone()))
            .collect();
        future::join_all(loads)
    }

    /// Dispatches every open batch without waiting for its window.
    pub fn flush(&self) {
        if self.request_tx.send(LoaderOp::Flush).is_err() {
            tracing::warn!("flush on a terminated loader");
        }
    }

    /// A snapshot of the worker's batching statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().clone()
    }
}
