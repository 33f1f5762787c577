use std::collections::HashMap;
use std::sync::Arc;

use futures::future::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{span, Level};
use tracing_futures::Instrument;

use crate::{
    batch::Batch,
    batch_function::BatchFunction,
    config::BatchConfig,
    loader_op::{LoaderOp, PendingCall},
    worker_stats::WorkerStats,
};

/// Why a batch left the open set.
#[derive(Debug, Clone, Copy)]
enum DispatchReason {
    Deadline,
    Full,
    Flush,
}

/// A `LoaderWorker` is the "single-thread" task that owns every open batch.
///
/// Once started, it runs in a loop until the parent Loader aborts its `JoinHandle` or drops the
/// request queue tx channel.
///
/// The worker can be in one of three states during its lifetime:
///
/// 1. Waiting for requests or for the earliest open batch deadline.
/// 2. Flushing the request queue, filing each call into the open batch for its limit.
/// 3. Dispatching batches whose deadline passed or that reached capacity.
///
/// In state (2), a call whose limit has no open batch starts a new one with a deadline of
/// `now + window`. A batch that reaches `max_batch_size` calls is dispatched on the spot.
///
/// In state (3), the batch is removed from the open set before it is handed to a spawned task, so
/// later calls for the same limit start a fresh batch, and the batch can only be dispatched once.
/// The spawned task runs the `BatchFunction` and resolves every call of the batch. Slow or failing
/// batches therefore never hold up other batches or the intake of new calls.
pub struct LoaderWorker<F: BatchFunction> {
    batch_fn: Arc<F>,
    request_rx: mpsc::UnboundedReceiver<LoaderOp>,
    open: HashMap<i32, Batch>,
    config: BatchConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<F: BatchFunction> LoaderWorker<F> {
    pub fn new(
        batch_fn: Arc<F>,
        request_rx: mpsc::UnboundedReceiver<LoaderOp>,
        config: BatchConfig,
        stats: Arc<Mutex<WorkerStats>>,
    ) -> Self {
        Self { batch_fn, request_rx, open: HashMap::new(), config, stats }
    }

    pub async fn start(mut self) {
        let span = span!(Level::TRACE, "LoaderWorker", window = ?self.config.window);
        async move {
            loop {
                let next_deadline = self.open.values().map(Batch::deadline).min();
                tokio::select! {
                    op = self.request_rx.recv() => match op {
                        None => {
                            self.dispatch_all(DispatchReason::Flush);
                            tracing::debug!("Tx channel closed. Terminating LoaderWorker.");
                            return;
                        }
                        Some(op) => self.mux_op(op),
                    },
                    _ = time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                        if next_deadline.is_some() => {}
                }
                // Flush remainder of the op queue before looking at deadlines.
                while let Some(Some(op)) = self.request_rx.recv().now_or_never() {
                    self.mux_op(op);
                }
                self.dispatch_expired();
            }
        }
        .instrument(span)
        .await
    }

    fn mux_op(&mut self, op: LoaderOp) {
        match op {
            LoaderOp::Load(call) => self.enqueue(call),
            LoaderOp::Flush => self.dispatch_all(DispatchReason::Flush),
        }
    }

    fn enqueue(&mut self, call: PendingCall) {
        self.stats.lock().record_load_request();
        let limit = call.key().limit;
        let window = self.config.window;
        let batch = self.open.entry(limit).or_insert_with(|| {
            tracing::trace!(limit, "opening batch");
            Batch::new(limit, Instant::now() + window)
        });

        if batch.push(call).is_err() {
            // Open batches are keyed by limit, so this only happens if that
            // bookkeeping is broken. The offending call was already answered.
            return;
        }
        if batch.len() >= self.config.max_batch_size {
            if let Some(batch) = self.open.remove(&limit) {
                self.dispatch(batch, DispatchReason::Full);
            }
        }
    }

    fn dispatch_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<i32> = self
            .open
            .iter()
            .filter(|(_, batch)| batch.deadline() <= now)
            .map(|(limit, _)| *limit)
            .collect();
        for limit in expired {
            if let Some(batch) = self.open.remove(&limit) {
                self.dispatch(batch, DispatchReason::Deadline);
            }
        }
    }

    fn dispatch_all(&mut self, reason: DispatchReason) {
        let open = std::mem::take(&mut self.open);
        for (_, batch) in open {
            self.dispatch(batch, reason);
        }
    }

    fn dispatch(&mut self, batch: Batch, reason: DispatchReason) {
        if batch.is_empty() {
            return;
        }
        let parent_ids = batch.parent_ids();
        let headers = batch.headers();
        self.stats.lock().record_dispatch(
            batch.len() as u64,
            parent_ids.len() as u64,
            matches!(reason, DispatchReason::Full),
        );

        let span = tracing::debug_span!(
            "dispatch_batch",
            limit = batch.limit(),
            calls = batch.len(),
            parents = parent_ids.len(),
            ?reason,
        );
        let batch_fn = self.batch_fn.clone();
        let stats = self.stats.clone();
        tokio::spawn(
            async move {
                let outcome = batch_fn.load(batch.limit(), &parent_ids, &headers).await;
                match outcome {
                    Ok(ref found) => tracing::debug!(found = found.len(), "batch loaded"),
                    Err(ref e) => {
                        stats.lock().record_failure();
                        tracing::warn!(error = %e, "batch failed");
                    }
                }
                batch.resolve(outcome);
            }
            .instrument(span),
        );
    }
}
