use tokio::sync::oneshot;

use crate::batch::Key;
use crate::error::Result;
use crate::wire::{ChildId, Headers};

/// Set of requests that can be sent to the [`LoaderWorker`](crate::loader_worker::LoaderWorker).
#[derive(Debug)]
pub enum LoaderOp {
    /// Add a key to the open batch for its limit.
    Load(PendingCall),
    /// Dispatch every open batch now instead of waiting for its window.
    Flush,
}

/// One caller's key plus the channel its result is delivered on.
#[derive(Debug)]
pub struct PendingCall {
    key: Key,
    headers: Headers,
    response_tx: oneshot::Sender<Result<Vec<ChildId>>>,
}

impl PendingCall {
    pub fn new(
        key: Key,
        headers: Headers,
        response_tx: oneshot::Sender<Result<Vec<ChildId>>>,
    ) -> Self {
        Self { key, headers, response_tx }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Hands the result to the caller. A caller that stopped waiting is not an error.
    pub fn send_response(self, response: Result<Vec<ChildId>>) {
        if self.response_tx.send(response).is_err() {
            tracing::debug!(key = ?self.key, "receiver dropped");
        }
    }
}
