use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::connection::Connection;
use crate::error::{Error, Result};

/// Establishes new transports for a [`Pool`].
///
/// The pool only talks to this trait, so tests can hand it in-memory streams.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self) -> Result<Self::Stream>;

    /// Backend address, for logging.
    fn addr(&self) -> &str;
}

/// Dials a TCP backend.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self) -> Result<TcpStream> {
        let dial_err = |e| Error::Dial { addr: self.addr.clone(), source: Arc::new(e) };
        let stream = TcpStream::connect(&self.addr).await.map_err(dial_err)?;
        stream.set_nodelay(true).map_err(dial_err)?;
        Ok(stream)
    }

    fn addr(&self) -> &str {
        &self.addr
    }
}

/// Idle connections to one backend address.
///
/// The pool grows lazily: [`Pool::acquire`] hands out an idle connection when
/// there is one and dials a new one otherwise, never waiting for capacity.
/// Connections are not pre-warmed, health-checked or closed for idling.
///
/// Construct one per backend at startup and share it behind an `Arc`.
pub struct Pool<D: Dialer> {
    dialer: D,
    idle: Mutex<Vec<Connection<D::Stream>>>,
    next_id: AtomicU64,
    discarded: AtomicU64,
}

impl<D: Dialer> Pool<D> {
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            idle: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        self.dialer.addr()
    }

    /// Checks out a connection for exclusive use.
    ///
    /// A dial failure is returned to this caller only.
    pub async fn acquire(&self) -> Result<Connection<D::Stream>> {
        // Pop under the lock, dial outside of it.
        let idle = self.idle.lock().pop();
        if let Some(conn) = idle {
            tracing::trace!(conn = conn.id(), "reusing idle connection");
            return Ok(conn);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stream = self.dialer.dial().await?;
        tracing::info!(conn = id, addr = self.dialer.addr(), "new backend connection");
        Ok(Connection::new(id, stream))
    }

    /// Returns a connection to the idle set.
    ///
    /// Tainted connections are dropped instead, closing their transport.
    pub fn release(&self, conn: Connection<D::Stream>) {
        if conn.is_tainted() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(conn = conn.id(), "discarding tainted connection");
            return;
        }
        self.idle.lock().push(conn);
    }

    /// Closes every idle connection. Checked-out connections are unaffected.
    pub fn close_idle(&self) -> usize {
        let drained = std::mem::take(&mut *self.idle.lock());
        tracing::info!(
            addr = self.dialer.addr(),
            closed = drained.len(),
            "closing idle connections"
        );
        drained.len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of dial attempts, successful or not.
    pub fn dialed(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Number of tainted connections dropped on release.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}
