//! Error types shared by the client, coalescer and backend executor.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure this layer can surface.
///
/// Errors are `Clone` because a single failed grouped lookup resolves every
/// caller folded into that batch with the same value. Sources that are not
/// `Clone` themselves are held behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A new connection to the backend could not be established.
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// An envelope could not be serialized.
    #[error("encode: {0}")]
    Encode(#[source] Arc<bincode::Error>),

    /// An envelope was malformed or truncated.
    #[error("decode: {0}")]
    Decode(#[source] Arc<bincode::Error>),

    /// The transport failed while reading or writing a frame.
    #[error("transport: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The peer closed the connection before a full response arrived.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// No response arrived within the configured exchange deadline.
    #[error("exchange timed out after {0:?}")]
    Timeout(Duration),

    /// A key was offered to a batch with a different limit.
    #[error("batch limit is {batch_limit} but key has limit {key_limit}")]
    InvariantViolation { batch_limit: i32, key_limit: i32 },

    /// The grouped storage lookup failed.
    #[error("backend query: {message}")]
    Backend { message: String },

    /// A configuration value could not be parsed.
    #[error("invalid config {name}={value:?}: {message}")]
    Config { name: &'static str, value: String, message: String },

    /// The loader worker went away before the request was resolved.
    #[error("loader worker terminated")]
    LoaderClosed,
}

impl Error {
    pub fn backend(message: impl Into<String>) -> Self {
        Error::Backend { message: message.into() }
    }

    /// Whether the error leaves the connection it happened on unusable.
    ///
    /// Everything that happens mid-exchange does; the stream position is
    /// unknown afterwards.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Error::Encode(_)
                | Error::Decode(_)
                | Error::Io(_)
                | Error::ConnectionClosed
                | Error::Timeout(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::ConnectionClosed
        } else {
            Error::Io(Arc::new(e))
        }
    }
}
