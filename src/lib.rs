//! Coalesces per-parent child lookups into grouped RPCs against a backend
//! service, over a pool of long-lived connections.
//!
//! Client side: [`Loader`] batches concurrent [`Loader::load`] calls per limit
//! and dispatches each batch through a [`BatchFunction`], normally a
//! [`Client`], which runs one exchange on a connection borrowed from a
//! [`Pool`]. Backend side: [`server::serve`] runs one request loop per
//! connection, answering each grouped request with a single storage lookup.

mod batch;
mod batch_function;
mod client;
mod connection;
mod error;
mod loader;
mod loader_op;
mod loader_worker;
mod pool;
mod worker_stats;

pub mod config;
pub mod gateway;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod wire;

pub use batch::{Batch, Key};
pub use batch_function::BatchFunction;
pub use client::Client;
pub use config::{BatchConfig, Config};
pub use connection::Connection;
pub use error::{Error, Result};
pub use loader::Loader;
pub use loader_op::PendingCall;
pub use pool::{Dialer, Pool, TcpDialer};
pub use worker_stats::WorkerStats;
