//! Parents (threads) backend: answers `ListParentsRequest`s.

use std::sync::Arc;

use dataload_wire::server::{self, ParentsHandler};
use dataload_wire::storage::MemoryStore;
use dataload_wire::{telemetry, Config, Result};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_logging("threads");
    let config = Config::from_env()?;

    let store = Arc::new(MemoryStore::synthetic(config.seed_parents, config.seed_children));
    let handler = Arc::new(ParentsHandler::new(store));

    let listener = TcpListener::bind(&config.threads_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "threads listening");

    server::serve(listener, handler, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
