//! Children (posts) backend: answers grouped `ListChildrenRequest`s.

use std::sync::Arc;

use dataload_wire::server::{self, ChildrenHandler};
use dataload_wire::storage::MemoryStore;
use dataload_wire::{telemetry, Config, Result};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_logging("posts");
    let config = Config::from_env()?;

    let store = Arc::new(MemoryStore::synthetic(config.seed_parents, config.seed_children));
    let handler = Arc::new(ChildrenHandler::new(store, config.lookup_strategy));

    let listener = TcpListener::bind(&config.posts_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, strategy = ?config.lookup_strategy, "posts listening");

    server::serve(listener, handler, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
