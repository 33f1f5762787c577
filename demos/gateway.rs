// Resolves threads with their posts against running `threads` and `posts`
// backends, showing that the posts of every thread arrive in one exchange.
//
//     cargo run --bin threads & cargo run --bin posts &
//     cargo run --example gateway

use dataload_wire::gateway::Gateway;
use dataload_wire::wire::Headers;
use dataload_wire::{telemetry, Config, Result};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_logging("gateway");
    let config = Config::from_env()?;
    let gateway = Gateway::from_config(&config);

    let mut headers = Headers::new();
    headers.insert(
        "traceparent".to_owned(),
        "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_owned(),
    );

    for _ in 0..3 {
        let threads = gateway.threads_with_posts(10, 5, headers.clone()).await?;
        for thread in &threads {
            let posts: Vec<_> = thread.posts.iter().map(|p| p.id).collect();
            tracing::info!(thread = thread.id, ?posts);
        }
    }

    let stats = gateway.posts_loader().stats();
    tracing::info!(loads = stats.load_requests, batches = stats.batches, "posts loader");
    Ok(())
}
