//! Logging setup for the binaries.

use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Installs a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Calling it again, or after another subscriber was installed, is a no-op.
pub fn init_logging(service: &'static str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::NONE)
        .with_target(false)
        .try_init()
        .is_ok();
    if installed {
        tracing::info!(service, "logging initialized");
    }
}
