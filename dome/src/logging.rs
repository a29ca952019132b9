//! Tracing setup for hosts that embed the dome core

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install a console subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to `default_filter`.
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Dome logging initialized");
    }
    installed
}
