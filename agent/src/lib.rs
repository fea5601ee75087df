//! Shared pieces of the modem agent binaries.

pub mod clock;
pub mod config;
pub mod net;
pub mod store;

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the tracing subscriber shared by all three binaries.
pub fn init_telemetry() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
