//! Tracing setup for binaries and tests embedding the engine.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "convenient_execution=info";

/// Install a global subscriber printing to stderr, filtered by `RUST_LOG`.
///
/// # Errors
///
/// A global subscriber is already installed.
pub fn init_tracing() -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
}
