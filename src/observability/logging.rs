//! Structured logging.
//!
//! `tracing` events everywhere; the subscriber is installed once by the
//! binary. `RUST_LOG` overrides the default filter.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "switchboard=info,tower_http=info";

/// Install the global subscriber.
///
/// # Panics
///
/// If a global subscriber is already installed.
pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
