//! Subscriber setup for binaries built on this crate.
//!
//! The library only emits `tracing` events; nothing is printed unless the
//! application installs a subscriber, usually through [`init`].

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CRATE_TARGET: &str = "sandbox_session";

/// Installs a global `fmt` subscriber.
///
/// `RUST_LOG` wins when set; otherwise this crate logs at `debug` when
/// `verbose` and `info` when not. Returns false if a global subscriber was
/// already installed.
pub fn init(verbose: bool) -> bool {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter(verbose))
        .try_init()
        .is_ok()
}

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

fn default_directive(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("{CRATE_TARGET}={level}")
}
