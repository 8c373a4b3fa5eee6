// src/logging.rs
//! Tracing subscriber setup.
//!
//! The level comes from `RUST_LOG` when it is set, otherwise from the
//! fallback passed in:
//!
//! ```bash
//! # per-connection failures and worker pinning
//! RUST_LOG=etude_core=debug etude epoll --root ./public
//!
//! # only problems
//! RUST_LOG=warn etude uring --root ./public
//! ```

use crate::error::{EtudeError, EtudeResult};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Human-readable logs to stdout at `info` unless `RUST_LOG` says otherwise.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging() -> EtudeResult<()> {
    init_logging_with_level("info")
}

/// Same as [`init_logging`] with a different fallback level, e.g. `"debug"`.
pub fn init_logging_with_level(level: &str) -> EtudeResult<()> {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| EtudeError::Config(format!("logging already initialised: {}", e)))
}

/// One JSON object per event, for log shippers.
pub fn init_logging_json(level: &str) -> EtudeResult<()> {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().json().with_thread_names(true))
        .try_init()
        .map_err(|e| EtudeError::Config(format!("logging already initialised: {}", e)))
}
