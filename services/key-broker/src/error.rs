//! Service-specific error types

use std::net::SocketAddr;

use thiserror::Error;

/// Broker lifecycle errors.
///
/// Per-request outcomes (no credential available, store errors on admin
/// calls) are turned into HTTP responses by the handlers and never
/// propagate as Rust errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to bind {listener} listener on {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("{listener} server failed: {source}")]
    Serve {
        listener: &'static str,
        source: std::io::Error,
    },
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
