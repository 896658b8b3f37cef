//! Error types for pool operations
//!
//! `PoolManager::acquire` never returns these; they surface from the
//! scheduler check and administrative calls, where the caller decides how to
//! report them.

use key_store::StoreError;

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid reset check configuration: {0}")]
    InvalidResetCheck(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
