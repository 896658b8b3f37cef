//! Error types for credential store operations

/// Errors from credential store operations.
///
/// The pool manager treats every variant as "store unavailable" and falls
/// back; the variants exist so logs say what actually went wrong.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store data corrupt: {0}")]
    Corrupt(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("invalid credential: {0}")]
    Invalid(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
