//! Common types shared by the key pool crates and the broker service

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, redact};
