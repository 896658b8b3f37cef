//! Credential store for the search API key pool
//!
//! Persists one row per API key: the key itself (primary key), how many times
//! it has been handed out since the last reset, and the date of that reset.
//! The `KeyStore` trait is the seam between the pool manager and the backing
//! storage; `FileStore` keeps the table in a JSON file, `SqliteStore` in a
//! SQLite database shared by every process that opens it, and `MemoryStore` in
//! process memory.
//!
//! Every mutating operation runs inside a single store-level critical
//! section, so select-and-increment and bulk resets never interleave. For the
//! file and SQLite backends that section spans processes.

pub mod error;
pub mod file;
pub mod memory;
pub mod record;
pub mod sqlite;

pub use error::{Result, StoreError};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use record::{CredentialRecord, Usage, UsageTable};
pub use sqlite::SqliteStore;

use std::future::Future;
use std::pin::Pin;

use chrono::NaiveDate;

/// Boxed future returned by `KeyStore` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Predicate deciding whether a reset is due, given the last reset date.
pub type ResetDue<'a> = &'a (dyn Fn(Option<NaiveDate>) -> bool + Send + Sync);

/// Result of `KeyStore::reset_all_if`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalReset {
    /// Counters were zeroed; holds the number of records reset.
    Reset(u64),
    /// Nothing changed: the table is empty or the predicate declined. Holds
    /// the last reset date as seen inside the critical section.
    Skipped(Option<NaiveDate>),
}

/// Storage backend for credential usage records.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn KeyStore>`).
pub trait KeyStore: Send + Sync {
    /// Backend name for logging and health reporting (e.g. "file", "memory")
    fn backend(&self) -> &'static str;

    /// Create the backing structure if it does not exist yet. Idempotent.
    fn ensure_schema(&self) -> StoreFuture<'_, ()>;

    /// Record with the smallest usage count, ties broken by identifier.
    fn select_least_used(&self) -> StoreFuture<'_, Option<CredentialRecord>>;

    /// Add one use to the named record.
    fn increment_usage<'a>(&'a self, identifier: &'a str) -> StoreFuture<'a, ()>;

    /// Select the least-used record and increment it atomically.
    ///
    /// Returns the record after the increment, or `None` when the store is
    /// empty.
    fn acquire_least_used(&self) -> StoreFuture<'_, Option<CredentialRecord>>;

    /// Date of the most recent reset, or `None` if the table was never reset.
    fn last_reset_date(&self) -> StoreFuture<'_, Option<NaiveDate>>;

    /// Zero every counter and stamp every record with `date`.
    ///
    /// Returns the number of records reset.
    fn reset_all(&self, date: NaiveDate) -> StoreFuture<'_, u64>;

    /// Read the last reset date and, if `due` accepts it and the table is
    /// not empty, `reset_all(date)`, all in one critical section.
    ///
    /// Two callers racing on the same store therefore reset at most once.
    fn reset_all_if<'a>(
        &'a self,
        date: NaiveDate,
        due: ResetDue<'a>,
    ) -> StoreFuture<'a, ConditionalReset>;

    /// Provision a new credential. Returns `false` if it already exists.
    fn insert<'a>(&'a self, identifier: &'a str) -> StoreFuture<'a, bool>;

    /// Snapshot of every record in identifier order.
    fn records(&self) -> StoreFuture<'_, Vec<CredentialRecord>>;
}
