//! Least-used key pool for a rate-limited search API
//!
//! Many callers share a finite set of API keys. Each acquire hands out the
//! key with the fewest recorded uses and charges it one use; counters are
//! zeroed on the first day of each month. When the pool cannot produce a key
//! a statically configured fallback key is used instead.
//!
//! Lifecycle:
//! 1. Keys are provisioned out-of-band (`PoolManager::add_key`, admin API)
//! 2. `PoolManager::start` prepares the store and runs the reset check
//! 3. `PoolManager::acquire` selects and charges the least-used key
//! 4. Empty pool or store failure → `FallbackResolver` key, or `None`
//! 5. First of the month → counters reset (at startup, or per acquire / on a
//!    timer when configured)

pub mod error;
pub mod fallback;
pub mod pool;
pub mod reset_task;
pub mod schedule;

pub use error::{Error, Result};
pub use fallback::{DEFAULT_FALLBACK_ENV, FallbackResolver};
pub use pool::{AcquiredKey, KeySource, ManagerState, PoolManager};
pub use reset_task::spawn_reset_task;
pub use schedule::{
    Clock, LocalClock, ManualClock, ResetCheck, ResetOutcome, maybe_reset, reset_due,
};
