//! Periodic background reset check
//!
//! For long-running processes that should not depend on a restart to pick up
//! the first-of-month reset. Spawned only when the pool is configured with
//! `ResetCheck::Interval`; runs independently of the acquire path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::pool::PoolManager;
use crate::schedule::ResetOutcome;

/// Spawn a background task that re-runs the monthly reset check.
///
/// Runs every `interval`. Failures are logged and retried on the next tick.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_reset_task(pool: Arc<PoolManager>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; start() already ran the check
        ticker.tick().await;

        loop {
            ticker.tick().await;
            reset_cycle(&pool).await;
        }
    })
}

/// Run one scheduled check.
async fn reset_cycle(pool: &PoolManager) {
    match pool.check_reset().await {
        Ok(ResetOutcome::Reset { date, records }) => {
            debug!(%date, records, "scheduled reset check zeroed usage counters");
        }
        Ok(outcome) => {
            debug!(outcome = outcome.label(), "scheduled reset check, nothing to do");
        }
        Err(e) => {
            warn!(error = %e, "scheduled reset check failed, will retry next cycle");
        }
    }
}
