//! Pool manager and least-used key selection
//!
//! The manager owns the store handle, the fallback resolver and the reset
//! policy. `start` is the Uninitialized → Ready transition: it prepares the
//! store and runs the monthly reset check. Store failures during start are
//! logged and leave the manager `Degraded`, but it still serves `acquire`,
//! which keeps trying the store on every call and falls back when it can't
//! get a key from it.
//!
//! `acquire` never fails. An empty pool and an unreachable store both fall
//! back to the configured key; they are logged and counted separately so the
//! two situations can be told apart on dashboards.

use std::fmt;
use std::sync::Arc;

use key_store::{CredentialRecord, KeyStore, StoreError};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::fallback::FallbackResolver;
use crate::schedule::{Clock, ResetCheck, ResetOutcome, maybe_reset};

/// Where an acquired key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Pool,
    Fallback,
}

impl KeySource {
    /// Source label for metrics/logging.
    pub fn label(&self) -> &'static str {
        match self {
            KeySource::Pool => "pool",
            KeySource::Fallback => "fallback",
        }
    }
}

/// A key handed out by `PoolManager::acquire`.
#[derive(Clone, PartialEq, Eq)]
pub struct AcquiredKey {
    pub key: String,
    pub source: KeySource,
}

impl fmt::Debug for AcquiredKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredKey")
            .field("key", &common::redact(&self.key))
            .field("source", &self.source)
            .finish()
    }
}

/// Manager state after `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerState {
    Ready,
    /// Startup could not prepare the store or run the reset check.
    Degraded { reason: String },
}

impl ManagerState {
    pub fn label(&self) -> &'static str {
        match self {
            ManagerState::Ready => "ready",
            ManagerState::Degraded { .. } => "degraded",
        }
    }
}

/// What the store produced for one acquire.
enum PoolDraw {
    Selected(CredentialRecord),
    Empty,
    Unavailable(StoreError),
}

/// Shared, rate-limited key pool.
///
/// Constructed once by whatever composes the service and shared as
/// `Arc<PoolManager>`. Select-and-increment is delegated to
/// `KeyStore::acquire_least_used`, which is atomic per call. Reset checks are
/// serialized by `reset_lock` here and by `KeyStore::reset_all_if` across
/// processes.
pub struct PoolManager {
    store: Arc<dyn KeyStore>,
    fallback: FallbackResolver,
    clock: Arc<dyn Clock>,
    reset_check: ResetCheck,
    reset_lock: Mutex<()>,
    state: ManagerState,
}

impl PoolManager {
    /// Prepare the store, run the startup reset check and return a ready
    /// manager.
    pub async fn start(
        store: Arc<dyn KeyStore>,
        fallback: FallbackResolver,
        reset_check: ResetCheck,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut manager = Self {
            store,
            fallback,
            clock,
            reset_check,
            reset_lock: Mutex::new(()),
            state: ManagerState::Ready,
        };

        let mut problems = Vec::new();
        if let Err(e) = manager.store.ensure_schema().await {
            error!(backend = manager.store.backend(), error = %e, "failed to prepare key store");
            record_store_error("ensure_schema");
            problems.push(format!("schema: {e}"));
        }
        match manager.check_reset().await {
            Ok(outcome) => debug!(outcome = outcome.label(), "startup reset check complete"),
            Err(e) => {
                error!(error = %e, "startup reset check failed");
                problems.push(format!("reset check: {e}"));
            }
        }
        if !problems.is_empty() {
            manager.state = ManagerState::Degraded {
                reason: problems.join("; "),
            };
        }

        info!(
            backend = manager.store.backend(),
            state = manager.state.label(),
            reset_check = %manager.reset_check,
            fallback_configured = manager.fallback.is_configured(),
            "key pool started"
        );
        manager
    }

    /// Hand out the least-used key, charging it one use.
    ///
    /// Falls back to the configured key when the pool is empty or the store
    /// fails. Returns `None` only when neither yields a key; callers should
    /// treat that as "no credential" for the request at hand.
    pub async fn acquire(&self) -> Option<AcquiredKey> {
        if self.reset_check == ResetCheck::EveryAcquire {
            if let Err(e) = self.check_reset().await {
                warn!(error = %e, "reset check failed, continuing with current counts");
            }
        }

        let reason = match self.draw().await {
            PoolDraw::Selected(record) => {
                debug!(
                    key = %common::redact(&record.identifier),
                    usage_count = record.usage_count,
                    "acquired key from pool"
                );
                metrics::counter!("key_pool_acquire_total", "source" => "pool").increment(1);
                return Some(AcquiredKey {
                    key: record.identifier,
                    source: KeySource::Pool,
                });
            }
            PoolDraw::Empty => {
                warn!("key pool is empty, using fallback key");
                "empty"
            }
            PoolDraw::Unavailable(e) => {
                error!(backend = self.store.backend(), error = %e, "key store unavailable, using fallback key");
                "unavailable"
            }
        };
        metrics::counter!("key_pool_fallback_total", "reason" => reason).increment(1);

        match self.fallback.resolve() {
            Some(key) => {
                metrics::counter!("key_pool_acquire_total", "source" => "fallback").increment(1);
                Some(AcquiredKey {
                    key,
                    source: KeySource::Fallback,
                })
            }
            None => {
                warn!(
                    reason,
                    fallback_source = self.fallback.source(),
                    "no credential available: pool yielded no key and no fallback is configured"
                );
                metrics::counter!("key_pool_acquire_total", "source" => "none").increment(1);
                None
            }
        }
    }

    /// `acquire` for callers that expect a plain string; the empty string
    /// means no credential is available.
    pub async fn acquire_key(&self) -> String {
        self.acquire().await.map(|acquired| acquired.key).unwrap_or_default()
    }

    /// Run the monthly reset check now.
    ///
    /// Concurrent calls are serialized, so at most one of them can observe
    /// the month as not yet reset.
    pub async fn check_reset(&self) -> Result<ResetOutcome> {
        let _guard = self.reset_lock.lock().await;
        let today = self.clock.today();
        maybe_reset(self.store.as_ref(), today).await.inspect_err(|e| {
            if let Error::Store(_) = e {
                record_store_error("reset");
            }
        })
    }

    /// Provision a new key. Returns `false` if it was already in the pool.
    pub async fn add_key(&self, key: &str) -> Result<bool> {
        let created = self.store.insert(key).await.inspect_err(|_| {
            record_store_error("insert");
        })?;
        if created {
            info!(key = %common::redact(key), "key added to pool");
        } else {
            debug!(key = %common::redact(key), "key already in pool");
        }
        Ok(created)
    }

    /// Snapshot of every key with its usage.
    pub async fn records(&self) -> Result<Vec<CredentialRecord>> {
        Ok(self.store.records().await.inspect_err(|_| {
            record_store_error("records");
        })?)
    }

    /// Pool health summary for the health endpoint.
    ///
    /// `healthy` when the store is reachable and holds keys, `degraded` when
    /// only the fallback key can be served, `unhealthy` when nothing can.
    pub async fn health(&self) -> serde_json::Value {
        let fallback_configured = self.fallback.is_configured();
        let (store, keys, serving_pool) = match self.store.records().await {
            Ok(records) => {
                let usage_total = records
                    .iter()
                    .fold(0u64, |total, r| total.saturating_add(r.usage_count));
                let last_reset = records.iter().filter_map(|r| r.last_reset).max();
                let keys: Vec<serde_json::Value> = records
                    .iter()
                    .map(|r| {
                        serde_json::json!({
                            "key": common::redact(&r.identifier),
                            "usage_count": r.usage_count,
                            "last_reset": r.last_reset.map(|d| d.to_string()),
                        })
                    })
                    .collect();
                (
                    serde_json::json!({
                        "backend": self.store.backend(),
                        "reachable": true,
                        "keys_total": records.len(),
                        "usage_total": usage_total,
                        "last_reset": last_reset.map(|d| d.to_string()),
                    }),
                    keys,
                    !records.is_empty(),
                )
            }
            Err(e) => (
                serde_json::json!({
                    "backend": self.store.backend(),
                    "reachable": false,
                    "error": e.to_string(),
                }),
                Vec::new(),
                false,
            ),
        };

        let status = if serving_pool {
            "healthy"
        } else if fallback_configured {
            "degraded"
        } else {
            "unhealthy"
        };

        let mut health = serde_json::json!({
            "status": status,
            "manager_state": self.state.label(),
            "store": store,
            "fallback_configured": fallback_configured,
            "reset_check": self.reset_check.label(),
            "keys": keys,
        });
        if let ManagerState::Degraded { reason } = &self.state {
            health["manager_state_reason"] = serde_json::Value::String(reason.clone());
        }
        health
    }

    pub fn state(&self) -> &ManagerState {
        &self.state
    }

    pub fn reset_check(&self) -> ResetCheck {
        self.reset_check
    }

    async fn draw(&self) -> PoolDraw {
        match self.store.acquire_least_used().await {
            Ok(Some(record)) => PoolDraw::Selected(record),
            Ok(None) => PoolDraw::Empty,
            Err(e) => {
                record_store_error("acquire");
                PoolDraw::Unavailable(e)
            }
        }
    }
}

fn record_store_error(operation: &'static str) {
    metrics::counter!("key_pool_store_errors_total", "operation" => operation).increment(1);
}
