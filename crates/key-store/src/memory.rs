//! In-process backend
//!
//! Holds the table behind a tokio `Mutex`. Nothing survives a restart, which
//! suits tests and short-lived deployments where keys are provisioned at
//! startup through the admin API.

use chrono::NaiveDate;
use tokio::sync::Mutex;

use crate::record::{CredentialRecord, UsageTable};
use crate::{ConditionalReset, KeyStore, ResetDue, StoreFuture};

/// Key pool kept in memory.
#[derive(Default)]
pub struct MemoryStore {
    table: Mutex<UsageTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing table (e.g. restored from a snapshot).
    pub fn with_table(table: UsageTable) -> Self {
        Self {
            table: Mutex::new(table),
        }
    }
}

impl KeyStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn ensure_schema(&self) -> StoreFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn select_least_used(&self) -> StoreFuture<'_, Option<CredentialRecord>> {
        Box::pin(async move { Ok(self.table.lock().await.least_used()) })
    }

    fn increment_usage<'a>(&'a self, identifier: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.table.lock().await.increment(identifier)?;
            Ok(())
        })
    }

    fn acquire_least_used(&self) -> StoreFuture<'_, Option<CredentialRecord>> {
        Box::pin(async move { self.table.lock().await.take_least_used() })
    }

    fn last_reset_date(&self) -> StoreFuture<'_, Option<NaiveDate>> {
        Box::pin(async move { Ok(self.table.lock().await.last_reset_date()) })
    }

    fn reset_all(&self, date: NaiveDate) -> StoreFuture<'_, u64> {
        Box::pin(async move { Ok(self.table.lock().await.reset_all(date)) })
    }

    fn reset_all_if<'a>(
        &'a self,
        date: NaiveDate,
        due: ResetDue<'a>,
    ) -> StoreFuture<'a, ConditionalReset> {
        Box::pin(async move { Ok(self.table.lock().await.reset_all_if(date, due)) })
    }

    fn insert<'a>(&'a self, identifier: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { self.table.lock().await.insert(identifier) })
    }

    fn records(&self) -> StoreFuture<'_, Vec<CredentialRecord>> {
        Box::pin(async move { Ok(self.table.lock().await.records()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_acquires_lose_no_updates() {
        let store = Arc::new(MemoryStore::new());
        store.insert("only-key").await.unwrap();

        let mut handles = vec![];
        for _ in 0..200 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.acquire_least_used().await.unwrap().unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let record = store.select_least_used().await.unwrap().unwrap();
        assert_eq!(record.usage_count, 200);
    }

    #[tokio::test]
    async fn increment_usage_charges_named_key() {
        let store = MemoryStore::new();
        store.insert("key-a").await.unwrap();
        store.insert("key-b").await.unwrap();

        store.increment_usage("key-a").await.unwrap();

        let least = store.select_least_used().await.unwrap().unwrap();
        assert_eq!(least.identifier, "key-b");
    }

    #[tokio::test]
    async fn reset_all_on_empty_store_resets_nothing() {
        let store = MemoryStore::new();
        let day = NaiveDate::from_ymd_opt(2026, 11, 1).unwrap();
        assert_eq!(store.reset_all(day).await.unwrap(), 0);
        assert_eq!(store.last_reset_date().await.unwrap(), None);
    }

    #[tokio::test]
    async fn with_table_serves_existing_rows() {
        let mut table = UsageTable::new();
        table.insert("restored-key").unwrap();
        let store = MemoryStore::with_table(table);

        let record = store.acquire_least_used().await.unwrap().unwrap();
        assert_eq!(record.identifier, "restored-key");
        assert_eq!(record.usage_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reset_is_atomic_with_concurrent_acquires() {
        let table: UsageTable =
            serde_json::from_str(r#"{"key-a": {"usage_count": 1000}, "key-b": {"usage_count": 1000}}"#)
                .unwrap();
        let store = Arc::new(MemoryStore::with_table(table));
        let day = NaiveDate::from_ymd_opt(2026, 11, 1).unwrap();

        let mut handles = vec![];
        for i in 0..200 {
            let store = store.clone();
            if i == 100 {
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    store.reset_all(day).await.unwrap();
                    None
                }));
            }
            handles.push(tokio::spawn(async move {
                Some(store.acquire_least_used().await.unwrap().unwrap())
            }));
        }
        let mut after_reset = std::collections::BTreeMap::<String, Vec<u64>>::new();
        for h in handles {
            if let Some(record) = h.await.unwrap() {
                if record.usage_count <= 200 {
                    after_reset.entry(record.identifier).or_default().push(record.usage_count);
                }
            }
        }

        for record in store.records().await.unwrap() {
            let mut counts = after_reset.remove(&record.identifier).unwrap_or_default();
            counts.sort_unstable();
            let expected: Vec<u64> = (1..=counts.len() as u64).collect();
            assert_eq!(counts, expected, "{record:?}");
            assert_eq!(record.usage_count, counts.len() as u64);
            assert_eq!(record.last_reset, Some(day));
        }
    }
}
