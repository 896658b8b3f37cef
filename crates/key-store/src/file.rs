//! JSON file backend
//!
//! The key file is a JSON object mapping each API key to its usage row. Each
//! operation behaves like a short-lived connection: it takes an exclusive
//! advisory lock on a sidecar lock file (`<name>.lock`), reads the file,
//! applies its change and, if anything changed, writes the whole table back
//! through a uniquely named temp file + rename before releasing the lock. The
//! lock is held by the OS, so separate `FileStore` handles and separate
//! processes on the same path serialize against each other. A failed write
//! leaves the previous file in place, so an increment is only committed once
//! it is on disk.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::record::{CredentialRecord, UsageTable};
use crate::{ConditionalReset, KeyStore, ResetDue, StoreFuture};

/// Key pool persisted to a single JSON file.
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    // Queues this handle's callers before they contend for the file lock.
    lock: Mutex<()>,
}

impl FileStore {
    /// Create a store for the given path. Nothing is touched on disk until
    /// `ensure_schema` or the first operation.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = sidecar(&path, "lock");
        Self {
            path,
            lock_path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block (off the runtime) until this process holds the exclusive lock.
    /// The lock is released when the returned file is dropped.
    async fn lock_file(&self) -> Result<File> {
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&lock_path)?;
            fs2::FileExt::lock_exclusive(&file)?;
            Ok::<_, std::io::Error>(file)
        })
        .await
        .map_err(|e| unavailable("key file lock task failed", e))?
        .map_err(|e| unavailable("locking key file", e))
    }

    async fn read_table(&self) -> Result<UsageTable> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Unavailable(format!(
                    "key file {} does not exist",
                    self.path.display()
                )));
            }
            Err(e) => return Err(unavailable("reading key file", e)),
        };
        serde_json::from_str(&contents)
            .map_err(|e| StoreError::Corrupt(format!("parsing key file: {e}")))
    }

    /// Run `op` against the current table under the store lock.
    ///
    /// `op` returns its result and whether it modified the table; modified
    /// tables are written back before the lock is released.
    async fn transact<T, F>(&self, op: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut UsageTable) -> Result<(T, bool)> + Send,
    {
        let _guard = self.lock.lock().await;
        let _file_lock = self.lock_file().await?;
        let mut table = self.read_table().await?;
        let (value, changed) = op(&mut table)?;
        if changed {
            write_atomic(&self.path, &table).await?;
        }
        Ok(value)
    }
}

impl KeyStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    fn ensure_schema(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            if let Some(dir) = self.path.parent() {
                if !dir.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(dir)
                        .await
                        .map_err(|e| unavailable("creating key file directory", e))?;
                }
            }
            let _file_lock = self.lock_file().await?;

            let exists = tokio::fs::try_exists(&self.path)
                .await
                .map_err(|e| unavailable("checking key file", e))?;
            if exists {
                let table = self.read_table().await?;
                info!(path = %self.path.display(), keys = table.len(), "loaded key file");
                return Ok(());
            }

            write_atomic(&self.path, &UsageTable::new()).await?;
            info!(path = %self.path.display(), "key file not found, created empty table");
            Ok(())
        })
    }

    fn select_least_used(&self) -> StoreFuture<'_, Option<CredentialRecord>> {
        Box::pin(async move { self.transact(|table| Ok((table.least_used(), false))).await })
    }

    fn increment_usage<'a>(&'a self, identifier: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.transact(|table| {
                table.increment(identifier)?;
                Ok(((), true))
            })
            .await
        })
    }

    fn acquire_least_used(&self) -> StoreFuture<'_, Option<CredentialRecord>> {
        Box::pin(async move {
            self.transact(|table| {
                let taken = table.take_least_used()?;
                let changed = taken.is_some();
                Ok((taken, changed))
            })
            .await
        })
    }

    fn last_reset_date(&self) -> StoreFuture<'_, Option<NaiveDate>> {
        Box::pin(async move { self.transact(|table| Ok((table.last_reset_date(), false))).await })
    }

    fn reset_all(&self, date: NaiveDate) -> StoreFuture<'_, u64> {
        Box::pin(async move { self.transact(|table| Ok((table.reset_all(date), true))).await })
    }

    fn reset_all_if<'a>(
        &'a self,
        date: NaiveDate,
        due: ResetDue<'a>,
    ) -> StoreFuture<'a, ConditionalReset> {
        Box::pin(async move {
            self.transact(|table| {
                let outcome = table.reset_all_if(date, due);
                let changed = matches!(outcome, ConditionalReset::Reset(_));
                Ok((outcome, changed))
            })
            .await
        })
    }

    fn insert<'a>(&'a self, identifier: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.transact(|table| {
                let created = table.insert(identifier)?;
                Ok((created, created))
            })
            .await
        })
    }

    fn records(&self) -> StoreFuture<'_, Vec<CredentialRecord>> {
        Box::pin(async move { self.transact(|table| Ok((table.records(), false))).await })
    }
}

/// `<dir>/<file name>.<suffix>`
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "keys.json".into());
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn unavailable(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(format!("{context}: {e}"))
}

/// Write the table to `path` atomically.
///
/// Serializes here, then hands the file work to the blocking pool.
async fn write_atomic(path: &Path, table: &UsageTable) -> Result<()> {
    let json = serde_json::to_string_pretty(table)
        .map_err(|e| StoreError::Corrupt(format!("serializing key table: {e}")))?;

    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || persist(&target, json.as_bytes()))
        .await
        .map_err(|e| unavailable("key file writer task failed", e))??;

    debug!(path = %path.display(), keys = table.len(), "persisted key table");
    Ok(())
}

/// Write `contents` to a fresh temp file in the target's directory, flush it
/// and rename it over `path`, so a crash mid-write never leaves a truncated
/// table. Every write gets its own temp name. The file holds API keys, so it
/// is 0600 on unix.
fn persist(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("keys.json");
    let prefix = format!(".{file_name}.");

    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| unavailable("creating temp key file", e))?;
    tmp.write_all(contents)
        .map_err(|e| unavailable("writing temp key file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| unavailable("syncing temp key file", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
            .map_err(|e| unavailable("setting key file permissions", e))?;
    }

    tmp.persist(path)
        .map_err(|e| unavailable("renaming temp key file", e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Create an initialized file store holding the given keys.
    async fn test_store(dir: &tempfile::TempDir, keys: &[&str]) -> FileStore {
        let store = FileStore::new(dir.path().join("keys.json"));
        store.ensure_schema().await.unwrap();
        for key in keys {
            assert!(store.insert(key).await.unwrap());
        }
        store
    }

    #[tokio::test]
    async fn ensure_schema_creates_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("keys.json");
        let store = FileStore::new(&path);

        assert!(!path.exists());
        store.ensure_schema().await.unwrap();
        assert!(path.exists());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: UsageTable = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &["key-a"]).await;
        store.increment_usage("key-a").await.unwrap();

        store.ensure_schema().await.unwrap();

        let records = store.records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].usage_count, 1);
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("never-created.json"));

        let err = store.acquire_least_used().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)), "got: {err}");
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        let store = FileStore::new(&path);

        assert!(matches!(
            store.ensure_schema().await.unwrap_err(),
            StoreError::Corrupt(_)
        ));
        assert!(matches!(
            store.select_least_used().await.unwrap_err(),
            StoreError::Corrupt(_)
        ));
    }

    #[tokio::test]
    async fn acquire_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &["key-a", "key-b"]).await;

        let first = store.acquire_least_used().await.unwrap().unwrap();
        assert_eq!(first.identifier, "key-a");
        assert_eq!(first.usage_count, 1);

        let reopened = FileStore::new(dir.path().join("keys.json"));
        let next = reopened.acquire_least_used().await.unwrap().unwrap();
        assert_eq!(next.identifier, "key-b");
    }

    #[tokio::test]
    async fn select_least_used_does_not_charge() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &["key-a"]).await;

        store.select_least_used().await.unwrap();
        store.select_least_used().await.unwrap();

        let record = store.select_least_used().await.unwrap().unwrap();
        assert_eq!(record.usage_count, 0);
    }

    #[tokio::test]
    async fn acquire_on_empty_store_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &[]).await;
        assert!(store.acquire_least_used().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn increment_unknown_key_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &["key-a"]).await;
        let before = tokio::fs::read_to_string(store.path()).await.unwrap();

        let err = store.increment_usage("key-z").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let after = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn reset_all_then_last_reset_date_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &["key-a", "key-b", "key-c"]).await;
        for _ in 0..4 {
            store.acquire_least_used().await.unwrap();
        }
        let day = date(2026, 11, 1);

        assert_eq!(store.reset_all(day).await.unwrap(), 3);

        assert_eq!(store.last_reset_date().await.unwrap(), Some(day));
        for record in store.records().await.unwrap() {
            assert_eq!(record.usage_count, 0);
            assert_eq!(record.last_reset, Some(day));
        }
    }

    #[tokio::test]
    async fn fresh_store_has_no_reset_date() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &["key-a"]).await;
        assert_eq!(store.last_reset_date().await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_acquires_lose_no_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(test_store(&dir, &["only-key"]).await);

        let mut handles = vec![];
        for _ in 0..25 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.acquire_least_used().await.unwrap().unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let record = store.select_least_used().await.unwrap().unwrap();
        assert_eq!(record.usage_count, 25);

        let contents = tokio::fs::read_to_string(store.path()).await.unwrap();
        let parsed: UsageTable = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.get("only-key").unwrap().usage_count, 25);
    }

    #[tokio::test]
    async fn concurrent_acquires_spread_across_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(test_store(&dir, &["key-a", "key-b", "key-c"]).await);

        let mut handles = vec![];
        for _ in 0..30 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.acquire_least_used().await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        for record in store.records().await.unwrap() {
            assert_eq!(record.usage_count, 10, "{record:?}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &["key-a"]).await;

        let metadata = tokio::fs::metadata(store.path()).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "key file must be 0600, got {mode:o}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_handles_on_one_file_lose_no_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        test_store(&dir, &["only-key"]).await;
        let first = Arc::new(FileStore::new(&path));
        let second = Arc::new(FileStore::new(&path));

        let mut handles = vec![];
        for i in 0..60 {
            let store = if i % 2 == 0 { first.clone() } else { second.clone() };
            handles.push(tokio::spawn(async move {
                store.acquire_least_used().await.unwrap().unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let record = first.select_least_used().await.unwrap().unwrap();
        assert_eq!(record.usage_count, 60);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_handles_reset_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let seed = test_store(&dir, &["key-a", "key-b"]).await;
        seed.reset_all(date(2026, 10, 1)).await.unwrap();
        let day = date(2026, 11, 1);

        let mut handles = vec![];
        for _ in 0..8 {
            let store = FileStore::new(&path);
            handles.push(tokio::spawn(async move {
                store
                    .reset_all_if(day, &|last| last != Some(day))
                    .await
                    .unwrap()
            }));
        }
        let mut resets = 0;
        for h in handles {
            match h.await.unwrap() {
                ConditionalReset::Reset(records) => {
                    assert_eq!(records, 2);
                    resets += 1;
                }
                ConditionalReset::Skipped(last) => assert_eq!(last, Some(day)),
            }
        }
        assert_eq!(resets, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reset_is_atomic_with_concurrent_acquires() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        tokio::fs::write(&path, r#"{"only-key": {"usage_count": 1000, "last_reset": null}}"#)
            .await
            .unwrap();
        let store = Arc::new(FileStore::new(&path));
        let day = date(2026, 11, 1);

        let mut handles = vec![];
        for i in 0..40 {
            if i == 20 {
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    store.reset_all(day).await.unwrap();
                    None
                }));
            }
            let other_handle = FileStore::new(&path);
            handles.push(tokio::spawn(async move {
                let record = other_handle.acquire_least_used().await.unwrap().unwrap();
                Some(record.usage_count)
            }));
        }
        let mut counts = vec![];
        for h in handles {
            if let Some(count) = h.await.unwrap() {
                counts.push(count);
            }
        }

        // Acquires after the reset counted up from zero; the ones before it
        // counted up from 1000.
        let mut after: Vec<u64> = counts.iter().copied().filter(|c| *c <= 40).collect();
        after.sort_unstable();
        let expected: Vec<u64> = (1..=after.len() as u64).collect();
        assert_eq!(after, expected);

        let record = store.select_least_used().await.unwrap().unwrap();
        assert_eq!(record.usage_count, after.len() as u64);
        assert_eq!(record.last_reset, Some(day));
    }

    #[tokio::test]
    async fn writes_leave_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir, &["key-a", "key-b"]).await;
        for _ in 0..5 {
            store.acquire_least_used().await.unwrap();
        }

        let mut names = vec![];
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        assert_eq!(names, vec!["keys.json", "keys.json.lock"]);
    }

    #[test]
    fn sidecar_sits_next_to_key_file() {
        assert_eq!(
            sidecar(Path::new("/var/lib/broker/keys.json"), "lock"),
            PathBuf::from("/var/lib/broker/keys.json.lock")
        );
        assert_eq!(sidecar(Path::new("keys.json"), "lock"), PathBuf::from("keys.json.lock"));
    }
}
