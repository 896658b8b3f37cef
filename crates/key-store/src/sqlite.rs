//! SQLite backend
//!
//! One `search_api_keys` table in a database reached through a connection URL
//! such as `sqlite:///var/lib/search-key-broker/keys.db?mode=rwc`. Every
//! operation is a single SQL statement, so SQLite's write lock makes
//! select-and-increment and bulk resets atomic for every process that opens
//! the same database.

use std::time::Duration;

use chrono::NaiveDate;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr, QueryResult,
    Statement, Value,
};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::record::CredentialRecord;
use crate::{ConditionalReset, KeyStore, ResetDue, StoreFuture};

const DATE_FORMAT: &str = "%Y-%m-%d";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS search_api_keys (
    identifier TEXT PRIMARY KEY NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
    last_reset TEXT
)";

const SELECT_LEAST_USED: &str = "SELECT identifier, usage_count, last_reset
    FROM search_api_keys
    ORDER BY usage_count, identifier
    LIMIT 1";

// Counters stop one short of i64::MAX; SQLite would turn the overflow into a
// REAL instead of failing.
const ACQUIRE_LEAST_USED: &str = "UPDATE search_api_keys
    SET usage_count = usage_count + 1
    WHERE identifier = (
        SELECT identifier FROM search_api_keys ORDER BY usage_count, identifier LIMIT 1
    )
    AND usage_count < 9223372036854775807
    RETURNING identifier, usage_count, last_reset";

const INCREMENT_USAGE: &str = "UPDATE search_api_keys
    SET usage_count = usage_count + 1
    WHERE identifier = ?1 AND usage_count < 9223372036854775807";

const RESET_ALL: &str = "UPDATE search_api_keys SET usage_count = 0, last_reset = ?1";

// Compare-and-swap on the last reset date: only applies if nobody reset the
// table since it was read.
const RESET_ALL_IF_UNCHANGED: &str = "UPDATE search_api_keys
    SET usage_count = 0, last_reset = ?1
    WHERE (SELECT MAX(last_reset) FROM search_api_keys) IS ?2";

const INSERT: &str = "INSERT OR IGNORE INTO search_api_keys (identifier, usage_count, last_reset)
    VALUES (?1, 0, (SELECT MAX(last_reset) FROM search_api_keys))";

/// Key pool in a SQLite database.
pub struct SqliteStore {
    db: DatabaseConnection,
}

impl SqliteStore {
    /// Open a lazily connected pool for `url`.
    ///
    /// Only the URL is checked here; an unreachable database surfaces as
    /// `StoreError::Unavailable` from the first operation.
    pub async fn connect(url: &str) -> Result<Self> {
        let mut options = ConnectOptions::new(url.to_owned());
        options
            .max_connections(5)
            .connect_timeout(Duration::from_secs(5))
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(true)
            .sqlx_logging(false);

        let db = Database::connect(options)
            .await
            .map_err(|e| StoreError::Invalid(format!("key database url: {e}")))?;
        Ok(Self { db })
    }

    async fn fetch_one(&self, sql: &str, values: Vec<Value>) -> Result<Option<CredentialRecord>> {
        self.db
            .query_one(statement(sql, values))
            .await
            .map_err(unavailable)?
            .as_ref()
            .map(to_record)
            .transpose()
    }

    async fn exists(&self, identifier: &str) -> Result<bool> {
        let row = self
            .db
            .query_one(statement(
                "SELECT 1 AS present FROM search_api_keys WHERE identifier = ?1",
                vec![identifier.into()],
            ))
            .await
            .map_err(unavailable)?;
        Ok(row.is_some())
    }
}

impl KeyStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn ensure_schema(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.db
                .execute_unprepared(CREATE_TABLE)
                .await
                .map_err(unavailable)?;
            info!("key table ready");
            Ok(())
        })
    }

    fn select_least_used(&self) -> StoreFuture<'_, Option<CredentialRecord>> {
        Box::pin(async move { self.fetch_one(SELECT_LEAST_USED, vec![]).await })
    }

    fn increment_usage<'a>(&'a self, identifier: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let result = self
                .db
                .execute(statement(INCREMENT_USAGE, vec![identifier.into()]))
                .await
                .map_err(unavailable)?;
            if result.rows_affected() == 1 {
                return Ok(());
            }
            if self.exists(identifier).await? {
                Err(saturated(identifier))
            } else {
                Err(StoreError::NotFound(common::redact(identifier)))
            }
        })
    }

    fn acquire_least_used(&self) -> StoreFuture<'_, Option<CredentialRecord>> {
        Box::pin(async move {
            if let Some(record) = self.fetch_one(ACQUIRE_LEAST_USED, vec![]).await? {
                return Ok(Some(record));
            }
            match self.fetch_one(SELECT_LEAST_USED, vec![]).await? {
                Some(record) => Err(saturated(&record.identifier)),
                None => Ok(None),
            }
        })
    }

    fn last_reset_date(&self) -> StoreFuture<'_, Option<NaiveDate>> {
        Box::pin(async move {
            let row = self
                .db
                .query_one(statement(
                    "SELECT MAX(last_reset) AS last_reset FROM search_api_keys",
                    vec![],
                ))
                .await
                .map_err(unavailable)?;
            match row {
                Some(row) => {
                    let last: Option<String> = row.try_get("", "last_reset").map_err(corrupt)?;
                    last.as_deref().map(parse_date).transpose()
                }
                None => Ok(None),
            }
        })
    }

    fn reset_all(&self, date: NaiveDate) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let result = self
                .db
                .execute(statement(RESET_ALL, vec![format_date(date).into()]))
                .await
                .map_err(unavailable)?;
            Ok(result.rows_affected())
        })
    }

    fn reset_all_if<'a>(
        &'a self,
        date: NaiveDate,
        due: ResetDue<'a>,
    ) -> StoreFuture<'a, ConditionalReset> {
        Box::pin(async move {
            let last_reset = self.last_reset_date().await?;
            if !due(last_reset) {
                return Ok(ConditionalReset::Skipped(last_reset));
            }

            let seen: Option<String> = last_reset.map(format_date);
            let result = self
                .db
                .execute(statement(
                    RESET_ALL_IF_UNCHANGED,
                    vec![format_date(date).into(), Value::from(seen)],
                ))
                .await
                .map_err(unavailable)?;

            match result.rows_affected() {
                0 => {
                    // Empty table, or another process reset first.
                    let current = self.last_reset_date().await?;
                    debug!(?current, "conditional reset skipped");
                    Ok(ConditionalReset::Skipped(current))
                }
                records => Ok(ConditionalReset::Reset(records)),
            }
        })
    }

    fn insert<'a>(&'a self, identifier: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let identifier = identifier.trim();
            if identifier.is_empty() {
                return Err(StoreError::Invalid("identifier must not be empty".into()));
            }
            let result = self
                .db
                .execute(statement(INSERT, vec![identifier.into()]))
                .await
                .map_err(unavailable)?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn records(&self) -> StoreFuture<'_, Vec<CredentialRecord>> {
        Box::pin(async move {
            let rows = self
                .db
                .query_all(statement(
                    "SELECT identifier, usage_count, last_reset
                     FROM search_api_keys ORDER BY identifier",
                    vec![],
                ))
                .await
                .map_err(unavailable)?;
            rows.iter().map(to_record).collect()
        })
    }
}

fn statement(sql: &str, values: Vec<Value>) -> Statement {
    Statement::from_sql_and_values(DbBackend::Sqlite, sql, values)
}

fn to_record(row: &QueryResult) -> Result<CredentialRecord> {
    let identifier: String = row.try_get("", "identifier").map_err(corrupt)?;
    let usage_count: i64 = row.try_get("", "usage_count").map_err(corrupt)?;
    let last_reset: Option<String> = row.try_get("", "last_reset").map_err(corrupt)?;

    let usage_count = u64::try_from(usage_count).map_err(|_| {
        StoreError::Corrupt(format!(
            "negative usage count for {}",
            common::redact(&identifier)
        ))
    })?;
    Ok(CredentialRecord {
        identifier,
        usage_count,
        last_reset: last_reset.as_deref().map(parse_date).transpose()?,
    })
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("bad last_reset {value:?}: {e}")))
}

fn unavailable(e: DbErr) -> StoreError {
    StoreError::Unavailable(format!("key database: {e}"))
}

fn corrupt(e: DbErr) -> StoreError {
    StoreError::Corrupt(format!("key database row: {e}"))
}

fn saturated(identifier: &str) -> StoreError {
    StoreError::Corrupt(format!(
        "usage count for {} is at its maximum",
        common::redact(identifier)
    ))
}
