//! Credential records and the usage table
//!
//! `UsageTable` is the logical schema shared by every backend: one row per
//! credential identifier holding its usage counter and the date of the last
//! monthly reset. Rows are kept in a `BTreeMap` so iteration order is
//! identifier-ascending, which is also the tie-break order for least-used
//! selection.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ConditionalReset;
use crate::error::{Result, StoreError};

/// A credential with its usage state.
///
/// `identifier` is the API key itself, so `Debug` prints a redacted
/// fingerprint instead of the value.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub identifier: String,
    pub usage_count: u64,
    pub last_reset: Option<NaiveDate>,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("identifier", &common::redact(&self.identifier))
            .field("usage_count", &self.usage_count)
            .field("last_reset", &self.last_reset)
            .finish()
    }
}

/// Persisted columns of one row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub usage_count: u64,
    #[serde(default)]
    pub last_reset: Option<NaiveDate>,
}

/// The full credential table, keyed by identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageTable {
    rows: BTreeMap<String, Usage>,
}

impl UsageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row with the smallest usage count; ties go to the lowest identifier.
    pub fn least_used(&self) -> Option<CredentialRecord> {
        self.rows
            .iter()
            .min_by_key(|(_, usage)| usage.usage_count)
            .map(|(id, usage)| record(id, usage))
    }

    /// Add one use to `identifier` and return its new count.
    pub fn increment(&mut self, identifier: &str) -> Result<u64> {
        let usage = self
            .rows
            .get_mut(identifier)
            .ok_or_else(|| StoreError::NotFound(common::redact(identifier)))?;
        charge(identifier, usage)?;
        Ok(usage.usage_count)
    }

    /// Select the least-used row and charge it in one step.
    ///
    /// Returns the record as it is after the increment, or `None` for an
    /// empty table.
    pub fn take_least_used(&mut self) -> Result<Option<CredentialRecord>> {
        let Some(identifier) = self.least_used().map(|r| r.identifier) else {
            return Ok(None);
        };
        let Some(usage) = self.rows.get_mut(&identifier) else {
            return Ok(None);
        };
        charge(&identifier, usage)?;
        Ok(Some(record(&identifier, usage)))
    }

    /// Most recent reset date present in the table.
    ///
    /// After a successful reset every row carries the same date, so this is
    /// "the" reset date; taking the maximum keeps the answer stable even if
    /// a row was edited by hand.
    pub fn last_reset_date(&self) -> Option<NaiveDate> {
        self.rows.values().filter_map(|usage| usage.last_reset).max()
    }

    /// Zero every counter and stamp every row with `date`.
    pub fn reset_all(&mut self, date: NaiveDate) -> u64 {
        for usage in self.rows.values_mut() {
            usage.usage_count = 0;
            usage.last_reset = Some(date);
        }
        self.rows.len() as u64
    }

    /// `reset_all(date)` if the table holds rows and `due` accepts the
    /// current last reset date.
    pub fn reset_all_if<F>(&mut self, date: NaiveDate, due: F) -> ConditionalReset
    where
        F: FnOnce(Option<NaiveDate>) -> bool,
    {
        if self.rows.is_empty() {
            return ConditionalReset::Skipped(None);
        }
        let last_reset = self.last_reset_date();
        if !due(last_reset) {
            return ConditionalReset::Skipped(last_reset);
        }
        ConditionalReset::Reset(self.reset_all(date))
    }

    /// Provision a new credential.
    ///
    /// The new row joins the current reset cohort. Returns `false` without
    /// touching anything if the identifier already exists.
    pub fn insert(&mut self, identifier: &str) -> Result<bool> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(StoreError::Invalid("identifier must not be empty".into()));
        }
        if self.rows.contains_key(identifier) {
            return Ok(false);
        }
        let last_reset = self.last_reset_date();
        self.rows.insert(
            identifier.to_string(),
            Usage {
                usage_count: 0,
                last_reset,
            },
        );
        Ok(true)
    }

    /// All rows in identifier order.
    pub fn records(&self) -> Vec<CredentialRecord> {
        self.rows.iter().map(|(id, usage)| record(id, usage)).collect()
    }

    pub fn get(&self, identifier: &str) -> Option<CredentialRecord> {
        self.rows.get(identifier).map(|usage| record(identifier, usage))
    }
}

fn charge(identifier: &str, usage: &mut Usage) -> Result<()> {
    usage.usage_count = usage.usage_count.checked_add(1).ok_or_else(|| {
        StoreError::Corrupt(format!(
            "usage count for {} is at its maximum",
            common::redact(identifier)
        ))
    })?;
    Ok(())
}

fn record(identifier: &str, usage: &Usage) -> CredentialRecord {
    CredentialRecord {
        identifier: identifier.to_string(),
        usage_count: usage.usage_count,
        last_reset: usage.last_reset,
    }
}
