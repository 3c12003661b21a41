//! SQLite-backed persistence for metrics, health history, settings and
//! node identities.

mod health;
mod metrics;
mod models;
mod nodes;
mod settings;

pub use metrics::{start_of_day, start_of_month};
pub use models::*;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Storage error types. Kinds are distinguished by variant, never by
/// message text.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("not found")]
    NotFound,
    #[error("version conflict, current version is {current}")]
    VersionConflict { current: i64 },
    #[error("cannot aggregate into raw granularity")]
    InvalidAggregationTarget,
}

/// Thread-safe database store. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("migration 1 failed: {}", e)))?;
        Ok(())
    }
}

/// Storage format for timestamps: UTC, second precision, lexically ordered.
pub(crate) const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
pub(crate) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        DB_TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.fZ",
    ];
    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    None
}

/// Canonical tenant key for records submitted without an account.
pub fn normalize_account(account_id: &str) -> String {
    let trimmed = account_id.trim();
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> (Store, tempfile::NamedTempFile) {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let store = Store::new(tmp.path()).unwrap();
    (store, tmp)
}
