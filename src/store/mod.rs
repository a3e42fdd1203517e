//! Durable Run Store
//!
//! SQLite persistence for pipelines, steps, resource bindings, config
//! snapshots and logs. Every state transition is one transaction, so a
//! status change and the log entry describing it commit together or not at
//! all.
//!
//! # Structure
//!
//! - [`schema`]: Table definitions
//! - `pipeline_ops`, `step_ops`, `log_ops`, `config_ops`, `resource_ops`:
//!   Per-entity operations, all as methods on [`Store`]
//! - [`retry`]: Bounded retry for transient write failures

mod config_ops;
mod log_ops;
mod pipeline_ops;
mod resource_ops;
pub mod retry;
pub mod schema;
mod step_ops;
#[cfg(test)]
pub(crate) mod test_support;

use std::error::Error as StdError;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, Row, Transaction};
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::RunStatus;

pub use pipeline_ops::Registration;
pub use resource_ops::ResourceFilter;
pub use retry::RetryPolicy;
pub use step_ops::StepCompletion;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True for failures that may succeed when retried: a busy or locked
    /// database, or an I/O error underneath it.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
            ),
            StoreError::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Thread-safe handle to the run database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (or creates) the database at `path` and applies the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        debug!("Opened run database at {}", path.display());
        Self::init(conn)
    }

    /// Opens an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        schema::apply(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Runs `f` inside a transaction; commits on `Ok`, rolls back on `Err`.
    pub(crate) fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

/// Timestamps are stored as fixed-width RFC 3339 text so they sort
/// lexicographically.
pub(crate) fn fmt_dt(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn fmt_opt_dt(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(fmt_dt)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

pub(crate) fn col_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn col_opt_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| Uuid::parse_str(&t).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn col_dt(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_dt(&text).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn col_opt_dt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| parse_dt(&t).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn col_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn col_opt_json<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn col_parse<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e: String| conversion_error(idx, e))
}

fn parse_dt(text: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).map(|dt| dt.with_timezone(&Utc))
}
