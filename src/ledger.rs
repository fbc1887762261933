//! Append-only activity ledger backed by SQLite.
//!
//! The ledger serves two purposes: a compliance trail of every backup
//! attempt, and the idempotency oracle the trigger policy consults. Entries
//! are never mutated or deleted. "Today" is always computed in the configured
//! trigger timezone, never the database's or host's timezone.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;

/// Action tag for the daily automatic backup.
pub const ACTION_DAILY_BACKUP: &str = "daily_automatic_backup";

/// Action tag for operator-invoked full backups.
pub const ACTION_FULL_BACKUP: &str = "full_manual_backup";

/// Marker substring a successful entry's description must contain.
pub const SUCCESS_MARKER: &str = "completed successfully";

/// Errors specific to ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create ledger directory: {0}")]
    CreateDir(std::io::Error),

    /// The per-day UNIQUE guard rejected a second success for the same day.
    #[error("A success entry for {action} on {day} already exists")]
    DuplicateSuccess { action: String, day: String },
}

/// A row from the `activity_log` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: i64,
    pub action: String,
    pub description: String,
    pub succeeded: bool,
    pub day: String,
    pub created_at: String,
    pub metadata: Option<String>,
}

/// Ledger-derived counters for the reporting surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupReport {
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Percentage of attempts that succeeded, 0.0 when no attempts exist.
    pub success_rate: f64,
    pub last_success_at: Option<String>,
    pub last_failure_at: Option<String>,
    pub days_since_last_success: Option<i64>,
}

/// SQLite connection wrapper for the activity ledger.
///
/// Intentionally NOT `Clone` or `Sync`; callers that need concurrent access
/// open their own connection, the same way the request and daemon paths do.
pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Open (or create) the ledger at `~/.clinicvault/ledger.db`.
    pub fn open() -> Result<Self, LedgerError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a ledger at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(LedgerError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL mode: the request path and the daemon read concurrently
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        // Idempotent schema (IF NOT EXISTS throughout)
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self { conn })
    }

    /// Resolve the default ledger path: `~/.clinicvault/ledger.db`.
    fn db_path() -> Result<PathBuf, LedgerError> {
        let home = dirs::home_dir().ok_or(LedgerError::HomeDirNotFound)?;
        Ok(home.join(".clinicvault").join("ledger.db"))
    }

    /// Append a success entry for `action` at `now`.
    ///
    /// The calendar day is bound in `tz`. A second success on the same day
    /// trips the UNIQUE guard and returns `DuplicateSuccess`, which is how a
    /// lost race between concurrent callers surfaces.
    pub fn record_success(
        &self,
        action: &str,
        description: &str,
        metadata: Option<&serde_json::Value>,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Result<(), LedgerError> {
        debug_assert!(description.contains(SUCCESS_MARKER));
        self.append(action, description, true, metadata, now, tz)
    }

    /// Append a failure entry for `action` at `now`.
    pub fn record_failure(
        &self,
        action: &str,
        description: &str,
        metadata: Option<&serde_json::Value>,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Result<(), LedgerError> {
        self.append(action, description, false, metadata, now, tz)
    }

    fn append(
        &self,
        action: &str,
        description: &str,
        succeeded: bool,
        metadata: Option<&serde_json::Value>,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Result<(), LedgerError> {
        let day = day_in_tz(now, tz);
        let metadata_str = metadata.map(|m| m.to_string());

        let result = self.conn.execute(
            "INSERT INTO activity_log (action, description, succeeded, day, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                action,
                description,
                succeeded as i64,
                day,
                now.to_rfc3339(),
                metadata_str
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(LedgerError::DuplicateSuccess {
                    action: action.to_string(),
                    day,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Does a success entry for `action` exist on `now`'s calendar day in `tz`?
    pub fn has_success_on_day(
        &self,
        action: &str,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Result<bool, LedgerError> {
        let day = day_in_tz(now, tz);
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM activity_log
             WHERE action = ?1 AND day = ?2 AND succeeded = 1",
            params![action, day],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Most recent entries for an action, newest first.
    pub fn recent_entries(&self, action: &str, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, action, description, succeeded, day, created_at, metadata
             FROM activity_log
             WHERE action = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![action, limit as i64], |row| {
            Ok(LedgerEntry {
                id: row.get(0)?,
                action: row.get(1)?,
                description: row.get(2)?,
                succeeded: row.get::<_, i64>(3)? != 0,
                day: row.get(4)?,
                created_at: row.get(5)?,
                metadata: row.get(6)?,
            })
        })?;

        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Aggregate counters for the reporting surface.
    pub fn report(&self, action: &str, now: DateTime<Utc>) -> Result<BackupReport, LedgerError> {
        let (total, successes): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(succeeded), 0) FROM activity_log WHERE action = ?1",
            params![action],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let last_success_at: Option<String> = self.conn.query_row(
            "SELECT MAX(created_at) FROM activity_log WHERE action = ?1 AND succeeded = 1",
            params![action],
            |row| row.get(0),
        )?;

        let last_failure_at: Option<String> = self.conn.query_row(
            "SELECT MAX(created_at) FROM activity_log WHERE action = ?1 AND succeeded = 0",
            params![action],
            |row| row.get(0),
        )?;

        let failures = total - successes;
        let success_rate = if total > 0 {
            (successes as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        let days_since_last_success = last_success_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| (now - t.with_timezone(&Utc)).num_days());

        Ok(BackupReport {
            total_attempts: total as u64,
            successes: successes as u64,
            failures: failures as u64,
            success_rate,
            last_success_at,
            last_failure_at,
            days_since_last_success,
        })
    }
}

/// Calendar date of `now` in `tz`, formatted `YYYY-MM-DD`.
pub fn day_in_tz(now: DateTime<Utc>, tz: Tz) -> String {
    now.with_timezone(&tz).format("%Y-%m-%d").to_string()
}
