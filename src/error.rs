//! Error types for backup execution
//!
//! Errors are classified by origin:
//! - Configuration: missing database name, dump utility not found
//! - Execution: subprocess failed, classified by output pattern
//! - Post-condition: the artifact is missing or empty
//! - Dispatch: queue/process launch problems (never fatal to the caller)

use std::path::PathBuf;
use thiserror::Error;

/// Error types for a backup attempt
#[derive(Debug, Error)]
pub enum BackupError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Database name is not configured")]
    DatabaseNameMissing,

    #[error("mysqldump not found on PATH or in any known install location")]
    DumpUtilityNotFound,

    #[error("Failed to create backup directory {0}: {1}")]
    OutputDirCreate(PathBuf, String),

    #[error("Backup directory {0} is not writable")]
    OutputDirNotWritable(PathBuf),

    // Execution errors, classified from the dump output
    #[error("Database access denied for the configured credentials")]
    AccessDenied,

    #[error("Unknown database '{0}'")]
    UnknownDatabase(String),

    #[error("Could not connect to the database server")]
    ConnectionRefused,

    #[error("Dump failed with exit code {code}: {output}")]
    DumpFailed { code: i32, output: String },

    #[error("Dump timed out after {0} seconds")]
    Timeout(u64),

    // Post-condition violations
    #[error("Dump file was created but is empty: {0}")]
    EmptyDump(PathBuf),

    #[error("Dump file was not created: {0}")]
    MissingDump(PathBuf),

    // Idempotency guard
    #[error("A successful backup is already recorded for today")]
    AlreadyRan,

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl BackupError {
    /// Returns true if retrying later could succeed without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackupError::ConnectionRefused | BackupError::Timeout(_)
        )
    }

    /// Get an operator-facing recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            BackupError::ConfigurationError(_) => {
                "Check your configuration in ~/.clinicvault/config.json"
            }
            BackupError::DatabaseNameMissing => {
                "Set database.name in ~/.clinicvault/config.json"
            }
            BackupError::DumpUtilityNotFound => {
                "Install the MySQL client tools, or set dumpUtility in the config to the full path of mysqldump"
            }
            BackupError::OutputDirCreate(_, _) => {
                "Check that the storage root exists and the service user can create directories under it"
            }
            BackupError::OutputDirNotWritable(_) => {
                "Fix the permissions on the backup directory so the service user can write to it"
            }
            BackupError::AccessDenied => {
                "Verify database.username and database.password match a MySQL account with SELECT, LOCK TABLES and TRIGGER privileges"
            }
            BackupError::UnknownDatabase(_) => {
                "Verify database.name matches an existing schema on the server"
            }
            BackupError::ConnectionRefused => {
                "Check that the database server is running and reachable at the configured host and port"
            }
            BackupError::DumpFailed { .. } => "Check the captured dump output for details",
            BackupError::Timeout(_) => {
                "The database may be under heavy load. Raise dumpTimeoutSecs or retry off-hours"
            }
            BackupError::EmptyDump(_) => {
                "The dump produced no data. Check the database contents and the dump utility version"
            }
            BackupError::MissingDump(_) => {
                "The dump utility exited without writing a file. Check disk space and permissions"
            }
            BackupError::AlreadyRan => "Nothing to do. Today's backup already succeeded",
            BackupError::Ledger(_) => "Check that the ledger database file is not corrupted",
            BackupError::IoError(_) => "Check file permissions and disk space",
        }
    }

    /// Marker substring recorded in the ledger description for this failure.
    ///
    /// Reporting and the trigger policy match on these markers, so they are
    /// part of the ledger contract: "failed" for ordinary failures,
    /// "exception" for timeouts and environment problems.
    pub fn ledger_marker(&self) -> &'static str {
        match self {
            BackupError::Timeout(_)
            | BackupError::IoError(_)
            | BackupError::Ledger(_)
            | BackupError::OutputDirCreate(_, _)
            | BackupError::OutputDirNotWritable(_) => "exception",
            _ => "failed",
        }
    }
}

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        BackupError::IoError(err.to_string())
    }
}
