//! MySQL dump executor.
//!
//! Produces a verified on-disk SQL dump of the EMR database. The dump
//! utility is invoked as an argv-array subprocess (never through a shell),
//! stdout goes straight to the artifact file, and stderr is captured for
//! failure classification. Every invocation, success or failure, ends with
//! exactly one ledger entry.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::BackupError;
use crate::ledger::{Ledger, ACTION_DAILY_BACKUP};
use crate::types::Config;

/// Well-known install locations checked after PATH lookup fails.
#[cfg(unix)]
const KNOWN_LOCATIONS: &[&str] = &[
    "/usr/bin/mysqldump",
    "/usr/local/bin/mysqldump",
    "/usr/local/mysql/bin/mysqldump",
    "/opt/homebrew/bin/mysqldump",
    "/opt/lampp/bin/mysqldump",
];

#[cfg(windows)]
const KNOWN_LOCATIONS: &[&str] = &[
    r"C:\xampp\mysql\bin\mysqldump.exe",
    r"C:\Program Files\MySQL\MySQL Server 8.0\bin\mysqldump.exe",
    r"C:\Program Files\MySQL\MySQL Server 5.7\bin\mysqldump.exe",
    r"C:\wamp64\bin\mysql\mysql8.0.31\bin\mysqldump.exe",
];

/// A completed, verified dump on disk.
#[derive(Debug, Clone)]
pub struct DumpArtifact {
    pub file_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Locate the dump utility.
///
/// Order: explicit `dumpUtility` config override, then the platform's PATH
/// lookup command (`which` / `where`), then the well-known install
/// locations for this OS.
pub async fn find_dump_utility(config: &Config) -> Result<PathBuf, BackupError> {
    if let Some(explicit) = &config.dump_utility {
        let path = PathBuf::from(explicit);
        if path.exists() {
            return Ok(path);
        }
        return Err(BackupError::ConfigurationError(format!(
            "Configured dumpUtility does not exist: {}",
            explicit
        )));
    }

    let lookup = if cfg!(windows) { "where" } else { "which" };
    if let Ok(output) = Command::new(lookup).arg("mysqldump").output().await {
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if let Some(line) = stdout.lines().next() {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    return Ok(PathBuf::from(trimmed));
                }
            }
        }
    }

    for location in KNOWN_LOCATIONS {
        if Path::new(location).exists() {
            return Ok(PathBuf::from(location));
        }
    }

    Err(BackupError::DumpUtilityNotFound)
}

/// Ensure the backup output directory exists and is writable.
///
/// The two failure modes are reported distinctly: a directory that cannot
/// be created is an environment problem, a directory that exists but
/// rejects writes is a permissions problem.
pub fn ensure_backup_dir(dir: &Path) -> Result<(), BackupError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .map_err(|e| BackupError::OutputDirCreate(dir.to_path_buf(), e.to_string()))?;
    }

    // Probe writability with a throwaway file; tempfile removes it on drop
    tempfile::Builder::new()
        .prefix(".write_probe")
        .tempfile_in(dir)
        .map_err(|_| BackupError::OutputDirNotWritable(dir.to_path_buf()))?;

    Ok(())
}

/// Run the dump subprocess and verify the artifact.
///
/// `now` is only used to stamp the artifact filename; it should be the
/// trigger timezone's local time so file names sort with the ledger.
pub async fn run_dump(
    config: &Config,
    now_local: DateTime<chrono_tz::Tz>,
) -> Result<DumpArtifact, BackupError> {
    let db = &config.database;
    if db.name.is_empty() {
        return Err(BackupError::DatabaseNameMissing);
    }

    let utility = find_dump_utility(config).await?;

    let backup_dir = config.backup_dir();
    ensure_backup_dir(&backup_dir)?;

    let file_name = format!(
        "database_backup_{}.sql",
        now_local.format("%Y-%m-%d_%H-%M-%S")
    );
    let path = backup_dir.join(&file_name);

    let out_file = std::fs::File::create(&path)
        .map_err(|e| BackupError::IoError(format!("Failed to create {}: {}", path.display(), e)))?;

    let mut command = Command::new(&utility);
    command
        .arg("--host")
        .arg(&db.host)
        .arg("--port")
        .arg(db.port.to_string())
        .arg("--user")
        .arg(&db.username);
    if !db.password.is_empty() {
        // Credentials ride in argv by design parity with the deployment
        // scripts; the argv-array invocation at least keeps them out of a
        // shell and its history.
        command.arg(format!("--password={}", db.password));
    }
    command
        .arg("--single-transaction")
        .arg("--routines")
        .arg("--triggers")
        .arg(&db.name)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out_file))
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| BackupError::IoError(format!("Failed to spawn {}: {}", utility.display(), e)))?;

    let mut stderr_pipe = child.stderr.take();
    let timeout = Duration::from_secs(config.dump_timeout_secs);

    let waited = tokio::time::timeout(timeout, async {
        let mut diagnostics = String::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut diagnostics).await;
        }
        let status = child.wait().await;
        (status, diagnostics)
    })
    .await;

    let (status, diagnostics) = match waited {
        Ok((status, diagnostics)) => (
            status.map_err(|e| BackupError::IoError(e.to_string()))?,
            diagnostics,
        ),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            remove_partial(&path);
            return Err(BackupError::Timeout(config.dump_timeout_secs));
        }
    };

    if !status.success() {
        remove_partial(&path);
        return Err(classify_dump_failure(
            status.code().unwrap_or(-1),
            &diagnostics,
            &db.name,
        ));
    }

    // Post-conditions: the file must exist and be non-empty
    let size_bytes = match std::fs::metadata(&path) {
        Ok(meta) => meta.len(),
        Err(_) => return Err(BackupError::MissingDump(path)),
    };
    if size_bytes == 0 {
        remove_partial(&path);
        return Err(BackupError::EmptyDump(path));
    }

    Ok(DumpArtifact {
        file_name,
        path,
        size_bytes,
    })
}

/// Map a failed dump's combined diagnostics to a specific, actionable error.
fn classify_dump_failure(code: i32, output: &str, db_name: &str) -> BackupError {
    if output.contains("Access denied") {
        return BackupError::AccessDenied;
    }
    if output.contains("Unknown database") {
        return BackupError::UnknownDatabase(db_name.to_string());
    }
    if output.contains("Can't connect") || output.contains("Connection refused") {
        return BackupError::ConnectionRefused;
    }
    BackupError::DumpFailed {
        code,
        output: output.trim().to_string(),
    }
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("Failed to remove partial dump {}: {}", path.display(), e);
        }
    }
}

/// Run the daily dump and append the corresponding ledger entry.
///
/// This is the single entry point every call site funnels into. On success
/// the ledger gains a success row carrying the artifact metadata; on failure
/// it gains a failure row whose description embeds the error marker. Losing
/// the success-insert race to a concurrent caller surfaces as `AlreadyRan`;
/// the artifact is kept, it is a valid backup of the same day.
pub async fn run_and_record(
    config: &Config,
    ledger: &Ledger,
    now: DateTime<Utc>,
) -> Result<DumpArtifact, BackupError> {
    let tz = config.tz().map_err(BackupError::ConfigurationError)?;
    let now_local = now.with_timezone(&tz);

    match run_dump(config, now_local).await {
        Ok(artifact) => {
            let metadata = serde_json::json!({
                "file": artifact.file_name,
                "sizeBytes": artifact.size_bytes,
            });
            let description = format!(
                "Daily database backup completed successfully ({}, {} bytes)",
                artifact.file_name, artifact.size_bytes
            );
            match ledger.record_success(
                ACTION_DAILY_BACKUP,
                &description,
                Some(&metadata),
                now,
                tz,
            ) {
                Ok(()) => {
                    log::info!(
                        "Daily backup written to {} ({} bytes)",
                        artifact.path.display(),
                        artifact.size_bytes
                    );
                    Ok(artifact)
                }
                Err(crate::ledger::LedgerError::DuplicateSuccess { .. }) => {
                    log::warn!(
                        "Concurrent caller already recorded today's backup; keeping {}",
                        artifact.file_name
                    );
                    Err(BackupError::AlreadyRan)
                }
                Err(e) => Err(BackupError::Ledger(e.to_string())),
            }
        }
        Err(err) => {
            let description = format!("Daily database backup {}: {}", err.ledger_marker(), err);
            if let Err(ledger_err) =
                ledger.record_failure(ACTION_DAILY_BACKUP, &description, None, now, tz)
            {
                log::error!("Failed to record backup failure in ledger: {}", ledger_err);
            }
            log::error!("Daily backup failed: {}. {}", err, err.recovery_suggestion());
            Err(err)
        }
    }
}
