//! Operator-invoked full backup.
//!
//! Runs a fresh dump and bundles it with a manifest into a zip archive in
//! the primary backup directory. Before writing anything, free space is
//! checked against the pressure thresholds; critical pressure runs the
//! aggressive cleanup tier first so the new archive has room to land.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::dump;
use crate::error::BackupError;
use crate::ledger::{Ledger, ACTION_FULL_BACKUP};
use crate::storage::{self, DiskUsage};
use crate::types::Config;

/// A completed full-backup archive.
#[derive(Debug, Clone)]
pub struct ArchiveResult {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Whether the pre-flight guard had to run the aggressive tier.
    pub cleanup_ran: bool,
}

/// Create a full backup archive, recording the attempt under its own
/// ledger action so it never consumes the daily trigger's success slot.
pub async fn create_full_archive(
    config: &Config,
    ledger: &Ledger,
    disk: &dyn DiskUsage,
    now: DateTime<Utc>,
) -> Result<ArchiveResult, BackupError> {
    let tz = config.tz().map_err(BackupError::ConfigurationError)?;

    // Pre-flight guard
    let mut cleanup_ran = false;
    match disk.usage(Path::new(&config.storage_root)) {
        Ok(space) => {
            if storage::needs_aggressive_cleanup(space, &config.pressure) {
                log::warn!(
                    "Disk pressure critical ({} free of {}), running aggressive cleanup before full backup",
                    storage::format_bytes(space.free_bytes),
                    storage::format_bytes(space.total_bytes)
                );
                let outcome = storage::tier2_aggressive_cleanup(config);
                log::info!(
                    "Pre-flight cleanup freed {}",
                    storage::format_bytes(outcome.bytes_freed)
                );
                cleanup_ran = true;
            }
        }
        Err(e) => {
            log::warn!("Disk pressure check failed, proceeding without guard: {}", e);
        }
    }

    let result = build_archive(config, now).await;

    match &result {
        Ok(archive) => {
            let metadata = serde_json::json!({
                "file": archive.path.file_name().and_then(|n| n.to_str()),
                "sizeBytes": archive.size_bytes,
            });
            let description = format!(
                "Full backup completed successfully ({} bytes)",
                archive.size_bytes
            );
            if let Err(e) =
                ledger.record_success(ACTION_FULL_BACKUP, &description, Some(&metadata), now, tz)
            {
                log::error!("Failed to record full backup in ledger: {}", e);
            }
        }
        Err(err) => {
            let description = format!("Full backup {}: {}", err.ledger_marker(), err);
            if let Err(e) = ledger.record_failure(ACTION_FULL_BACKUP, &description, None, now, tz) {
                log::error!("Failed to record full backup failure in ledger: {}", e);
            }
        }
    }

    result.map(|mut archive| {
        archive.cleanup_ran = cleanup_ran;
        archive
    })
}

async fn build_archive(config: &Config, now: DateTime<Utc>) -> Result<ArchiveResult, BackupError> {
    let tz = config.tz().map_err(BackupError::ConfigurationError)?;
    let now_local = now.with_timezone(&tz);

    let artifact = dump::run_dump(config, now_local).await?;

    let zip_name = format!("full_backup_{}.zip", now_local.format("%Y-%m-%d_%H-%M-%S"));
    let zip_path = config.backup_dir().join(&zip_name);

    let file = std::fs::File::create(&zip_path)
        .map_err(|e| BackupError::IoError(format!("Failed to create {}: {}", zip_path.display(), e)))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let dump_bytes = std::fs::read(&artifact.path)
        .map_err(|e| BackupError::IoError(format!("Failed to read dump: {}", e)))?;

    zip.start_file(artifact.file_name.as_str(), options)
        .map_err(|e| BackupError::IoError(format!("Zip write failed: {}", e)))?;
    zip.write_all(&dump_bytes)
        .map_err(|e| BackupError::IoError(format!("Zip write failed: {}", e)))?;

    let manifest = serde_json::json!({
        "database": config.database.name,
        "dumpFile": artifact.file_name,
        "dumpSizeBytes": artifact.size_bytes,
        "createdAt": now.to_rfc3339(),
    });
    zip.start_file("manifest.json", options)
        .map_err(|e| BackupError::IoError(format!("Zip write failed: {}", e)))?;
    zip.write_all(manifest.to_string().as_bytes())
        .map_err(|e| BackupError::IoError(format!("Zip write failed: {}", e)))?;

    zip.finish()
        .map_err(|e| BackupError::IoError(format!("Zip finalize failed: {}", e)))?;

    // The zip now carries the dump; drop the loose copy so retention
    // accounting only sees one artifact for this backup
    if let Err(e) = std::fs::remove_file(&artifact.path) {
        log::warn!(
            "Could not remove dump after archiving {}: {}",
            artifact.path.display(),
            e
        );
    }

    let size_bytes = std::fs::metadata(&zip_path).map(|m| m.len()).unwrap_or(0);
    log::info!("Full backup archive written to {}", zip_path.display());

    Ok(ArchiveResult {
        path: zip_path,
        size_bytes,
        cleanup_ran: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DiskSpace, FixedDiskUsage};
    use chrono::TimeZone;

    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * MB;

    #[cfg(unix)]
    fn setup(dir: &Path) -> (Config, Ledger) {
        use std::os::unix::fs::PermissionsExt;

        let utility = dir.join("fake_mysqldump");
        std::fs::write(&utility, "#!/bin/sh\necho \"-- MySQL dump\"\n").unwrap();
        std::fs::set_permissions(&utility, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config: Config = serde_json::from_value(serde_json::json!({
            "storageRoot": dir.to_string_lossy(),
            "database": {"name": "emr"},
            "dumpUtility": utility.to_string_lossy(),
        }))
        .unwrap();
        let ledger = Ledger::open_at(dir.join("ledger.db")).unwrap();
        (config, ledger)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_full_archive_zips_dump_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (config, ledger) = setup(dir.path());
        let disk = FixedDiskUsage(DiskSpace {
            free_bytes: 5 * GB,
            total_bytes: 10 * GB,
        });
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();

        let archive = create_full_archive(&config, &ledger, &disk, now)
            .await
            .unwrap();

        assert!(archive.path.exists());
        assert!(archive.size_bytes > 0);
        assert!(!archive.cleanup_ran);

        // The loose .sql is gone; only the zip remains
        let names: Vec<_> = std::fs::read_dir(config.backup_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("full_backup_"));
        assert!(names[0].ends_with(".zip"));

        // Full backups use their own action tag
        let entries = ledger.recent_entries(ACTION_FULL_BACKUP, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].succeeded);
        assert!(!ledger
            .has_success_on_day(crate::ledger::ACTION_DAILY_BACKUP, now, config.tz().unwrap())
            .unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_preflight_runs_tier2_under_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let (config, ledger) = setup(dir.path());
        std::fs::create_dir_all(config.backup_dir()).unwrap();
        std::fs::write(config.backup_dir().join("stale.sql"), "old dump").unwrap();

        // 150 MB free of 10 GB: 98.5% used, pre-flight must escalate
        let disk = FixedDiskUsage(DiskSpace {
            free_bytes: 150 * MB,
            total_bytes: 10 * GB,
        });
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();

        let archive = create_full_archive(&config, &ledger, &disk, now)
            .await
            .unwrap();

        assert!(archive.cleanup_ran);
        assert!(!config.backup_dir().join("stale.sql").exists());
        assert!(archive.path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_preflight_skipped_when_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let (config, ledger) = setup(dir.path());
        std::fs::create_dir_all(config.backup_dir()).unwrap();
        std::fs::write(config.backup_dir().join("keep.sql"), "dump").unwrap();

        let disk = FixedDiskUsage(DiskSpace {
            free_bytes: 5 * GB,
            total_bytes: 10 * GB,
        });
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();

        let archive = create_full_archive(&config, &ledger, &disk, now)
            .await
            .unwrap();

        assert!(!archive.cleanup_ran);
        assert!(config.backup_dir().join("keep.sql").exists());
    }

    #[tokio::test]
    async fn test_failed_dump_records_failure_under_full_action() {
        let dir = tempfile::tempdir().unwrap();
        // No database name: the dump fails before spawning anything
        let config: Config = serde_json::from_value(serde_json::json!({
            "storageRoot": dir.path().to_string_lossy(),
        }))
        .unwrap();
        let ledger = Ledger::open_at(dir.path().join("ledger.db")).unwrap();
        let disk = FixedDiskUsage(DiskSpace {
            free_bytes: 5 * GB,
            total_bytes: 10 * GB,
        });
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();

        let result = create_full_archive(&config, &ledger, &disk, now).await;
        assert!(matches!(result, Err(BackupError::DatabaseNameMissing)));

        let entries = ledger.recent_entries(ACTION_FULL_BACKUP, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].succeeded);
        assert!(entries[0].description.contains("failed"));
    }
}
