//! Storage pressure probing and the escalating cleanup tiers.
//!
//! Three tiers, each idempotent and safe to re-run:
//! - Tier 1 (standard): keep the newest N dumps, sweep stale partials.
//! - Tier 2 (aggressive): delete every artifact and clear derived caches.
//!   Runs automatically as a pre-flight guard when disk pressure is critical.
//! - Tier 3 (emergency): operator-confirmed. Tier 2 plus old logs, transient
//!   directories, and stale sessions, then a free-space re-check.
//!
//! A failed deletion is recorded and skipped; the rest of the batch runs.

use std::path::Path;

use serde::Serialize;

use crate::inventory::{scan_root, BackupLocation};
use crate::types::{Config, PressureConfig};

/// Snapshot of the filesystem hosting the storage root.
#[derive(Debug, Clone, Copy)]
pub struct DiskSpace {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl DiskSpace {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.free_bytes);
        (used as f64 / self.total_bytes as f64) * 100.0
    }
}

/// Source of disk statistics. Production uses statvfs; tests and the
/// threshold logic get fixed values injected.
pub trait DiskUsage {
    fn usage(&self, path: &Path) -> Result<DiskSpace, String>;
}

/// statvfs-backed probe of the real filesystem.
pub struct SystemDiskUsage;

#[cfg(unix)]
impl DiskUsage for SystemDiskUsage {
    fn usage(&self, path: &Path) -> Result<DiskSpace, String> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| format!("Path contains NUL: {}", path.display()))?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(format!(
                "statvfs({}) failed: {}",
                path.display(),
                std::io::Error::last_os_error()
            ));
        }

        let frsize = stat.f_frsize as u64;
        Ok(DiskSpace {
            free_bytes: stat.f_bavail as u64 * frsize,
            total_bytes: stat.f_blocks as u64 * frsize,
        })
    }
}

#[cfg(not(unix))]
impl DiskUsage for SystemDiskUsage {
    fn usage(&self, _path: &Path) -> Result<DiskSpace, String> {
        Err("Disk statistics are not supported on this platform".to_string())
    }
}

/// Fixed-value provider for tests and simulated pressure checks.
pub struct FixedDiskUsage(pub DiskSpace);

impl DiskUsage for FixedDiskUsage {
    fn usage(&self, _path: &Path) -> Result<DiskSpace, String> {
        Ok(self.0)
    }
}

/// Disk pressure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoragePressure {
    Healthy,
    Warning,
    Critical,
}

impl StoragePressure {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoragePressure::Healthy => "healthy",
            StoragePressure::Warning => "warning",
            StoragePressure::Critical => "critical",
        }
    }
}

/// Classify raw disk numbers against the configured thresholds.
pub fn classify_pressure(space: DiskSpace, thresholds: &PressureConfig) -> StoragePressure {
    if space.free_bytes < thresholds.min_free_bytes
        || space.used_percent() > thresholds.max_used_percent
    {
        return StoragePressure::Critical;
    }
    if space.free_bytes < thresholds.warning_free_bytes {
        return StoragePressure::Warning;
    }
    StoragePressure::Healthy
}

/// Pre-flight guard: should an aggressive cleanup run before writing a new
/// full backup?
pub fn needs_aggressive_cleanup(space: DiskSpace, thresholds: &PressureConfig) -> bool {
    classify_pressure(space, thresholds) == StoragePressure::Critical
}

/// Overall health for the reporting surface. Distinct ladder from raw disk
/// pressure: a full disk or a stale backup history both degrade health.
pub fn classify_health(
    pressure: StoragePressure,
    days_since_last_success: Option<i64>,
) -> StoragePressure {
    match (pressure, days_since_last_success) {
        (StoragePressure::Critical, _) => StoragePressure::Critical,
        (_, Some(days)) if days >= 3 => StoragePressure::Critical,
        (StoragePressure::Warning, _) => StoragePressure::Warning,
        (_, Some(days)) if days >= 1 => StoragePressure::Warning,
        // No successful backup recorded yet
        (_, None) => StoragePressure::Warning,
        _ => StoragePressure::Healthy,
    }
}

/// What a cleanup pass actually did.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOutcome {
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
}

impl CleanupOutcome {
    fn absorb(&mut self, other: CleanupOutcome) {
        self.files_deleted += other.files_deleted;
        self.bytes_freed += other.bytes_freed;
        self.errors.extend(other.errors);
    }
}

/// Result of the emergency tier, including the post-cleanup space re-check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyReport {
    pub outcome: CleanupOutcome,
    pub free_bytes_after: Option<u64>,
    /// Free space is still below the absolute floor after everything this
    /// tier can do; the host itself needs operator attention.
    pub still_critical: bool,
}

/// Delete one file, folding the result into the outcome.
fn delete_file(path: &Path, outcome: &mut CleanupOutcome) {
    let size = path.metadata().map(|m| m.len()).unwrap_or(0);
    match std::fs::remove_file(path) {
        Ok(()) => {
            outcome.files_deleted += 1;
            outcome.bytes_freed += size;
        }
        Err(e) => {
            log::warn!("Failed to delete {}: {}", path.display(), e);
            outcome.errors.push(format!("{}: {}", path.display(), e));
        }
    }
}

/// Tier 1 — standard retention.
///
/// Keeps the `keep_count` most recently modified `.sql` dumps in the primary
/// directory and deletes the rest, oldest first. Also sweeps stale partials
/// (`.tmp` files and leftover write probes) the dump path may have abandoned.
pub fn tier1_standard_retention(config: &Config) -> CleanupOutcome {
    let mut outcome = CleanupOutcome::default();
    let backup_dir = config.backup_dir();

    let mut dumps: Vec<_> = scan_root(&backup_dir, BackupLocation::Primary)
        .into_iter()
        .filter(|a| a.name.ends_with(".sql"))
        .collect();
    // Newest first; everything past keep_count goes
    dumps.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    for stale in dumps.iter().skip(config.retention.keep_count).rev() {
        delete_file(&stale.path, &mut outcome);
    }

    outcome.absorb(sweep_partials(&backup_dir));

    if outcome.files_deleted > 0 {
        log::info!(
            "Standard retention: deleted {} files, freed {} bytes",
            outcome.files_deleted,
            outcome.bytes_freed
        );
    }
    outcome
}

/// Remove abandoned transfer leftovers from a directory.
fn sweep_partials(dir: &Path) -> CleanupOutcome {
    let mut outcome = CleanupOutcome::default();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return outcome,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".tmp") || name.starts_with(".write_probe") {
            delete_file(&path, &mut outcome);
        }
    }
    outcome
}

/// Tier 2 — aggressive cleanup.
///
/// Deletes every artifact in the primary directory (not just beyond the
/// retention count) and clears the derived cache directories. Invoked
/// automatically when disk pressure is critical.
pub fn tier2_aggressive_cleanup(config: &Config) -> CleanupOutcome {
    let mut outcome = CleanupOutcome::default();

    for artifact in scan_root(&config.backup_dir(), BackupLocation::Primary) {
        delete_file(&artifact.path, &mut outcome);
    }
    outcome.absorb(sweep_partials(&config.backup_dir()));

    for cache_dir in config.cache_dirs() {
        outcome.absorb(clear_dir_contents(&cache_dir));
    }

    log::info!(
        "Aggressive cleanup: deleted {} files, freed {} bytes ({} errors)",
        outcome.files_deleted,
        outcome.bytes_freed,
        outcome.errors.len()
    );
    outcome
}

/// Tier 3 — emergency cleanup.
///
/// The caller is responsible for operator confirmation before invoking this.
/// Performs the aggressive tier, then removes logs older than the configured
/// age, empties the transient directories outright, removes stale session
/// files, and re-checks free space against the absolute floor.
pub fn tier3_emergency_cleanup(config: &Config, disk: &dyn DiskUsage) -> EmergencyReport {
    let mut outcome = tier2_aggressive_cleanup(config);

    outcome.absorb(prune_older_than(
        &config.logs_dir(),
        config.retention.log_max_age_days,
    ));

    for dir in config.transient_dirs() {
        outcome.absorb(clear_dir_contents(&dir));
    }

    outcome.absorb(prune_older_than(
        &config.sessions_dir(),
        config.retention.session_max_age_days,
    ));

    let free_bytes_after = match disk.usage(Path::new(&config.storage_root)) {
        Ok(space) => Some(space.free_bytes),
        Err(e) => {
            log::warn!("Free space re-check failed: {}", e);
            None
        }
    };

    let still_critical = free_bytes_after
        .map(|free| free < config.pressure.emergency_floor_bytes)
        .unwrap_or(false);

    if still_critical {
        log::error!(
            "Emergency cleanup finished but free space is still below {} bytes",
            config.pressure.emergency_floor_bytes
        );
    }

    EmergencyReport {
        outcome,
        free_bytes_after,
        still_critical,
    }
}

/// Delete files in `dir` whose modification time is older than `max_age_days`.
fn prune_older_than(dir: &Path, max_age_days: u32) -> CleanupOutcome {
    let mut outcome = CleanupOutcome::default();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return outcome,
    };

    let cutoff =
        std::time::SystemTime::now() - std::time::Duration::from_secs(max_age_days as u64 * 86400);

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let mtime = match path.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };
        if mtime < cutoff {
            delete_file(&path, &mut outcome);
        }
    }
    outcome
}

/// Remove everything inside `dir`, keeping the directory itself.
fn clear_dir_contents(dir: &Path) -> CleanupOutcome {
    let mut outcome = CleanupOutcome::default();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return outcome,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => outcome.files_deleted += 1,
                Err(e) => {
                    log::warn!("Failed to delete {}: {}", path.display(), e);
                    outcome.errors.push(format!("{}: {}", path.display(), e));
                }
            }
        } else {
            delete_file(&path, &mut outcome);
        }
    }
    outcome
}

/// Human-readable byte count for logs and the CLI.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * MB;

    fn test_config(root: &Path) -> Config {
        serde_json::from_value(serde_json::json!({
            "storageRoot": root.to_string_lossy(),
        }))
        .unwrap()
    }

    fn backdate(path: &Path, secs_ago: u64) {
        let t = std::time::SystemTime::now() - std::time::Duration::from_secs(secs_ago);
        filetime::set_file_mtime(path, filetime::FileTime::from_system_time(t)).unwrap();
    }

    #[test]
    fn test_pressure_critical_at_150mb_of_10gb() {
        let space = DiskSpace {
            free_bytes: 150 * MB,
            total_bytes: 10 * GB,
        };
        let thresholds = PressureConfig::default();
        assert_eq!(
            classify_pressure(space, &thresholds),
            StoragePressure::Critical
        );
        assert!(needs_aggressive_cleanup(space, &thresholds));
    }

    #[test]
    fn test_pressure_healthy_at_5gb_of_10gb() {
        let space = DiskSpace {
            free_bytes: 5 * GB,
            total_bytes: 10 * GB,
        };
        let thresholds = PressureConfig::default();
        assert_eq!(
            classify_pressure(space, &thresholds),
            StoragePressure::Healthy
        );
        assert!(!needs_aggressive_cleanup(space, &thresholds));
    }

    #[test]
    fn test_pressure_used_percent_alone_escalates() {
        // Plenty of absolute bytes free on a huge volume, but > 95% used
        let space = DiskSpace {
            free_bytes: 400 * MB,
            total_bytes: 100 * GB,
        };
        let thresholds = PressureConfig::default();
        assert!(space.used_percent() > 95.0);
        assert_eq!(
            classify_pressure(space, &thresholds),
            StoragePressure::Critical
        );
    }

    #[test]
    fn test_pressure_warning_band() {
        let space = DiskSpace {
            free_bytes: 512 * MB,
            total_bytes: 10 * GB,
        };
        assert_eq!(
            classify_pressure(space, &PressureConfig::default()),
            StoragePressure::Warning
        );
    }

    #[test]
    fn test_health_ladder_combines_staleness() {
        assert_eq!(
            classify_health(StoragePressure::Healthy, Some(0)),
            StoragePressure::Healthy
        );
        assert_eq!(
            classify_health(StoragePressure::Healthy, Some(1)),
            StoragePressure::Warning
        );
        assert_eq!(
            classify_health(StoragePressure::Healthy, Some(3)),
            StoragePressure::Critical
        );
        assert_eq!(
            classify_health(StoragePressure::Healthy, None),
            StoragePressure::Warning
        );
        assert_eq!(
            classify_health(StoragePressure::Critical, Some(0)),
            StoragePressure::Critical
        );
    }

    #[test]
    fn test_tier1_keeps_newest_two() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let backup_dir = config.backup_dir();
        std::fs::create_dir_all(&backup_dir).unwrap();

        // Five dumps with distinct ages; contents sized 10/20/30/40/50 bytes
        let mut expected_freed = 0u64;
        for (i, age_hours) in [50u64, 40, 30, 20, 10].iter().enumerate() {
            let path = backup_dir.join(format!("database_backup_{}.sql", i));
            let body = vec![b'x'; (i + 1) * 10];
            std::fs::write(&path, &body).unwrap();
            backdate(&path, age_hours * 3600);
            // The three oldest (ages 50h, 40h, 30h → sizes 10, 20, 30) go
            if *age_hours >= 30 {
                expected_freed += body.len() as u64;
            }
        }

        let outcome = tier1_standard_retention(&config);

        assert_eq!(outcome.files_deleted, 3);
        assert_eq!(outcome.bytes_freed, expected_freed);
        assert!(outcome.errors.is_empty());

        let remaining: Vec<_> = std::fs::read_dir(&backup_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&"database_backup_3.sql".to_string()));
        assert!(remaining.contains(&"database_backup_4.sql".to_string()));
    }

    #[test]
    fn test_tier1_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(config.backup_dir()).unwrap();

        for i in 0..4 {
            let path = config.backup_dir().join(format!("b{}.sql", i));
            std::fs::write(&path, "dump").unwrap();
            backdate(&path, (i as u64 + 1) * 3600);
        }

        let first = tier1_standard_retention(&config);
        assert_eq!(first.files_deleted, 2);

        let second = tier1_standard_retention(&config);
        assert_eq!(second.files_deleted, 0);
    }

    #[test]
    fn test_tier1_sweeps_partials_but_not_archives() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(config.backup_dir()).unwrap();

        std::fs::write(config.backup_dir().join("current.sql"), "dump").unwrap();
        std::fs::write(config.backup_dir().join("transfer.tmp"), "partial").unwrap();
        std::fs::write(config.backup_dir().join("full_backup.zip"), "archive").unwrap();

        let outcome = tier1_standard_retention(&config);

        assert_eq!(outcome.files_deleted, 1);
        assert!(!config.backup_dir().join("transfer.tmp").exists());
        assert!(config.backup_dir().join("current.sql").exists());
        // Zip archives are not subject to the sql retention count
        assert!(config.backup_dir().join("full_backup.zip").exists());
    }

    #[test]
    fn test_tier2_deletes_everything_and_clears_caches() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(config.backup_dir()).unwrap();
        let cache = &config.cache_dirs()[0];
        std::fs::create_dir_all(cache).unwrap();

        std::fs::write(config.backup_dir().join("a.sql"), "a").unwrap();
        std::fs::write(config.backup_dir().join("b.zip"), "bb").unwrap();
        std::fs::write(cache.join("views.cache"), "compiled").unwrap();
        std::fs::create_dir_all(cache.join("routes")).unwrap();
        std::fs::write(cache.join("routes").join("map.bin"), "routes").unwrap();

        let outcome = tier2_aggressive_cleanup(&config);

        assert!(outcome.errors.is_empty());
        assert!(scan_root(&config.backup_dir(), BackupLocation::Primary).is_empty());
        assert!(std::fs::read_dir(cache).unwrap().next().is_none());
        assert!(outcome.files_deleted >= 4);
    }

    #[test]
    fn test_tier3_prunes_by_age_and_rechecks_space() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let logs = config.logs_dir();
        let sessions = config.sessions_dir();
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::create_dir_all(&sessions).unwrap();
        std::fs::create_dir_all(config.backup_dir()).unwrap();
        for t in config.transient_dirs() {
            std::fs::create_dir_all(&t).unwrap();
        }

        let old_log = logs.join("emr-2025-02-20.log");
        let new_log = logs.join("emr-2025-03-01.log");
        std::fs::write(&old_log, "old").unwrap();
        std::fs::write(&new_log, "new").unwrap();
        backdate(&old_log, 5 * 86400);

        let old_session = sessions.join("sess_abc");
        let new_session = sessions.join("sess_def");
        std::fs::write(&old_session, "s").unwrap();
        std::fs::write(&new_session, "s").unwrap();
        backdate(&old_session, 2 * 86400);

        let tmp_file = config.transient_dirs()[0].join("scratch.bin");
        std::fs::write(&tmp_file, "scratch").unwrap();

        let disk = FixedDiskUsage(DiskSpace {
            free_bytes: 2 * GB,
            total_bytes: 10 * GB,
        });
        let report = tier3_emergency_cleanup(&config, &disk);

        assert!(!old_log.exists());
        assert!(new_log.exists(), "logs within the age limit are kept");
        assert!(!old_session.exists());
        assert!(new_session.exists());
        assert!(!tmp_file.exists(), "transient files go unconditionally");
        assert_eq!(report.free_bytes_after, Some(2 * GB));
        assert!(!report.still_critical);
    }

    #[test]
    fn test_tier3_flags_still_critical() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let disk = FixedDiskUsage(DiskSpace {
            free_bytes: 50 * MB,
            total_bytes: 10 * GB,
        });
        let report = tier3_emergency_cleanup(&config, &disk);
        assert!(report.still_critical);
    }

    #[cfg(unix)]
    #[test]
    fn test_delete_failure_does_not_abort_batch() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        // Read-only logs dir: pruning its old log fails per-file
        let logs = config.logs_dir();
        std::fs::create_dir_all(&logs).unwrap();
        let stuck_log = logs.join("stuck.log");
        std::fs::write(&stuck_log, "old").unwrap();
        backdate(&stuck_log, 10 * 86400);
        std::fs::set_permissions(&logs, std::fs::Permissions::from_mode(0o555)).unwrap();

        // A deletable artifact elsewhere in the batch
        std::fs::create_dir_all(config.backup_dir()).unwrap();
        std::fs::write(config.backup_dir().join("plain.sql"), "x").unwrap();

        let disk = FixedDiskUsage(DiskSpace {
            free_bytes: 2 * GB,
            total_bytes: 10 * GB,
        });
        let report = tier3_emergency_cleanup(&config, &disk);

        // Restore permissions so the tempdir can be removed
        std::fs::set_permissions(&logs, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(report.outcome.errors.len(), 1);
        assert!(report.outcome.errors[0].contains("stuck.log"));
        assert!(!config.backup_dir().join("plain.sql").exists());
        assert!(report.outcome.files_deleted >= 1);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(200 * MB), "200.0 MB");
    }
}
