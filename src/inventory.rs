//! Backup inventory.
//!
//! Enumerates backup artifacts across the storage roots and normalizes them
//! into one record shape for reporting and for the retention tiers. A root
//! that does not exist is an empty set, not an error: fresh installs and
//! legacy layouts both show up as "no backups there yet".

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::Config;

/// File extensions that count as backup artifacts.
const ARTIFACT_EXTENSIONS: &[&str] = &["sql", "zip"];

/// Which storage root an artifact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupLocation {
    /// The managed backup directory.
    Primary,
    /// The legacy archive directory.
    Archive,
    /// The configured raw filesystem path, if any.
    Raw,
}

impl BackupLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupLocation::Primary => "primary",
            BackupLocation::Archive => "archive",
            BackupLocation::Raw => "raw",
        }
    }
}

/// One backup file on disk.
///
/// Identity is the full path; two roots may each hold an artifact with the
/// same basename and both are listed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupArtifact {
    pub name: String,
    pub size_bytes: u64,
    /// Derived from the filesystem modification time.
    pub created_at: DateTime<Utc>,
    pub location: BackupLocation,
    pub path: PathBuf,
}

/// List every artifact across all configured roots, newest first.
pub fn list_backups(config: &Config) -> Vec<BackupArtifact> {
    let mut artifacts = Vec::new();

    artifacts.extend(scan_root(&config.backup_dir(), BackupLocation::Primary));
    artifacts.extend(scan_root(&config.archive_dir(), BackupLocation::Archive));
    if let Some(raw) = &config.raw_backup_dir {
        artifacts.extend(scan_root(Path::new(raw), BackupLocation::Raw));
    }

    artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    artifacts
}

/// Scan one root for artifacts. Missing root, unreadable entries, and
/// non-artifact files are all skipped silently.
pub fn scan_root(dir: &Path, location: BackupLocation) -> Vec<BackupArtifact> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };

    let mut artifacts = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let is_artifact = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| ARTIFACT_EXTENSIONS.contains(&e))
            .unwrap_or(false);
        if !is_artifact {
            continue;
        }

        let meta = match path.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let created_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };

        artifacts.push(BackupArtifact {
            name,
            size_bytes: meta.len(),
            created_at,
            location,
            path,
        });
    }

    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backdate(path: &Path, secs_ago: u64) {
        let t = std::time::SystemTime::now() - std::time::Duration::from_secs(secs_ago);
        filetime::set_file_mtime(path, filetime::FileTime::from_system_time(t)).unwrap();
    }

    fn test_config(root: &Path) -> Config {
        serde_json::from_value(serde_json::json!({
            "storageRoot": root.to_string_lossy(),
        }))
        .unwrap()
    }

    #[test]
    fn test_missing_root_is_empty_not_error() {
        let artifacts = scan_root(Path::new("/nonexistent/backups"), BackupLocation::Primary);
        assert!(artifacts.is_empty());
    }

    #[test]
    fn test_list_backups_all_roots_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir.path().join("fresh-install"));
        assert!(list_backups(&config).is_empty());
    }

    #[test]
    fn test_newest_first_across_roots() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        std::fs::create_dir_all(config.backup_dir()).unwrap();
        std::fs::create_dir_all(config.archive_dir()).unwrap();

        let old = config.backup_dir().join("database_backup_old.sql");
        let newer = config.archive_dir().join("full_backup_newer.zip");
        std::fs::write(&old, "old dump").unwrap();
        std::fs::write(&newer, "newer archive").unwrap();
        backdate(&old, 3600);
        backdate(&newer, 60);

        let artifacts = list_backups(&config);
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].name, "full_backup_newer.zip");
        assert_eq!(artifacts[0].location, BackupLocation::Archive);
        assert_eq!(artifacts[1].name, "database_backup_old.sql");
        assert_eq!(artifacts[1].location, BackupLocation::Primary);
    }

    #[test]
    fn test_non_artifact_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(config.backup_dir()).unwrap();

        std::fs::write(config.backup_dir().join("notes.txt"), "x").unwrap();
        std::fs::write(config.backup_dir().join("dump.sql"), "y").unwrap();
        std::fs::write(config.backup_dir().join(".last_backup_check"), "123").unwrap();

        let artifacts = list_backups(&config);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "dump.sql");
        assert_eq!(artifacts[0].size_bytes, 1);
    }

    #[test]
    fn test_same_basename_in_two_roots_both_listed() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(config.backup_dir()).unwrap();
        std::fs::create_dir_all(config.archive_dir()).unwrap();

        std::fs::write(config.backup_dir().join("dump.sql"), "a").unwrap();
        std::fs::write(config.archive_dir().join("dump.sql"), "bb").unwrap();

        let artifacts = list_backups(&config);
        assert_eq!(artifacts.len(), 2);
        // No cross-root dedup: paths differ, both survive
        assert_ne!(artifacts[0].path, artifacts[1].path);
    }

    #[test]
    fn test_raw_root_included_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("old-dumps");
        std::fs::create_dir_all(&raw).unwrap();
        std::fs::write(raw.join("legacy.sql"), "legacy").unwrap();

        let config: Config = serde_json::from_value(serde_json::json!({
            "storageRoot": dir.path().join("managed").to_string_lossy(),
            "rawBackupDir": raw.to_string_lossy(),
        }))
        .unwrap();

        let artifacts = list_backups(&config);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].location, BackupLocation::Raw);
    }
}
