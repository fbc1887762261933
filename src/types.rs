//! Configuration and shared types.
//!
//! Configuration is stored in `~/.clinicvault/config.json` and read once at
//! startup. Every time-of-day computation in the crate goes through the
//! timezone configured here; the host timezone is never consulted.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Configuration stored in ~/.clinicvault/config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Root of the managed storage tree (backups/, archive/, logs/, ...).
    pub storage_root: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub pressure: PressureConfig,
    /// Explicit path to the dump utility. When unset, PATH and the
    /// well-known install locations are searched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dump_utility: Option<String>,
    /// Additional unmanaged directory that may hold backup files
    /// (pre-migration installs wrote dumps to an ad-hoc path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_backup_dir: Option<String>,
    #[serde(default = "default_dump_timeout_secs")]
    pub dump_timeout_secs: u64,
}

/// Connection parameters for the EMR database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Database name. Must be non-empty for a dump to run.
    #[serde(default)]
    pub name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            username: default_db_username(),
            password: String::new(),
            name: String::new(),
        }
    }
}

fn default_db_host() -> String {
    "127.0.0.1".to_string()
}

fn default_db_port() -> u16 {
    3306
}

fn default_db_username() -> String {
    "root".to_string()
}

/// Daily trigger window configuration.
///
/// The window is deliberately narrow: the policy is consulted from several
/// uncoordinated call sites, and a short window plus the ledger idempotency
/// check is what keeps concurrent callers from double-firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Local time of day the window opens, "HH:MM".
    #[serde(default = "default_trigger_start")]
    pub start: String,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// IANA timezone name all trigger math is evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// How many hours past the window start the dashboard-load check still
    /// considers the day's backup "due".
    #[serde(default = "default_catch_up_hours")]
    pub catch_up_hours: u32,
    /// Minimum seconds between request-path checks (sentinel throttle).
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Fraction of requests that re-check even inside the throttle interval.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start: default_trigger_start(),
            grace_secs: default_grace_secs(),
            timezone: default_timezone(),
            catch_up_hours: default_catch_up_hours(),
            check_interval_secs: default_check_interval_secs(),
            sample_rate: default_sample_rate(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_trigger_start() -> String {
    "23:50".to_string()
}

fn default_grace_secs() -> u64 {
    60
}

fn default_timezone() -> String {
    "Asia/Manila".to_string()
}

fn default_catch_up_hours() -> u32 {
    6
}

fn default_check_interval_secs() -> u64 {
    300
}

fn default_sample_rate() -> f64 {
    0.2
}

fn default_dump_timeout_secs() -> u64 {
    900
}

/// Retention and age limits used by the cleanup tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfig {
    /// Tier 1 keeps this many of the newest `.sql` artifacts.
    #[serde(default = "default_keep_count")]
    pub keep_count: usize,
    #[serde(default = "default_log_max_age_days")]
    pub log_max_age_days: u32,
    #[serde(default = "default_session_max_age_days")]
    pub session_max_age_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_count: default_keep_count(),
            log_max_age_days: default_log_max_age_days(),
            session_max_age_days: default_session_max_age_days(),
        }
    }
}

fn default_keep_count() -> usize {
    2
}

fn default_log_max_age_days() -> u32 {
    3
}

fn default_session_max_age_days() -> u32 {
    1
}

/// Disk pressure thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressureConfig {
    /// Below this many free bytes the pre-flight guard escalates to Tier 2.
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,
    /// Above this used percentage the pre-flight guard escalates to Tier 2.
    #[serde(default = "default_max_used_percent")]
    pub max_used_percent: f64,
    /// Below this many free bytes the pressure level is Warning.
    #[serde(default = "default_warning_free_bytes")]
    pub warning_free_bytes: u64,
    /// Absolute floor: if free space is still below this after an emergency
    /// cleanup, the operator is told the host itself needs attention.
    #[serde(default = "default_emergency_floor_bytes")]
    pub emergency_floor_bytes: u64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            min_free_bytes: default_min_free_bytes(),
            max_used_percent: default_max_used_percent(),
            warning_free_bytes: default_warning_free_bytes(),
            emergency_floor_bytes: default_emergency_floor_bytes(),
        }
    }
}

fn default_min_free_bytes() -> u64 {
    200 * 1024 * 1024
}

fn default_max_used_percent() -> f64 {
    95.0
}

fn default_warning_free_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_emergency_floor_bytes() -> u64 {
    100 * 1024 * 1024
}

impl Config {
    /// Primary managed backup directory.
    pub fn backup_dir(&self) -> PathBuf {
        Path::new(&self.storage_root).join("backups")
    }

    /// Secondary directory holding archives from the legacy layout.
    pub fn archive_dir(&self) -> PathBuf {
        Path::new(&self.storage_root).join("archive")
    }

    pub fn logs_dir(&self) -> PathBuf {
        Path::new(&self.storage_root).join("logs")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        Path::new(&self.storage_root).join("sessions")
    }

    /// Transient directories whose contents are expendable.
    pub fn transient_dirs(&self) -> Vec<PathBuf> {
        vec![
            Path::new(&self.storage_root).join("tmp"),
            Path::new(&self.storage_root).join("cache"),
        ]
    }

    /// Derived-cache directories cleared by the aggressive tier.
    pub fn cache_dirs(&self) -> Vec<PathBuf> {
        vec![Path::new(&self.storage_root).join("cache")]
    }

    /// Sentinel file recording the last request-path trigger check.
    pub fn sentinel_path(&self) -> PathBuf {
        Path::new(&self.storage_root).join(".last_backup_check")
    }

    /// Parse the configured trigger timezone.
    pub fn tz(&self) -> Result<Tz, String> {
        Tz::from_str(&self.trigger.timezone)
            .map_err(|_| format!("Invalid timezone: {}", self.trigger.timezone))
    }
}

/// Which call site asked for a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    /// The daemon's scheduled tick.
    Scheduled,
    /// The request-sampling fallback path.
    Request,
    /// An operator opening the backup dashboard.
    Dashboard,
    /// An operator running the CLI by hand.
    Manual,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Scheduled => "scheduled",
            TriggerSource::Request => "request",
            TriggerSource::Dashboard => "dashboard",
            TriggerSource::Manual => "manual",
        }
    }
}

/// Get the canonical config file path (~/.clinicvault/config.json)
pub fn config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".clinicvault").join("config.json"))
}

/// Load configuration from ~/.clinicvault/config.json
pub fn load_config() -> Result<Config, String> {
    let path = config_path()?;

    if !path.exists() {
        return Err(format!(
            "Config file not found at {}. Create it with: {{ \"storageRoot\": \"/var/lib/clinicvault\", \"database\": {{ \"name\": \"emr\" }} }}",
            path.display()
        ));
    }

    let content =
        std::fs::read_to_string(&path).map_err(|e| format!("Failed to read config: {}", e))?;

    let config: Config =
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;

    // Validate the timezone up front so every later caller can rely on it
    config.tz()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_minimal_json() {
        let config: Config = serde_json::from_str(
            r#"{"storageRoot": "/var/lib/clinicvault", "database": {"name": "emr"}}"#,
        )
        .unwrap();

        assert_eq!(config.database.name, "emr");
        assert_eq!(config.database.host, "127.0.0.1");
        assert_eq!(config.database.port, 3306);
        assert_eq!(config.trigger.start, "23:50");
        assert_eq!(config.trigger.grace_secs, 60);
        assert_eq!(config.retention.keep_count, 2);
        assert_eq!(config.dump_timeout_secs, 900);
    }

    #[test]
    fn test_config_paths_derive_from_root() {
        let config: Config =
            serde_json::from_str(r#"{"storageRoot": "/data/emr"}"#).unwrap();

        assert_eq!(config.backup_dir(), PathBuf::from("/data/emr/backups"));
        assert_eq!(config.archive_dir(), PathBuf::from("/data/emr/archive"));
        assert_eq!(config.logs_dir(), PathBuf::from("/data/emr/logs"));
        assert_eq!(
            config.sentinel_path(),
            PathBuf::from("/data/emr/.last_backup_check")
        );
    }

    #[test]
    fn test_config_valid_timezone() {
        let config: Config =
            serde_json::from_str(r#"{"storageRoot": "/data/emr"}"#).unwrap();
        assert!(config.tz().is_ok());
    }

    #[test]
    fn test_config_invalid_timezone_rejected() {
        let config: Config = serde_json::from_str(
            r#"{"storageRoot": "/data/emr", "trigger": {"timezone": "Not/AZone"}}"#,
        )
        .unwrap();
        assert!(config.tz().is_err());
    }

    #[test]
    fn test_pressure_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"storageRoot": "/data/emr"}"#).unwrap();
        assert_eq!(config.pressure.min_free_bytes, 200 * 1024 * 1024);
        assert!((config.pressure.max_used_percent - 95.0).abs() < f64::EPSILON);
    }
}
