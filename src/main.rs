//! clinicvault command-line interface.
//!
//! Exit code 0 means success or a deliberate no-op (window not open, backup
//! already taken, operator aborted a confirmation prompt). Exit code 1 means
//! the requested operation failed.

use std::io::Write;

use chrono::Utc;
use clap::{Arg, ArgAction, Command};
use tokio::sync::mpsc;

use clinicvault::archive;
use clinicvault::dispatch::{self, CheckOutcome, QueueWorker, QUEUE_SIZE};
use clinicvault::dump;
use clinicvault::error::BackupError;
use clinicvault::inventory;
use clinicvault::ledger::{Ledger, ACTION_DAILY_BACKUP};
use clinicvault::scheduler::Scheduler;
use clinicvault::storage::{self, DiskUsage, SystemDiskUsage};
use clinicvault::types::{self, Config};

fn cli() -> Command {
    Command::new("clinicvault")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Automatic database backup and storage hygiene for the clinic EMR")
        .subcommand_required(true)
        .subcommand(
            Command::new("daily-database")
                .about("Run the daily database dump once and record it in the ledger"),
        )
        .subcommand(
            Command::new("check-time")
                .about("Evaluate the trigger window and run the daily dump if it is due"),
        )
        .subcommand(
            Command::new("full-backup")
                .about("Create a zipped full backup, cleaning up first if disk pressure is critical"),
        )
        .subcommand(
            Command::new("aggressive-cleanup")
                .about("Delete all backup artifacts and clear derived caches (Tier 2)"),
        )
        .subcommand(
            Command::new("emergency-cleanup")
                .about("Interactive emergency cleanup: Tier 2 plus old logs, transient files and stale sessions")
                .arg(
                    Arg::new("yes")
                        .long("yes")
                        .short('y')
                        .action(ArgAction::SetTrue)
                        .help("Skip the confirmation prompt"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show ledger counters, disk pressure and the backup inventory"),
        )
        .subcommand(
            Command::new("daemon")
                .about("Run the scheduler loop and backup queue worker"),
        )
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = cli().get_matches();

    let config = match types::load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let code = match matches.subcommand() {
        Some(("daily-database", _)) => run_daily_database(&config).await,
        Some(("check-time", _)) => run_check_time(&config).await,
        Some(("full-backup", _)) => run_full_backup(&config).await,
        Some(("aggressive-cleanup", _)) => run_aggressive_cleanup(&config),
        Some(("emergency-cleanup", sub)) => {
            run_emergency_cleanup(&config, sub.get_flag("yes"))
        }
        Some(("status", _)) => run_status(&config),
        Some(("daemon", _)) => run_daemon(config).await,
        _ => unreachable!("subcommand required"),
    };

    std::process::exit(code);
}

fn open_ledger() -> Result<Ledger, i32> {
    Ledger::open().map_err(|e| {
        eprintln!("Error: could not open ledger: {}", e);
        1
    })
}

async fn run_daily_database(config: &Config) -> i32 {
    let ledger = match open_ledger() {
        Ok(l) => l,
        Err(code) => return code,
    };

    match dump::run_and_record(config, &ledger, Utc::now()).await {
        Ok(artifact) => {
            println!(
                "Backup written: {} ({})",
                artifact.path.display(),
                storage::format_bytes(artifact.size_bytes)
            );
            0
        }
        Err(BackupError::AlreadyRan) => {
            println!("Today's backup was already recorded by a concurrent run.");
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Hint: {}", e.recovery_suggestion());
            1
        }
    }
}

async fn run_check_time(config: &Config) -> i32 {
    let ledger = match open_ledger() {
        Ok(l) => l,
        Err(code) => return code,
    };

    match dispatch::check_time_once(config, &ledger, Utc::now()).await {
        Ok(CheckOutcome::Fired(artifact)) => {
            println!(
                "Backup due; written {} ({})",
                artifact.file_name,
                storage::format_bytes(artifact.size_bytes)
            );
            0
        }
        Ok(CheckOutcome::NotDue) => {
            println!("No backup due.");
            0
        }
        Err(BackupError::AlreadyRan) => {
            println!("Today's backup was already recorded by a concurrent run.");
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Hint: {}", e.recovery_suggestion());
            1
        }
    }
}

async fn run_full_backup(config: &Config) -> i32 {
    let ledger = match open_ledger() {
        Ok(l) => l,
        Err(code) => return code,
    };

    match archive::create_full_archive(config, &ledger, &SystemDiskUsage, Utc::now()).await {
        Ok(result) => {
            if result.cleanup_ran {
                println!("Disk pressure was critical; aggressive cleanup ran first.");
            }
            println!(
                "Full backup written: {} ({})",
                result.path.display(),
                storage::format_bytes(result.size_bytes)
            );
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Hint: {}", e.recovery_suggestion());
            1
        }
    }
}

fn run_aggressive_cleanup(config: &Config) -> i32 {
    let outcome = storage::tier2_aggressive_cleanup(config);
    println!(
        "Deleted {} files, freed {}.",
        outcome.files_deleted,
        storage::format_bytes(outcome.bytes_freed)
    );
    for err in &outcome.errors {
        eprintln!("Warning: could not delete {}", err);
    }
    0
}

fn run_emergency_cleanup(config: &Config, assume_yes: bool) -> i32 {
    if !assume_yes {
        print!(
            "This will delete ALL backup artifacts, caches, old logs, transient files \
             and stale sessions under {}. Continue? [y/N] ",
            config.storage_root
        );
        let _ = std::io::stdout().flush();

        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            eprintln!("Error: could not read confirmation");
            return 1;
        }
        let answer = answer.trim().to_lowercase();
        if answer != "y" && answer != "yes" {
            println!("Aborted.");
            return 0;
        }
    }

    let report = storage::tier3_emergency_cleanup(config, &SystemDiskUsage);
    println!(
        "Deleted {} files, freed {}.",
        report.outcome.files_deleted,
        storage::format_bytes(report.outcome.bytes_freed)
    );
    for err in &report.outcome.errors {
        eprintln!("Warning: could not delete {}", err);
    }
    if let Some(free) = report.free_bytes_after {
        println!("Free space now: {}.", storage::format_bytes(free));
    }
    if report.still_critical {
        eprintln!(
            "WARNING: free space is still below {} after cleanup. \
             The host needs more disk or manual intervention.",
            storage::format_bytes(config.pressure.emergency_floor_bytes)
        );
    }
    0
}

fn run_status(config: &Config) -> i32 {
    let ledger = match open_ledger() {
        Ok(l) => l,
        Err(code) => return code,
    };

    let now = Utc::now();
    match ledger.report(ACTION_DAILY_BACKUP, now) {
        Ok(report) => {
            println!("Daily backups:");
            println!("  attempts:      {}", report.total_attempts);
            println!("  successes:     {}", report.successes);
            println!("  failures:      {}", report.failures);
            println!("  success rate:  {:.1}%", report.success_rate);
            println!(
                "  last success:  {}",
                report.last_success_at.as_deref().unwrap_or("never")
            );
            println!(
                "  last failure:  {}",
                report.last_failure_at.as_deref().unwrap_or("never")
            );

            let pressure = match SystemDiskUsage.usage(std::path::Path::new(&config.storage_root)) {
                Ok(space) => {
                    let level = storage::classify_pressure(space, &config.pressure);
                    println!(
                        "Disk: {} free of {} ({:.1}% used) — {}",
                        storage::format_bytes(space.free_bytes),
                        storage::format_bytes(space.total_bytes),
                        space.used_percent(),
                        level.as_str()
                    );
                    level
                }
                Err(e) => {
                    println!("Disk: unavailable ({})", e);
                    storage::StoragePressure::Healthy
                }
            };

            let health = storage::classify_health(pressure, report.days_since_last_success);
            println!("Overall health: {}", health.as_str());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    }

    let artifacts = inventory::list_backups(config);
    println!("Backups ({}):", artifacts.len());
    for artifact in artifacts {
        println!(
            "  {}  {:>10}  {}  [{}]",
            artifact.created_at.format("%Y-%m-%d %H:%M"),
            storage::format_bytes(artifact.size_bytes),
            artifact.name,
            artifact.location.as_str()
        );
    }
    0
}

async fn run_daemon(config: Config) -> i32 {
    log::info!("clinicvault daemon starting");

    let (sender, receiver) = mpsc::channel(QUEUE_SIZE);

    let worker = QueueWorker::new(config.clone());

    // The worker holds a per-request ledger connection (rusqlite `Connection`
    // is `Send` but intentionally `!Sync`), so its future is `!Send` and cannot
    // go through `tokio::spawn`. Run it as a local task alongside the scheduler.
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let worker_handle = tokio::task::spawn_local(async move {
                worker.run(receiver).await;
            });

            let scheduler = Scheduler::new(config, sender);
            scheduler.run().await;

            // The scheduler loop never returns; if it somehow does, wind down
            drop(worker_handle);
        })
        .await;
    0
}
