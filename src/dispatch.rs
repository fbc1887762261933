//! Trigger dispatch.
//!
//! Once the policy says a backup is due, the dispatcher decides how to run
//! it: hand it to the in-process queue worker, spawn a detached process, or,
//! as a last resort, run it synchronously in the caller. The opportunistic
//! entry points (request sampling, dashboard load) catch everything; a
//! trigger check must never surface an error to the request that tripped it.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::dump::{self, DumpArtifact};
use crate::error::BackupError;
use crate::ledger::{Ledger, ACTION_DAILY_BACKUP};
use crate::storage;
use crate::trigger::{self, CheckThrottle, TriggerWindow};
use crate::types::{Config, TriggerSource};

/// Channel buffer size for backup requests
pub const QUEUE_SIZE: usize = 4;

/// A request for the queue worker.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub source: TriggerSource,
}

/// How a due backup ended up being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Queued,
    Detached,
    Synchronous,
}

/// Result of a single synchronous policy evaluation (the `check-time` path).
#[derive(Debug)]
pub enum CheckOutcome {
    /// The window was open and the dump ran.
    Fired(DumpArtifact),
    /// Outside the window, or today already has a success. A deliberate no-op.
    NotDue,
}

/// Worker that drains the backup queue.
///
/// Opens its own ledger connection per request so it never contends with the
/// request-path readers. Re-checks the day's success before dumping: requests
/// can sit in the queue across the same tick that another call site fired on.
pub struct QueueWorker {
    config: Config,
}

impl QueueWorker {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, mut receiver: mpsc::Receiver<BackupRequest>) {
        while let Some(request) = receiver.recv().await {
            log::info!("Executing backup request (source: {})", request.source.as_str());
            self.handle(request).await;
        }
    }

    async fn handle(&self, request: BackupRequest) {
        let ledger = match Ledger::open() {
            Ok(l) => l,
            Err(e) => {
                log::error!("Queue worker could not open ledger: {}", e);
                return;
            }
        };

        let now = Utc::now();

        // Manual requests bypass the idempotency pre-check; the ledger's
        // per-day guard still has the final word.
        if request.source != TriggerSource::Manual {
            let tz = match self.config.tz() {
                Ok(tz) => tz,
                Err(e) => {
                    log::error!("Queue worker: {}", e);
                    return;
                }
            };
            match ledger.has_success_on_day(ACTION_DAILY_BACKUP, now, tz) {
                Ok(true) => {
                    log::info!("Skipping queued backup: today already succeeded");
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    log::error!("Queue worker ledger check failed: {}", e);
                    return;
                }
            }
        }

        match dump::run_and_record(&self.config, &ledger, now).await {
            Ok(artifact) => {
                log::info!("Queued backup complete: {}", artifact.file_name);
                // Standard retention rides along after every successful dump
                let outcome = storage::tier1_standard_retention(&self.config);
                if !outcome.errors.is_empty() {
                    log::warn!("Retention pass had {} errors", outcome.errors.len());
                }
            }
            Err(BackupError::AlreadyRan) => {
                log::info!("Queued backup superseded by a concurrent success");
            }
            Err(e) => {
                log::error!("Queued backup failed: {}", e);
            }
        }
    }
}

/// Spawn a detached child process that outlives the caller.
///
/// One capability with platform-specific implementations; the caller never
/// branches on the OS.
#[cfg(unix)]
pub fn launch_detached(program: &std::path::Path, args: &[&str]) -> Result<(), String> {
    use std::os::unix::process::CommandExt;
    use std::process::Stdio;

    std::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .map(|_| ())
        .map_err(|e| format!("Failed to spawn {}: {}", program.display(), e))
}

#[cfg(windows)]
pub fn launch_detached(program: &std::path::Path, args: &[&str]) -> Result<(), String> {
    use std::os::windows::process::CommandExt;
    use std::process::Stdio;

    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    std::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP)
        .spawn()
        .map(|_| ())
        .map_err(|e| format!("Failed to spawn {}: {}", program.display(), e))
}

/// Run a due backup through the fallback chain:
/// queue worker, then a detached process, then synchronously in the caller.
///
/// Never returns an error; the final synchronous fallback records its own
/// failure in the ledger and the logs.
pub async fn dispatch_due_backup(
    config: &Config,
    queue: Option<&mpsc::Sender<BackupRequest>>,
    source: TriggerSource,
) -> DispatchOutcome {
    if let Some(sender) = queue {
        match sender.try_send(BackupRequest { source }) {
            Ok(()) => return DispatchOutcome::Queued,
            Err(e) => {
                log::warn!("Backup queue unavailable ({}), falling back", e);
            }
        }
    }

    match std::env::current_exe() {
        Ok(exe) => match launch_detached(&exe, &["daily-database"]) {
            Ok(()) => {
                log::info!("Dispatched backup as a detached process");
                return DispatchOutcome::Detached;
            }
            Err(e) => {
                log::warn!("Detached dispatch failed ({}), running synchronously", e);
            }
        },
        Err(e) => {
            log::warn!(
                "Could not resolve current executable ({}), running synchronously",
                e
            );
        }
    }

    // Last resort: the backup still has to happen, even if it blocks us
    match Ledger::open() {
        Ok(ledger) => {
            if let Err(e) = dump::run_and_record(config, &ledger, Utc::now()).await {
                log::error!("Synchronous fallback backup failed: {}", e);
            }
        }
        Err(e) => {
            log::error!("Synchronous fallback could not open ledger: {}", e);
        }
    }
    DispatchOutcome::Synchronous
}

/// Evaluate the policy at `now` and dispatch when due.
///
/// `wide` selects the dashboard's catch-up window instead of the narrow
/// grace window. Returns the dispatch outcome when a backup was started.
pub async fn evaluate_and_dispatch(
    config: &Config,
    ledger: &Ledger,
    queue: Option<&mpsc::Sender<BackupRequest>>,
    now: DateTime<Utc>,
    wide: bool,
    source: TriggerSource,
) -> Result<Option<DispatchOutcome>, BackupError> {
    let tz = config.tz().map_err(BackupError::ConfigurationError)?;
    let window =
        TriggerWindow::from_config(&config.trigger).map_err(BackupError::ConfigurationError)?;

    let has_success = ledger
        .has_success_on_day(ACTION_DAILY_BACKUP, now, tz)
        .map_err(|e| BackupError::Ledger(e.to_string()))?;

    let now_local = now.with_timezone(&tz);
    let due = if wide {
        trigger::is_due_catch_up(now_local, &window, config.trigger.catch_up_hours, has_success)
    } else {
        trigger::should_trigger_now(now_local, &window, has_success)
    };

    if !due {
        return Ok(None);
    }

    log::info!(
        "Backup due at {} (source: {})",
        now_local.format("%Y-%m-%d %H:%M:%S"),
        source.as_str()
    );
    Ok(Some(dispatch_due_backup(config, queue, source).await))
}

/// Request-path call site.
///
/// Sampled: most requests bail at the throttle, a configured fraction slip
/// through regardless so sparse traffic still catches the window. All errors
/// are swallowed after logging; the request proceeds normally no matter what.
pub async fn check_from_request(
    config: &Config,
    throttle: &dyn CheckThrottle,
    queue: Option<&mpsc::Sender<BackupRequest>>,
) {
    if !config.trigger.enabled {
        return;
    }

    let now = Utc::now();
    if !throttle.should_check_now(now) && !trigger::passes_sample(config.trigger.sample_rate) {
        return;
    }
    throttle.record_check(now);

    let ledger = match Ledger::open() {
        Ok(l) => l,
        Err(e) => {
            log::warn!("Request-path backup check skipped: {}", e);
            return;
        }
    };

    if let Err(e) =
        evaluate_and_dispatch(config, &ledger, queue, now, false, TriggerSource::Request).await
    {
        log::warn!("Request-path backup check failed: {}", e);
    }
}

/// Dashboard-load call site.
///
/// No throttle, and the wide catch-up window: an operator looking at the
/// backup dashboard is exactly who should notice a missed day. Returns
/// whether a backup was started; errors are logged and reported as "no".
pub async fn check_from_dashboard(
    config: &Config,
    queue: Option<&mpsc::Sender<BackupRequest>>,
) -> bool {
    if !config.trigger.enabled {
        return false;
    }

    let ledger = match Ledger::open() {
        Ok(l) => l,
        Err(e) => {
            log::warn!("Dashboard backup check skipped: {}", e);
            return false;
        }
    };

    match evaluate_and_dispatch(
        config,
        &ledger,
        queue,
        Utc::now(),
        true,
        TriggerSource::Dashboard,
    )
    .await
    {
        Ok(outcome) => outcome.is_some(),
        Err(e) => {
            log::warn!("Dashboard backup check failed: {}", e);
            false
        }
    }
}

/// Synchronous `check-time` evaluation: if the narrow window is open and
/// today has no success, run the dump inline and record it.
pub async fn check_time_once(
    config: &Config,
    ledger: &Ledger,
    now: DateTime<Utc>,
) -> Result<CheckOutcome, BackupError> {
    let tz = config.tz().map_err(BackupError::ConfigurationError)?;
    let window =
        TriggerWindow::from_config(&config.trigger).map_err(BackupError::ConfigurationError)?;

    let has_success = ledger
        .has_success_on_day(ACTION_DAILY_BACKUP, now, tz)
        .map_err(|e| BackupError::Ledger(e.to_string()))?;

    if !trigger::should_trigger_now(now.with_timezone(&tz), &window, has_success) {
        return Ok(CheckOutcome::NotDue);
    }

    let artifact = dump::run_and_record(config, ledger, now).await?;
    Ok(CheckOutcome::Fired(artifact))
}
