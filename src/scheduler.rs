//! Scheduler loop for the backup daemon.
//!
//! The primary trigger path: polls once a minute, evaluates the trigger
//! policy, and hands due work to the queue worker. Detects sleep/wake via
//! time-jump polling and runs a catch-up check with the wide window so a
//! laptop-hosted clinic server closed overnight still gets its backup.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::dispatch::{self, BackupRequest};
use crate::ledger::Ledger;
use crate::types::{Config, TriggerSource};

/// Poll interval for the scheduler loop (1 minute)
const POLL_INTERVAL_SECS: u64 = 60;

/// Time jump threshold to detect sleep/wake (5 minutes)
const TIME_JUMP_THRESHOLD_SECS: i64 = 300;

/// Scheduler for the daily backup trigger
pub struct Scheduler {
    config: Config,
    sender: mpsc::Sender<BackupRequest>,
}

impl Scheduler {
    pub fn new(config: Config, sender: mpsc::Sender<BackupRequest>) -> Self {
        Self { config, sender }
    }

    /// Start the scheduler loop
    ///
    /// Runs indefinitely, checking the trigger window every minute.
    pub async fn run(&self) {
        let mut last_check = Utc::now();

        loop {
            tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;

            let now = Utc::now();

            // Detect sleep: time jumped more than 5 minutes
            let time_jump = (now - last_check).num_seconds();
            if time_jump > TIME_JUMP_THRESHOLD_SECS {
                log::info!(
                    "Detected system wake (time jumped {} seconds), checking for a missed backup",
                    time_jump
                );
                self.check(now, true).await;
            }

            self.check(now, false).await;

            last_check = now;
        }
    }

    /// One policy evaluation. `wide` selects the catch-up window after a
    /// detected sleep gap.
    async fn check(&self, now: DateTime<Utc>, wide: bool) {
        if !self.config.trigger.enabled {
            return;
        }

        let ledger = match Ledger::open() {
            Ok(l) => l,
            Err(e) => {
                log::warn!("Scheduler tick skipped, ledger unavailable: {}", e);
                return;
            }
        };

        if let Err(e) = dispatch::evaluate_and_dispatch(
            &self.config,
            &ledger,
            Some(&self.sender),
            now,
            wide,
            TriggerSource::Scheduled,
        )
        .await
        {
            log::warn!("Scheduler check failed: {}", e);
        }
    }
}
