//! Daily trigger policy.
//!
//! The policy is a pure function over an explicit clock reading: callers
//! convert "now" into the configured timezone, ask the ledger whether today
//! already has a success, and pass both in. The policy itself never touches
//! the ledger, the filesystem, or the ambient clock, which is what makes the
//! window boundaries testable to the second.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;

use crate::types::TriggerConfig;

/// End-of-day clamp for windows whose arithmetic would wrap past midnight.
fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).expect("valid constant time")
}

/// The daily time window during which an automatic backup is "due".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerWindow {
    /// Local time of day the window opens.
    pub start: NaiveTime,
    /// How long past `start` the window stays open.
    pub grace: chrono::Duration,
    /// Hard same-day cutoff; redundant with `start + grace` for the default
    /// window but guards against clock skew and long-running checks.
    pub cutoff: NaiveTime,
}

impl TriggerWindow {
    pub fn from_config(config: &TriggerConfig) -> Result<Self, String> {
        let start = NaiveTime::parse_from_str(&config.start, "%H:%M")
            .map_err(|_| format!("Invalid trigger start time: {}", config.start))?;

        Ok(Self {
            start,
            grace: chrono::Duration::seconds(config.grace_secs as i64),
            cutoff: end_of_day(),
        })
    }

    /// Close of the window, clamped to the same calendar day.
    pub fn end(&self) -> NaiveTime {
        add_clamped(self.start, self.grace)
    }
}

/// Add a duration to a time of day, clamping at 23:59:59 instead of wrapping.
fn add_clamped(start: NaiveTime, d: chrono::Duration) -> NaiveTime {
    let (end, wrapped) = start.overflowing_add_signed(d);
    if wrapped != 0 {
        end_of_day()
    } else {
        end
    }
}

/// Should an automatic backup fire right now?
///
/// `now` must already be in the configured trigger timezone, and
/// `ledger_has_success_today` must have been computed against the same
/// timezone's calendar day.
pub fn should_trigger_now(
    now: DateTime<Tz>,
    window: &TriggerWindow,
    ledger_has_success_today: bool,
) -> bool {
    if ledger_has_success_today {
        return false;
    }

    let t = now.time();

    if t < window.start {
        return false;
    }
    if t > window.end() {
        return false;
    }
    if t > window.cutoff {
        return false;
    }

    true
}

/// Wider "catch up" variant used by the dashboard-load check.
///
/// The dashboard path runs rarely and unpredictably, so it accepts the due
/// state for hours after the window opened, still bounded to the same
/// calendar day so the ledger day binding stays coherent.
pub fn is_due_catch_up(
    now: DateTime<Tz>,
    window: &TriggerWindow,
    catch_up_hours: u32,
    ledger_has_success_today: bool,
) -> bool {
    if ledger_has_success_today {
        return false;
    }

    let t = now.time();
    let close = add_clamped(
        window.start,
        chrono::Duration::hours(catch_up_hours as i64),
    );

    t >= window.start && t <= close
}

/// Rate-limited check gate for the opportunistic call sites.
///
/// Implementations persist the last check time somewhere (a sentinel file,
/// an in-process cell) and answer whether enough time has passed to bother
/// consulting the policy again. The store is a sampling throttle only;
/// correctness lives in the ledger, so lost updates are acceptable.
pub trait CheckThrottle {
    fn should_check_now(&self, now: DateTime<Utc>) -> bool;
    fn record_check(&self, now: DateTime<Utc>);
}

/// Throttle backed by a sentinel file holding a unix timestamp.
///
/// Writes are neither atomic nor locked; concurrent requests can race on the
/// sentinel and that is fine, it only shapes how often the policy runs.
pub struct FileThrottle {
    path: PathBuf,
    interval: Duration,
}

impl FileThrottle {
    pub fn new(path: PathBuf, interval: Duration) -> Self {
        Self { path, interval }
    }
}

impl CheckThrottle for FileThrottle {
    fn should_check_now(&self, now: DateTime<Utc>) -> bool {
        let last = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok());

        match last {
            Some(ts) => now.timestamp() - ts >= self.interval.as_secs() as i64,
            // Missing or garbled sentinel: check now and rewrite it
            None => true,
        }
    }

    fn record_check(&self, now: DateTime<Utc>) {
        if let Err(e) = std::fs::write(&self.path, now.timestamp().to_string()) {
            log::warn!(
                "Failed to write check sentinel {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

/// In-memory throttle for callers that live in one process (the daemon).
pub struct MemoryThrottle {
    last: Mutex<Option<i64>>,
    interval: Duration,
}

impl MemoryThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            interval,
        }
    }
}

impl CheckThrottle for MemoryThrottle {
    fn should_check_now(&self, now: DateTime<Utc>) -> bool {
        match self.last.lock() {
            Ok(guard) => match *guard {
                Some(ts) => now.timestamp() - ts >= self.interval.as_secs() as i64,
                None => true,
            },
            Err(_) => true,
        }
    }

    fn record_check(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.last.lock() {
            *guard = Some(now.timestamp());
        }
    }
}

/// Probabilistic sampling gate: lets a fraction of requests through even
/// inside the throttle interval, so a due window is not missed when traffic
/// is sparse around the sentinel's granularity.
pub fn passes_sample(rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    rand::random::<f64>() < rate
}
