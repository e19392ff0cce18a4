//! Wall Clock
//!
//! Every timestamp the engine takes goes through a `Clock`, so runtimes and
//! resume deadlines can be driven by hand in tests.

use chrono::{DateTime, Local, Utc};
use std::time::Duration;

/// Source of the current local time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// The real system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Time elapsed from `since` to `now`, zero if `since` lies in the future
pub fn elapsed(since: DateTime<Local>, now: DateTime<Local>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// `at + delay`, saturating at the latest representable instant
pub fn add(at: DateTime<Local>, delay: Duration) -> DateTime<Local> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or_else(|| DateTime::<Utc>::MAX_UTC.with_timezone(&Local))
}
