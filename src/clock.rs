use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Seconds left until `target_end` as seen at `now`, floored and clamped at zero.
///
/// Remaining time is always derived from two absolute instants, never decremented, so any
/// number of missed polls (suspended process, throttled timer) corrects itself on the next call.
pub fn remaining_seconds(target_end: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = target_end.signed_duration_since(now).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        (millis / 1000) as u64
    }
}

pub fn target_end(now: DateTime<Utc>, remaining_seconds: u64) -> DateTime<Utc> {
    now + Duration::seconds(remaining_seconds as i64)
}

pub fn elapsed_seconds(earlier: DateTime<Utc>, later: DateTime<Utc>) -> u64 {
    let millis = later.signed_duration_since(earlier).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        (millis / 1000) as u64
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
