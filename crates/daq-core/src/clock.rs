//! Time sources for time tagging.
//!
//! Readers stamp messages with "now" at the completion of each physical
//! read. Going through a [`Clock`] keeps that stamp deterministic in tests.

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use daq_pool::Timetag;

/// Source of the current time in microseconds since the Unix epoch.
pub trait Clock: Send + Sync + Debug {
    /// Current time.
    fn now_usecs(&self) -> Timetag;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_usecs(&self) -> Timetag {
        Utc::now().timestamp_micros()
    }
}

/// Settable clock shared between a test and the code under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    /// Clock frozen at `start` until moved.
    #[must_use]
    pub fn new(start: Timetag) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
        }
    }

    /// Jump to `now`.
    pub fn set(&self, now: Timetag) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `usecs`.
    pub fn advance_usecs(&self, usecs: i64) {
        self.now.fetch_add(usecs, Ordering::SeqCst);
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.advance_usecs(i64::try_from(by.as_micros()).unwrap_or(i64::MAX));
    }
}

impl Clock for ManualClock {
    fn now_usecs(&self) -> Timetag {
        self.now.load(Ordering::SeqCst)
    }
}

/// Shared handle to the wall clock.
#[must_use]
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
