//! A coarse wall clock shared by every connection of a worker.
//!
//! Records carry the epoch at which they were emitted, but reading the system
//! clock once per record is not needed: the worker refreshes this value once a
//! second and connections read the cached copy.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// How often a worker refreshes its clock
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct EpochClock {
    millis: AtomicU64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochClock {
    /// A clock primed with the current time
    #[must_use]
    pub fn new() -> Self {
        Self::fixed(now_millis())
    }

    /// A clock frozen at `millis` until the next refresh
    #[must_use]
    pub const fn fixed(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    /// Milliseconds since the Unix epoch, as of the last refresh
    #[must_use]
    pub fn now(&self) -> u64 {
        self.millis.load(Ordering::Relaxed)
    }

    /// Re-read the system clock, returning the new value
    pub fn refresh(&self) -> u64 {
        let now = now_millis();
        self.millis.store(now, Ordering::Relaxed);
        now
    }
}
