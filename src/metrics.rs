//! Connection counters of one worker.
//!
//! The counters are owned by the worker and read through [`ConnectionMetrics::snapshot`];
//! nothing else in the process holds on to them.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    total: AtomicU64,
    active: AtomicU64,
    emitted: AtomicU64,
    suppressed: AtomicU64,
}

/// Point in time copy of [`ConnectionMetrics`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Connections accepted since the worker started
    pub total: u64,
    /// Connections currently open
    pub active: u64,
    /// Records forwarded to collectors
    pub emitted: u64,
    /// Requests acknowledged without forwarding, because their instance repeated
    pub suppressed: u64,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "total={} active={}", self.total, self.active)
    }
}

impl ConnectionMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted connection.
    ///
    /// The returned guard marks the connection as closed when dropped, so the
    /// active count is corrected however the session ends.
    #[must_use]
    pub fn connection_opened(self: &Arc<Self>) -> ActiveConnection {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveConnection {
            metrics: Arc::clone(self),
        }
    }

    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppressed(&self) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            total: self.total.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct ActiveConnection {
    metrics: Arc<ConnectionMetrics>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);
    }
}
