//! Keeps a fixed pool of workers alive.
//!
//! A worker that fails, or panics, is started again after a delay that doubles
//! with every consecutive failure. A worker that ran for at least the maximum
//! delay before failing starts over from the initial delay.

use std::{
    future::Future,
    time::{Duration, Instant},
};

use futures_util::future::join_all;
use tokio::sync::broadcast;

use crate::{Signal, error::SupervisorError, internal, worker::Worker};

/// Doubling restart delay, capped at a maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to wait now; the following call returns twice as much
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub const fn reset(&mut self) {
        self.current = self.initial;
    }

    #[must_use]
    pub const fn max(&self) -> Duration {
        self.max
    }
}

fn stopping(receiver: &mut broadcast::Receiver<Signal>) -> bool {
    loop {
        match receiver.try_recv() {
            Ok(Signal::Shutdown) | Err(broadcast::error::TryRecvError::Closed) => return true,
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(broadcast::error::TryRecvError::Empty) => return false,
        }
    }
}

/// Run one worker slot until shutdown.
///
/// `start` is called for every run. A run returning `Ok` means the worker was
/// asked to stop; an error or a panic gets it restarted.
pub async fn supervise<F, Fut, E>(
    id: usize,
    mut backoff: Backoff,
    mut shutdown: broadcast::Receiver<Signal>,
    start: F,
) where
    F: Fn(broadcast::Receiver<Signal>) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    loop {
        // Subscribe before checking, so a signal sent in between reaches one of them
        let receiver = shutdown.resubscribe();
        if stopping(&mut shutdown) {
            return;
        }

        let started = Instant::now();
        match tokio::spawn(start(receiver)).await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => internal!(level = ERROR, "Worker {id} failed: {err}"),
            Err(err) if err.is_panic() => internal!(level = ERROR, "Worker {id} panicked"),
            Err(err) => internal!(level = ERROR, "Worker {id} was cancelled: {err}"),
        }

        if started.elapsed() >= backoff.max() {
            backoff.reset();
        }

        let delay = backoff.next_delay();
        internal!(level = WARN, "Restarting worker {id} in {delay:?}");

        tokio::select! {
            sig = shutdown.recv() => {
                if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                    return;
                }
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// The worker pool
#[derive(Debug)]
pub struct Supervisor {
    workers: Vec<Worker>,
    backoff: Backoff,
}

impl Supervisor {
    /// # Errors
    /// If `workers` is empty.
    pub fn new(workers: Vec<Worker>, backoff: Backoff) -> Result<Self, SupervisorError> {
        if workers.is_empty() {
            return Err(SupervisorError::NoWorkers);
        }

        Ok(Self { workers, backoff })
    }

    /// Start every worker and keep them running until shutdown
    #[tracing::instrument(level = "trace", skip_all, fields(workers = self.workers.len()))]
    pub async fn run(self, shutdown: broadcast::Receiver<Signal>) {
        internal!(level = INFO, "Starting {} workers", self.workers.len());

        join_all(self.workers.into_iter().map(|worker| {
            let backoff = self.backoff;
            let shutdown = shutdown.resubscribe();
            async move {
                let id = worker.id();
                supervise(id, backoff, shutdown, move |receiver| {
                    let worker = worker.clone();
                    async move { worker.run(receiver).await }
                })
                .await;
            }
        }))
        .await;

        internal!(level = INFO, "All workers stopped");
    }
}
