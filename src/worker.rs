//! One relay worker: a UDP socket, a clock and a set of counters of its own,
//! accepting connections from the listen socket it shares with its siblings.

use std::{fmt, sync::Arc};

use tokio::{
    net::{TcpListener, UdpSocket},
    sync::broadcast,
};

use crate::{
    Signal,
    config::{Config, SessionSettings},
    epoch::{EpochClock, REFRESH_INTERVAL},
    error::ListenerError,
    fanout::{Destination, FanOut},
    internal,
    listener::Listener,
    metrics::{ConnectionMetrics, Snapshot},
    record::Feed,
    session::Relay,
};

/// Process title style status line of a worker
#[must_use]
pub fn title(id: usize, snapshot: Snapshot) -> String {
    format!("policy-feed (worker {id}) {snapshot}")
}

/// The status line last reported by a worker
#[derive(Debug, Default)]
struct Title {
    shown: Option<String>,
}

impl Title {
    /// The new status line, if it differs from the one last reported
    fn update(&mut self, id: usize, snapshot: Snapshot) -> Option<&str> {
        let current = title(id, snapshot);
        if self.shown.as_ref() == Some(&current) {
            return None;
        }

        self.shown = Some(current);
        self.shown.as_deref()
    }
}

/// Everything needed to (re)start a worker.
#[derive(Clone)]
pub struct Worker {
    id: usize,
    listener: Arc<TcpListener>,
    feed: Feed,
    destinations: Vec<Destination>,
    settings: SessionSettings,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("feed", &self.feed)
            .field("destinations", &self.destinations.len())
            .finish_non_exhaustive()
    }
}

impl Worker {
    #[must_use]
    pub fn new(id: usize, listener: Arc<TcpListener>, config: &Config) -> Self {
        Self {
            id,
            listener,
            feed: config.feed(),
            destinations: config.destinations().to_vec(),
            settings: config.session_settings(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Serve connections until shutdown.
    ///
    /// Counters and the clock start afresh on every run.
    ///
    /// # Errors
    /// If the collector socket cannot be opened.
    #[tracing::instrument(level = "trace", skip_all, fields(worker = self.id))]
    pub async fn run(&self, shutdown: broadcast::Receiver<Signal>) -> Result<(), ListenerError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(ListenerError::CollectorSocket)?;

        let clock = Arc::new(EpochClock::new());
        let metrics = Arc::new(ConnectionMetrics::new());
        let relay = Arc::new(Relay::new(
            self.feed.clone(),
            FanOut::new(Arc::new(socket), self.destinations.clone()),
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));

        let listener = Listener::new(Arc::clone(&self.listener), relay, self.settings);

        tokio::select! {
            () = listener.serve(shutdown) => {}
            () = self.tick(&clock, &metrics) => {}
        }

        internal!(level = INFO, "Worker {} stopped", self.id);
        Ok(())
    }

    /// Refresh the clock once per interval, reporting the counters when they changed
    async fn tick(&self, clock: &EpochClock, metrics: &ConnectionMetrics) {
        let mut interval = tokio::time::interval(REFRESH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut title = Title::default();

        loop {
            interval.tick().await;
            clock.refresh();
            if let Some(line) = title.update(self.id, metrics.snapshot()) {
                internal!(level = INFO, "{line}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;
    use crate::listener::bind;

    #[test]
    fn title_format() {
        let snapshot = Snapshot {
            total: 12,
            active: 3,
            ..Snapshot::default()
        };
        assert_eq!(title(2, snapshot), "policy-feed (worker 2) total=12 active=3");
    }

    #[test]
    fn title_reported_only_on_change() {
        let mut title = Title::default();
        let idle = Snapshot::default();
        let busy = Snapshot {
            total: 1,
            active: 1,
            ..Snapshot::default()
        };

        assert_eq!(title.update(0, idle), Some("policy-feed (worker 0) total=0 active=0"));
        assert_eq!(title.update(0, idle), None);
        assert_eq!(title.update(0, busy), Some("policy-feed (worker 0) total=1 active=1"));
        assert_eq!(
            title.update(0, Snapshot { emitted: 5, ..busy }),
            None,
            "only connection counts are part of the title"
        );
    }

    #[tokio::test]
    async fn worker_relays_to_collector() {
        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = Config::parse(&format!(
            r#"
            feed_dest = "127.0.0.1:{}"
            feed_name = "feed"
            feed_key = "secret"
            "#,
            collector.local_addr().unwrap().port()
        ))
        .unwrap();

        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let address = listener.local_addr().unwrap();
        let worker = Worker::new(0, listener, &config);

        let (shutdown, receiver) = broadcast::channel(4);
        let handle = tokio::spawn(async move { worker.run(receiver).await });

        let mut client = TcpStream::connect(address).await.unwrap();
        client
            .write_all(b"client_address=192.0.2.1\ninstance=abc\n\n")
            .await
            .unwrap();
        let mut ack = [0u8; 14];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, b"action=DUNNO\n\n");

        let mut buf = [0u8; 512];
        let n = tokio::time::timeout(Duration::from_secs(5), collector.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(config.feed().verify(&buf[..n]));

        shutdown.send(Signal::Shutdown).unwrap();
        handle.await.unwrap().unwrap();
    }
}
