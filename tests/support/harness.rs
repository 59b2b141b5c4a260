//! End-to-end test harness for the relay
//!
//! ```no_run
//! let harness = RelayHarness::builder().with_collectors(2).build().await.unwrap();
//!
//! let mut client = harness.connect().await.unwrap();
//! let reply = client.request(&[("instance", "abc")]).await.unwrap();
//! assert_eq!(reply, "action=DUNNO\n\n");
//!
//! harness.collector(0).wait_for(1, Duration::from_secs(5)).await.unwrap();
//! harness.shutdown().await;
//! ```

use std::{fmt::Write as _, net::SocketAddr, time::Duration};

use policy_feed::{Signal, config::Config, controller::Controller, record::Feed};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::broadcast,
    task::JoinHandle,
    time::timeout,
};

use super::collector::Collector;

pub const FEED_NAME: &str = "test-feed";
pub const FEED_KEY: &str = "test-secret";

/// A running relay with its collectors
pub struct RelayHarness {
    addr: SocketAddr,
    collectors: Vec<Collector>,
    config: Config,
    handle: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<Signal>,
}

impl RelayHarness {
    #[must_use]
    pub fn builder() -> RelayHarnessBuilder {
        RelayHarnessBuilder::new()
    }

    #[must_use]
    #[allow(dead_code)]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// # Panics
    ///
    /// Panics if there is no collector with that index.
    #[must_use]
    pub fn collector(&self, index: usize) -> &Collector {
        &self.collectors[index]
    }

    #[must_use]
    pub fn collectors(&self) -> &[Collector] {
        &self.collectors
    }

    /// The feed the relay signs with
    #[must_use]
    pub fn feed(&self) -> Feed {
        self.config.feed()
    }

    /// Open a policy client connection
    pub async fn connect(&self) -> anyhow::Result<PolicyClient> {
        PolicyClient::connect(self.addr).await
    }

    /// Send the shutdown signal and wait for the relay to stop
    ///
    /// # Panics
    ///
    /// Panics if the relay does not stop within 5 seconds.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(Signal::Shutdown);

        timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("relay did not shut down in time")
            .expect("relay task panicked");
    }
}

pub struct RelayHarnessBuilder {
    collectors: usize,
    destinations: Vec<String>,
    workers: usize,
    extra: String,
}

impl RelayHarnessBuilder {
    fn new() -> Self {
        Self {
            collectors: 1,
            destinations: Vec::new(),
            workers: 2,
            extra: String::new(),
        }
    }

    /// Number of UDP collectors (default: 1)
    #[must_use]
    pub const fn with_collectors(mut self, collectors: usize) -> Self {
        self.collectors = collectors;
        self
    }

    /// Add a destination that is not one of the collectors
    #[must_use]
    #[allow(dead_code)]
    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destinations.push(destination.to_string());
        self
    }

    /// Number of workers (default: 2)
    #[must_use]
    #[allow(dead_code)]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Append raw TOML to the generated configuration
    #[must_use]
    #[allow(dead_code)]
    pub fn with_option(mut self, line: &str) -> Self {
        self.extra.push_str(line);
        self.extra.push('\n');
        self
    }

    /// Start the collectors, then the relay listening on a random loopback port
    ///
    /// # Errors
    ///
    /// Returns an error if any component fails to start.
    pub async fn build(self) -> anyhow::Result<RelayHarness> {
        let mut collectors = Vec::with_capacity(self.collectors);
        for _ in 0..self.collectors {
            collectors.push(Collector::start().await?);
        }

        let destinations = collectors
            .iter()
            .map(|c| c.addr().to_string())
            .chain(self.destinations)
            .collect::<Vec<_>>()
            .join(", ");

        let mut toml = String::new();
        writeln!(toml, "feed_dest = \"{destinations}\"")?;
        writeln!(toml, "feed_name = \"{FEED_NAME}\"")?;
        writeln!(toml, "feed_key = \"{FEED_KEY}\"")?;
        writeln!(toml, "listen_address = \"127.0.0.1\"")?;
        writeln!(toml, "listen_port = 0")?;
        writeln!(toml, "workers = {}", self.workers)?;
        toml.push_str(&self.extra);

        let config = Config::parse(&toml)?;
        let controller = Controller::bind(&config).await?;
        let addr = controller.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
        let handle = tokio::spawn(controller.serve(shutdown_rx));

        Ok(RelayHarness {
            addr,
            collectors,
            config,
            handle,
            shutdown_tx,
        })
    }
}

/// A policy delegation client, as an MTA would drive it
pub struct PolicyClient {
    stream: BufReader<TcpStream>,
}

impl PolicyClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        Ok(Self {
            stream: BufReader::new(TcpStream::connect(addr).await?),
        })
    }

    /// Send raw bytes without waiting for anything
    pub async fn send_raw(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.stream.get_mut().write_all(data).await?;
        Ok(())
    }

    /// Send one request and read the reply up to and including its blank line
    pub async fn request(&mut self, attributes: &[(&str, &str)]) -> anyhow::Result<String> {
        let mut request = String::new();
        for (key, value) in attributes {
            writeln!(request, "{key}={value}")?;
        }
        request.push('\n');

        self.send_raw(request.as_bytes()).await?;
        self.read_reply().await
    }

    /// Read one reply, or fail if none arrives within 5 seconds
    pub async fn read_reply(&mut self) -> anyhow::Result<String> {
        let mut reply = String::new();

        timeout(Duration::from_secs(5), async {
            loop {
                let before = reply.len();
                if self.stream.read_line(&mut reply).await? == 0 {
                    anyhow::bail!("connection closed after {reply:?}");
                }
                if reply[before..] == *"\n" {
                    return Ok(());
                }
            }
        })
        .await??;

        Ok(reply)
    }

    /// Wait for the relay to close the connection
    pub async fn closed(&mut self) -> anyhow::Result<bool> {
        let mut rest = String::new();
        let n = timeout(Duration::from_secs(5), self.stream.read_line(&mut rest)).await??;
        Ok(n == 0)
    }
}
