//! A UDP collector that keeps every datagram it receives.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::UdpSocket, sync::Mutex, task::JoinHandle};

pub struct Collector {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    handle: JoinHandle<()>,
}

impl Collector {
    /// Bind on a random loopback port and start recording
    pub async fn start() -> anyhow::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = received.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            while let Ok(n) = socket.recv(&mut buf).await {
                sink.lock().await.push(buf[..n].to_vec());
            }
        });

        Ok(Self {
            addr,
            received,
            handle,
        })
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().await.clone()
    }

    /// Wait until at least `count` datagrams arrived, returning all of them
    ///
    /// # Errors
    ///
    /// Returns an error if the timeout expires first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> anyhow::Result<Vec<Vec<u8>>> {
        let start = tokio::time::Instant::now();

        loop {
            let received = self.received().await;
            if received.len() >= count {
                return Ok(received);
            }

            if start.elapsed() > timeout {
                anyhow::bail!(
                    "Timeout waiting for {count} datagrams, collector {} received {}",
                    self.addr,
                    received.len()
                );
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
