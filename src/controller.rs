use std::{net::SocketAddr, sync::{Arc, LazyLock}};

use tokio::{net::TcpListener, sync::broadcast};

use crate::{
    Signal,
    config::Config,
    internal, listener,
    supervisor::{Backoff, Supervisor},
    worker::Worker,
};

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

/// Owns the listen socket and the worker pool built on it.
#[derive(Debug)]
pub struct Controller {
    listener: Arc<TcpListener>,
    supervisor: Supervisor,
}

impl Controller {
    /// Bind the listen socket and prepare the workers.
    ///
    /// # Errors
    /// If the listen socket cannot be bound, or no workers are configured.
    pub async fn bind(config: &Config) -> anyhow::Result<Self> {
        let listener = listener::bind(config.listen_socket()).await?;

        let workers = (0..config.worker_count())
            .map(|id| Worker::new(id, Arc::clone(&listener), config))
            .collect();

        let (initial, max) = config.restart_backoff();
        let supervisor = Supervisor::new(workers, Backoff::new(initial, max))?;

        internal!(
            level = INFO,
            "Listening on {} and relaying to {} collectors",
            config.listen_socket(),
            config.destinations().len()
        );

        Ok(Self {
            listener,
            supervisor,
        })
    }

    /// The address actually bound, which differs from the configured one for port 0
    ///
    /// # Errors
    /// If the socket cannot report its address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the workers until `shutdown` delivers [`Signal::Shutdown`]
    pub async fn serve(self, shutdown: broadcast::Receiver<Signal>) {
        self.supervisor.run(shutdown).await;
    }

    /// Run the workers until the process is interrupted or terminated
    ///
    /// # Errors
    /// If the signal handlers cannot be installed.
    pub async fn run(self) -> anyhow::Result<()> {
        internal!("Controller running");

        let ret = tokio::select! {
            () = self.serve(SHUTDOWN_BROADCAST.subscribe()) => Ok(()),
            r = shutdown() => r,
        };

        internal!("Shutting down...");

        ret
    }
}
