use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::TcpListener, sync::broadcast, task::JoinSet};

use crate::{
    Signal,
    config::SessionSettings,
    error::ListenerError,
    internal,
    session::{Relay, Session},
};

/// Pause after a failed accept, so a persistent error (e.g. out of descriptors)
/// does not turn the loop into a busy spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Bind the listen socket shared by every worker.
///
/// # Errors
/// If the address cannot be bound.
pub async fn bind(socket: SocketAddr) -> Result<Arc<TcpListener>, ListenerError> {
    TcpListener::bind(socket)
        .await
        .map(Arc::new)
        .map_err(|source| ListenerError::BindFailed {
            address: socket.to_string(),
            source,
        })
}

/// Accept loop of one worker.
///
/// Each accepted connection gets its own [`Session`] and stays with this
/// listener until it closes.
pub struct Listener {
    listener: Arc<TcpListener>,
    relay: Arc<Relay>,
    settings: SessionSettings,
}

impl Listener {
    #[must_use]
    pub const fn new(
        listener: Arc<TcpListener>,
        relay: Arc<Relay>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            listener,
            relay,
            settings,
        }
    }

    /// Accept connections until a shutdown signal arrives, then wait for the open
    /// sessions to finish.
    ///
    /// Errors on individual connections are logged and never end the loop.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(level = INFO, "Listener received shutdown signal, finishing {} sessions ...", sessions.len());
                        while sessions.join_next().await.is_some() {}
                        return;
                    }
                }

                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}

                connection = self.listener.accept() => {
                    match connection {
                        Ok((stream, peer)) => self.spawn_session(&mut sessions, stream, peer, shutdown.resubscribe()),
                        Err(err) => {
                            internal!(level = ERROR, "Failed to accept connection: {err}");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }

    fn spawn_session(
        &self,
        sessions: &mut JoinSet<()>,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        shutdown: broadcast::Receiver<Signal>,
    ) {
        let connection = self.relay.metrics().connection_opened();
        tracing::debug!(%peer, "Client connected");

        let session = Session::new(stream, peer, Arc::clone(&self.relay), self.settings);

        sessions.spawn(async move {
            match session.run(shutdown).await {
                Ok(()) => tracing::debug!(%peer, "Client disconnected"),
                Err(err) if err.is_shutdown() => {}
                Err(err) if err.is_client_error() => {
                    internal!(level = WARN, "Closed connection from {peer}: {err}");
                }
                Err(err) => {
                    internal!(level = ERROR, "Connection from {peer} closed with error: {err}");
                }
            }

            drop(connection);
        });
    }
}
