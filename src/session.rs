use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::broadcast,
    task::{JoinError, JoinSet},
};

use crate::{
    Signal,
    assembler::{Assembler, Boundary, State},
    attributes::Attributes,
    config::SessionSettings,
    epoch::EpochClock,
    error::SessionError,
    fanout::{FanOut, FanOutReport},
    incoming, internal,
    metrics::ConnectionMetrics,
    outgoing,
    record::Feed,
};

/// Reply to every request: let the MTA carry on as if we were not here
pub const ACKNOWLEDGEMENT: &[u8] = b"action=DUNNO\n\n";

/// Everything a worker's sessions share to turn a finished request into datagrams.
#[derive(Debug)]
pub struct Relay {
    feed: Feed,
    fanout: FanOut,
    clock: Arc<EpochClock>,
    metrics: Arc<ConnectionMetrics>,
}

impl Relay {
    #[must_use]
    pub const fn new(
        feed: Feed,
        fanout: FanOut,
        clock: Arc<EpochClock>,
        metrics: Arc<ConnectionMetrics>,
    ) -> Self {
        Self {
            feed,
            fanout,
            clock,
            metrics,
        }
    }

    #[must_use]
    pub const fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.metrics
    }

    /// Encode `attributes` with the current epoch, returning the send to every
    /// collector.
    ///
    /// The record is built before this returns; only the sends are left to the
    /// returned future, so the caller can acknowledge without waiting on them.
    pub fn forward(
        &self,
        attributes: &Attributes,
    ) -> impl Future<Output = FanOutReport> + Send + use<> {
        internal!(level = DEBUG, ?attributes, "Received attributes");

        let payload = self.feed.encode(attributes, self.clock.now()).to_payload();
        self.metrics.record_emitted();

        let fanout = self.fanout.clone();
        async move { fanout.send(&payload).await }
    }
}

/// Strip the line terminator, `\n` or `\r\n`
fn trim_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// One policy client connection.
pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    peer: SocketAddr,
    stream: BufReader<Stream>,
    assembler: Assembler,
    relay: Arc<Relay>,
    settings: SessionSettings,
    /// Fan-outs still in flight; aborted if the session ends abnormally
    sends: JoinSet<FanOutReport>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn new(
        stream: Stream,
        peer: SocketAddr,
        relay: Arc<Relay>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            peer,
            stream: BufReader::new(stream),
            assembler: Assembler::new(settings.malformed_line, settings.max_attributes),
            relay,
            settings,
            sends: JoinSet::new(),
        }
    }

    /// Serve the connection until the peer goes away or shutdown is requested.
    ///
    /// Whatever was received after the last blank line is dropped when the
    /// connection closes. Records already produced are sent before an orderly
    /// close returns.
    ///
    /// # Errors
    /// Returns `SessionError` on I/O failure, idle timeout, attribute overflow, or
    /// shutdown.
    #[tracing::instrument(level = "trace", skip_all, fields(peer = %self.peer))]
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        internal!("Connected");

        let mut line = Vec::with_capacity(256);

        loop {
            let read = tokio::select! {
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) => {
                            return Err(SessionError::Shutdown);
                        }
                        _ => continue,
                    }
                }

                () = idle(self.settings.idle_timeout) => {
                    let secs = self.settings.idle_timeout.map_or(0, |d| d.as_secs());
                    return Err(SessionError::Timeout(secs));
                }

                Some(result) = self.sends.join_next(), if !self.sends.is_empty() => {
                    sent(result);
                    continue;
                }

                // Cancel safe: a partial line stays in `line` for the next call
                read = self.stream.read_until(b'\n', &mut line) => read?,
            };

            if read == 0 {
                internal!("Client closed connection");
                while let Some(result) = self.sends.join_next().await {
                    sent(result);
                }
                return Ok(());
            }

            self.process(&line).await?;
            line.clear();
        }
    }

    async fn process(&mut self, line: &[u8]) -> Result<(), SessionError> {
        let text = String::from_utf8_lossy(trim_terminator(line));
        incoming!("{text}");

        match self.assembler.feed(&text) {
            State::Accumulating => Ok(()),
            State::Boundary(Boundary::Emit(attributes)) => {
                self.sends.spawn(self.relay.forward(attributes));
                acknowledge(&mut self.stream).await
            }
            State::Boundary(Boundary::Duplicate) => {
                self.relay.metrics.record_suppressed();
                acknowledge(&mut self.stream).await
            }
            State::Boundary(Boundary::Discarded) => acknowledge(&mut self.stream).await,
            State::Overflow(limit) => {
                internal!(level = WARN, limit, "Too many attributes, closing connection");
                Err(SessionError::AttributeLimit(*limit))
            }
        }
    }
}

fn sent(result: Result<FanOutReport, JoinError>) {
    match result {
        Ok(report) => {
            internal!(level = DEBUG, sent = report.sent, failed = report.failed, "Transaction forwarded");
        }
        Err(err) => internal!(level = ERROR, "Record send did not complete: {err}"),
    }
}

async fn acknowledge<W: AsyncWrite + Unpin>(stream: &mut W) -> Result<(), SessionError> {
    stream.write_all(ACKNOWLEDGEMENT).await?;
    stream.flush().await?;
    outgoing!("action=DUNNO");
    Ok(())
}
