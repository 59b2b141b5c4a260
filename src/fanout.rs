//! Best effort delivery of one record to every configured collector.

use std::{fmt, sync::Arc};

use futures_util::future::join_all;
use serde::{Deserialize, Deserializer};

use crate::{error::ConfigError, outgoing, traits::Transport};

/// Collector port used when a destination does not name one
pub const DEFAULT_PORT: u16 = 12211;

/// One collector endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Parse a single `host[:port]` token.
    ///
    /// Returns `Ok(None)` for tokens without a host, which are skipped.
    ///
    /// # Errors
    /// If the port is present but is not a valid port number.
    pub fn parse(token: &str) -> Result<Option<Self>, ConfigError> {
        let (host, port) = match token.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (token, None),
        };

        if host.is_empty() {
            return Ok(None);
        }

        let port = match port {
            None | Some("") => DEFAULT_PORT,
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|&p| p != 0)
                .ok_or_else(|| ConfigError::InvalidDestination {
                    token: token.to_string(),
                    reason: format!("'{port}' is not a valid port"),
                })?,
        };

        Ok(Some(Self::new(host, port)))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Split a destination list on any run of `;`, `,` or whitespace.
///
/// # Errors
/// If any token carries an invalid port.
pub fn parse_destinations(list: &str) -> Result<Vec<Destination>, ConfigError> {
    list.split(|c: char| c == ';' || c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .filter_map(|token| Destination::parse(token).transpose())
        .collect()
}

/// A destination list as it appears in the configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destinations(pub Vec<Destination>);

impl<'de> Deserialize<'de> for Destinations {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let list = String::deserialize(deserializer)?;
        parse_destinations(&list)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Outcome of sending one payload to every destination
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOutReport {
    pub sent: usize,
    pub failed: usize,
}

/// Sends every payload to every destination through one shared transport.
#[derive(Debug, Clone)]
pub struct FanOut {
    transport: Arc<dyn Transport>,
    destinations: Arc<[Destination]>,
}

impl FanOut {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, destinations: Vec<Destination>) -> Self {
        Self {
            transport,
            destinations: destinations.into(),
        }
    }

    /// Send `payload` once to each destination.
    ///
    /// Sends run concurrently and independently; a failure is logged and counted but
    /// never retried, and never stops the other sends.
    #[tracing::instrument(level = "trace", skip_all, fields(destinations = self.destinations.len()))]
    pub async fn send(&self, payload: &[u8]) -> FanOutReport {
        let results = join_all(self.destinations.iter().map(|destination| async move {
            match self.transport.deliver(payload, destination).await {
                Ok(bytes) => {
                    outgoing!(level = DEBUG, %destination, bytes, "Record sent");
                    true
                }
                Err(err) => {
                    outgoing!(level = WARN, %destination, error = %err, "Socket send error");
                    false
                }
            }
        }))
        .await;

        let sent = results.iter().filter(|&&ok| ok).count();
        FanOutReport {
            sent,
            failed: results.len() - sent,
        }
    }
}
