//! Error types for the policy feed daemon.
//!
//! Only configuration errors are fatal. Everything raised once the listeners are
//! running is contained to the connection, destination or worker it came from.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Unable to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid TOML, or has the wrong shape.
    #[error("Unable to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// No configuration file could be located.
    #[error("No configuration file found. Tried:\n{0}")]
    NotFound(String),

    /// A required option is absent or empty.
    #[error("{0} not configured")]
    MissingField(&'static str),

    /// A destination token could not be understood.
    #[error("Invalid destination '{token}': {reason}")]
    InvalidDestination { token: String, reason: String },

    /// One or more problems were found; each has already been reported.
    #[error("Configuration errors found; not starting ({})", .0.len())]
    Invalid(Vec<ConfigError>),
}

/// Errors that end a single policy client connection.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer reset the connection, or a read or write failed.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// No line was received within the configured idle timeout.
    #[error("Session idle for more than {0} seconds")]
    Timeout(u64),

    /// The peer sent more distinct attributes than the configured cap.
    #[error("Attribute limit of {0} exceeded")]
    AttributeLimit(usize),

    /// Shutdown signal received.
    #[error("Shutdown requested")]
    Shutdown,
}

impl SessionError {
    /// Returns `true` if the session ended because the daemon is going away.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Returns `true` if the session was closed because of peer behaviour.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::AttributeLimit(_))
    }
}

/// Errors raised by a listener loop.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to socket address.
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open the UDP socket used to reach the collectors.
    #[error("Failed to open collector socket: {0}")]
    CollectorSocket(#[source] io::Error),
}

/// Errors raised by the worker supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The supervisor was asked to run without any workers.
    #[error("At least one worker is required")]
    NoWorkers,
}
