//! Daemon configuration.
//!
//! The configuration is a flat TOML document:
//!
//! ```toml
//! feed_dest = "collector-1.example.net:12211, collector-2.example.net"
//! feed_name = "example-mx"
//! feed_key = "shared secret"
//! listen_port = 9998
//! ```
//!
//! `feed_dest`, `feed_name` and `feed_key` are required; everything else has a default.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    assembler::MalformedLinePolicy,
    error::ConfigError,
    fanout::{Destination, Destinations},
    internal,
    record::Feed,
};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "POLICY_FEED_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Collectors every record is sent to
    #[serde(default)]
    pub feed_dest: Destinations,

    /// Name identifying this feed to the collectors
    #[serde(default)]
    pub feed_name: String,

    /// Secret shared with the collectors, used to sign records
    #[serde(default)]
    pub feed_key: String,

    /// Default: 9998
    #[serde(default = "defaults::listen_port")]
    pub listen_port: u16,

    /// Default: all IPv4 interfaces
    #[serde(default = "defaults::listen_address")]
    pub listen_address: IpAddr,

    /// Number of workers accepting connections.
    ///
    /// Default: one per available CPU
    #[serde(default)]
    pub workers: Option<usize>,

    /// Handling of attribute lines without `=`.
    ///
    /// Default: `drop`
    #[serde(default)]
    pub malformed_line: MalformedLinePolicy,

    /// Close connections that send nothing for this many seconds.
    ///
    /// Default: never
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// Close connections whose request grows past this many attributes.
    ///
    /// Default: unlimited
    #[serde(default)]
    pub max_attributes: Option<usize>,

    /// Delay before restarting a failed worker; doubles on each consecutive failure.
    ///
    /// Default: 100 milliseconds
    #[serde(default = "defaults::restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// Upper bound for the restart delay.
    ///
    /// Default: 10 seconds
    #[serde(default = "defaults::max_restart_backoff_ms")]
    pub max_restart_backoff_ms: u64,
}

/// The per connection part of the configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSettings {
    pub malformed_line: MalformedLinePolicy,
    pub idle_timeout: Option<Duration>,
    pub max_attributes: Option<usize>,
}

impl Config {
    /// Read, parse and validate the configuration at `path`.
    ///
    /// # Errors
    /// If the file cannot be read, is not valid TOML, or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        internal!(level = DEBUG, "Loading configuration from {}", path.display());

        Self::parse(&content)
    }

    /// Parse and validate a configuration document.
    ///
    /// # Errors
    /// If the document is not valid TOML, or fails validation.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every required option is present, reporting each one that is not.
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] listing every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.feed_dest.0.is_empty() {
            problems.push(ConfigError::MissingField("feed_dest"));
        }
        if self.feed_name.trim().is_empty() {
            problems.push(ConfigError::MissingField("feed_name"));
        }
        if self.feed_key.trim().is_empty() {
            problems.push(ConfigError::MissingField("feed_key"));
        }

        if problems.is_empty() {
            return Ok(());
        }

        for problem in &problems {
            internal!(level = ERROR, "{problem}");
        }

        Err(ConfigError::Invalid(problems))
    }

    #[must_use]
    pub fn destinations(&self) -> &[Destination] {
        &self.feed_dest.0
    }

    #[must_use]
    pub fn feed(&self) -> Feed {
        Feed::new(self.feed_name.trim(), &self.feed_key)
    }

    #[must_use]
    pub const fn listen_socket(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.listen_port)
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.filter(|&w| w > 0).unwrap_or_else(num_cpus::get)
    }

    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            malformed_line: self.malformed_line,
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            max_attributes: self.max_attributes,
        }
    }

    #[must_use]
    pub const fn restart_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.restart_backoff_ms),
            Duration::from_millis(self.max_restart_backoff_ms),
        )
    }
}

/// Find the configuration file using the following precedence:
/// 1. An explicitly provided path (command line or `POLICY_FEED_CONFIG`)
/// 2. ./policy-feed.toml (current working directory)
/// 3. /etc/policy-feed/policy-feed.toml (system-wide config)
///
/// # Errors
/// If an explicit path does not exist, or none of the default locations do.
pub fn locate(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }

        return Err(ConfigError::NotFound(format!("  - {}", path.display())));
    }

    let default_paths = [
        PathBuf::from("./policy-feed.toml"),
        PathBuf::from("/etc/policy-feed/policy-feed.toml"),
    ];

    if let Some(path) = default_paths.iter().find(|p| p.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::NotFound(format!(
        "  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )))
}

mod defaults {
    use std::net::{IpAddr, Ipv4Addr};

    pub const fn listen_port() -> u16 {
        9998
    }

    pub const fn listen_address() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    pub const fn restart_backoff_ms() -> u64 {
        100
    }

    pub const fn max_restart_backoff_ms() -> u64 {
        10_000
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_dest: Destinations::default(),
            feed_name: String::new(),
            feed_key: String::new(),
            listen_port: defaults::listen_port(),
            listen_address: defaults::listen_address(),
            workers: None,
            malformed_line: MalformedLinePolicy::default(),
            idle_timeout_secs: None,
            max_attributes: None,
            restart_backoff_ms: defaults::restart_backoff_ms(),
            max_restart_backoff_ms: defaults::max_restart_backoff_ms(),
        }
    }
}
