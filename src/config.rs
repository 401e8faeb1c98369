//! Configuration management for the Redis-backed counter.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RateWindowError, Result};
use crate::ratelimit::WindowLength;

/// Address used when the configuration lists none.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:6379";

/// Configuration for connecting a counter to its backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Redis `host:port` addresses. Several addresses are tried in random
    /// order until one accepts a connection.
    #[serde(default, alias = "host")]
    pub addresses: Vec<String>,

    /// Redis password (if the server has one). Never written back out.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Logical database to select
    #[serde(default)]
    pub db_index: i64,

    /// Prefix of every bucket key written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Initial window length in seconds, until `configure` is called
    #[serde(default = "default_window_length_secs")]
    pub window_length_secs: u64,

    /// How long to wait for each address when connecting
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound on a single batch round trip; unbounded when unset
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            password: None,
            db_index: 0,
            key_prefix: default_key_prefix(),
            window_length_secs: default_window_length_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: None,
        }
    }
}

fn default_key_prefix() -> String {
    "httprate".to_string()
}

fn default_window_length_secs() -> u64 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl CounterConfig {
    /// Create a configuration for the given addresses with every other
    /// setting at its default.
    pub fn with_addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading counter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            RateWindowError::Config(format!("Failed to parse counter config: {}", e))
        })
    }

    /// The addresses to connect to, falling back to [`DEFAULT_ADDRESS`].
    pub fn resolved_addresses(&self) -> Vec<String> {
        if self.addresses.is_empty() {
            vec![DEFAULT_ADDRESS.to_string()]
        } else {
            self.addresses.clone()
        }
    }

    /// The configured initial window length.
    pub fn window_length(&self) -> Result<WindowLength> {
        WindowLength::from_secs(self.window_length_secs)
    }

    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-command timeout as a duration.
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    /// Check the configuration for values that can never work.
    pub fn validate(&self) -> Result<()> {
        if let Some(blank) = self.addresses.iter().find(|a| a.trim().is_empty()) {
            return Err(RateWindowError::Config(format!(
                "address list contains a blank entry: {:?}",
                blank
            )));
        }
        if self.db_index < 0 {
            return Err(RateWindowError::Config(format!(
                "db_index must not be negative, got {}",
                self.db_index
            )));
        }
        if self.key_prefix.is_empty() {
            return Err(RateWindowError::Config(
                "key_prefix must not be empty".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(RateWindowError::Config(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.command_timeout_ms == Some(0) {
            return Err(RateWindowError::Config(
                "command_timeout_ms must be greater than zero when set".to_string(),
            ));
        }
        self.window_length()?;
        Ok(())
    }
}
