//! Configuration parsing and validation.
//!
//! Configuration is loaded from TOML files and validated before the
//! runtime or a client is constructed. All intervals are milliseconds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server-side state machine runtime configuration.
    #[serde(default)]
    pub machine: MachineConfig,

    /// Client session runtime configuration.
    #[serde(default)]
    pub client: ClientConfig,
}

/// State machine runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Idle window after which a session is expired at the next
    /// log-derived time check.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
        }
    }
}

impl MachineConfig {
    /// Validate the machine configuration.
    pub fn validate(&self) -> Result<()> {
        if self.session_timeout_ms == 0 {
            anyhow::bail!("machine.session_timeout_ms must be > 0");
        }
        Ok(())
    }
}

/// Client session runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Keep-alive frequency.
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,

    /// Per-RPC deadline.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Initial registration retry backoff.
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,

    /// Registration retry backoff cap.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl ClientConfig {
    /// Validate the client configuration.
    pub fn validate(&self) -> Result<()> {
        if self.keep_alive_interval_ms == 0 {
            anyhow::bail!("client.keep_alive_interval_ms must be > 0");
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("client.request_timeout_ms must be > 0");
        }
        if self.backoff_min_ms == 0 {
            anyhow::bail!("client.backoff_min_ms must be > 0");
        }
        if self.backoff_min_ms > self.backoff_max_ms {
            anyhow::bail!(
                "client.backoff_min_ms ({}) must not exceed client.backoff_max_ms ({})",
                self.backoff_min_ms,
                self.backoff_max_ms
            );
        }
        Ok(())
    }

    /// Keep-alive interval as a [`Duration`].
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Minimum registration backoff as a [`Duration`].
    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    /// Maximum registration backoff as a [`Duration`].
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all sections.
    pub fn validate(&self) -> Result<()> {
        self.machine.validate()?;
        self.client.validate()?;
        Ok(())
    }
}

fn default_session_timeout_ms() -> u64 {
    5_000
}

fn default_keep_alive_interval_ms() -> u64 {
    1_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_backoff_min_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.machine.session_timeout_ms, 5_000);
        assert_eq!(config.client.keep_alive_interval_ms, 1_000);
        assert_eq!(config.client.request_timeout_ms, 10_000);
    }

    #[test]
    fn parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [machine]
            session_timeout_ms = 30000

            [client]
            keep_alive_interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.machine.session_timeout_ms, 30_000);
        assert_eq!(config.client.keep_alive_interval_ms, 250);
        assert_eq!(config.client.backoff_max_ms, 5_000);
    }

    #[test]
    fn backoff_bounds_checked() {
        let config = ClientConfig {
            backoff_min_ms: 10_000,
            backoff_max_ms: 5_000,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
