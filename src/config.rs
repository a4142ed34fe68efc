//! Session configuration module
//!
//! Handles loading of session defaults from a TOML file and environment variables.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::net::codec::{DataType, DEFAULT_MAX_FRAME_SIZE};

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Data type used when no `data_type` option is set before `open`
    #[serde(default = "default_data_type")]
    pub data_type: DataType,

    /// Largest encoded frame accepted for sending, and the scan bound for
    /// delimiter framing
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// How long `establish` waits for an outbound connection
    #[serde(default = "default_establish_timeout")]
    pub establish_timeout_ms: u64,

    /// Poll timeout used by hosts that tick the session
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,

    /// Maximum backend steps processed by a single `poll`
    #[serde(default = "default_max_poll_iterations")]
    pub max_poll_iterations: usize,

    /// Size of a single socket read
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,

    /// A bound UDP session forgets a peer after this long without a
    /// datagram from it. 0 keeps peers until close.
    #[serde(default = "default_udp_peer_timeout")]
    pub udp_peer_timeout_ms: u64,
}

// Default value functions
fn default_data_type() -> DataType {
    DataType::Json
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_establish_timeout() -> u64 {
    5000
}

fn default_poll_timeout() -> u64 {
    1
}

fn default_max_poll_iterations() -> usize {
    2000
}

fn default_read_chunk_size() -> usize {
    16 * 1024
}

fn default_udp_peer_timeout() -> u64 {
    60_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/pollnet.toml"),
            data_type: default_data_type(),
            max_frame_size: default_max_frame_size(),
            establish_timeout_ms: default_establish_timeout(),
            poll_timeout_ms: default_poll_timeout(),
            max_poll_iterations: default_max_poll_iterations(),
            read_chunk_size: default_read_chunk_size(),
            udp_peer_timeout_ms: default_udp_peer_timeout(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        let config_path = env::var("POLLNET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/pollnet.toml"));

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).with_context(|| {
                format!("Failed to read config file: {}", config_path.display())
            })?;

            Self::from_toml(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;

        config.apply_env_overrides();

        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("POLLNET_DATA_TYPE") {
            if let Some(data_type) = DataType::from_name(&val) {
                self.data_type = data_type;
            }
        }
        if let Ok(val) = env::var("POLLNET_MAX_FRAME_SIZE") {
            if let Ok(size) = val.parse() {
                self.max_frame_size = size;
            }
        }
        if let Ok(val) = env::var("POLLNET_ESTABLISH_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.establish_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var("POLLNET_POLL_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.poll_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var("POLLNET_MAX_POLL_ITERATIONS") {
            if let Ok(count) = val.parse() {
                self.max_poll_iterations = count;
            }
        }
        if let Ok(val) = env::var("POLLNET_READ_CHUNK_SIZE") {
            if let Ok(size) = val.parse() {
                self.read_chunk_size = size;
            }
        }
        if let Ok(val) = env::var("POLLNET_UDP_PEER_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.udp_peer_timeout_ms = ms;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // Room for the BYTES header plus at least one payload byte
        if self.max_frame_size <= 4 {
            anyhow::bail!("Max frame size must be larger than 4 bytes");
        }
        if self.max_frame_size > u32::MAX as usize {
            anyhow::bail!("Max frame size must fit the 32-bit length header");
        }

        if self.max_poll_iterations == 0 {
            anyhow::bail!("Max poll iterations must be at least 1");
        }

        if self.read_chunk_size == 0 {
            anyhow::bail!("Read chunk size must be at least 1 byte");
        }

        Ok(())
    }

    /// Timeout used by `establish`
    pub fn establish_timeout(&self) -> Duration {
        Duration::from_millis(self.establish_timeout_ms)
    }

    /// Timeout for one host tick
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Idle time after which a UDP peer is forgotten, if enabled
    pub fn udp_peer_timeout(&self) -> Option<Duration> {
        match self.udp_peer_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.data_type, DataType::Json);
        assert_eq!(config.max_frame_size, 512 * 1024);
        assert_eq!(config.establish_timeout_ms, 5000);
        assert_eq!(config.max_poll_iterations, 2000);
        assert_eq!(config.establish_timeout(), Duration::from_secs(5));
        assert_eq!(config.udp_peer_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_from_toml() {
        let config = SessionConfig::from_toml(
            r#"
            data_type = "bytes"
            max_frame_size = 1024
            "#,
        )
        .unwrap();

        assert_eq!(config.data_type, DataType::Bytes);
        assert_eq!(config.max_frame_size, 1024);
        // Unset fields keep their defaults
        assert_eq!(config.establish_timeout_ms, 5000);

        let config = SessionConfig::from_toml("udp_peer_timeout_ms = 0").unwrap();
        assert_eq!(config.udp_peer_timeout(), None);
    }

    #[test]
    fn test_sample_config_matches_defaults() {
        let config = SessionConfig::from_toml(include_str!("../config/pollnet.toml")).unwrap();
        let defaults = SessionConfig::default();

        assert_eq!(config.data_type, defaults.data_type);
        assert_eq!(config.max_frame_size, defaults.max_frame_size);
        assert_eq!(config.poll_timeout_ms, defaults.poll_timeout_ms);
        assert_eq!(config.read_chunk_size, defaults.read_chunk_size);
        assert_eq!(config.udp_peer_timeout_ms, defaults.udp_peer_timeout_ms);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = SessionConfig::default();
        assert!(config.validate().is_ok());

        config.max_frame_size = 4;
        assert!(config.validate().is_err());
        config.max_frame_size = 1024;

        config.max_poll_iterations = 0;
        assert!(config.validate().is_err());
    }
}
