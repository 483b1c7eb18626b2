//! # Configuration Management
//!
//! Centralized configuration for the agent session server.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Environment variables via `from_env()` (`WAKEHUB_*`)
//! - Direct instantiation with defaults
//!
//! Durations are expressed in milliseconds in TOML and environment input.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// Fixed frame header size: 4-byte packet type + 4-byte payload length.
pub const HEADER_LEN: usize = 8;

/// Max allowed payload size (16 MiB). A hostile length field must never be
/// able to drive an unbounded allocation.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default interval at which clients are expected to heartbeat.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Stream (TCP) listen address
    pub tcp_addr: String,

    /// Datagram (UDP) listen address
    pub udp_addr: String,

    /// Interval at which clients are expected to heartbeat. A connection
    /// that stays silent for twice this interval is torn down.
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Ceiling on the declared payload length of a single frame
    pub max_payload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_addr: String::from("0.0.0.0:8080"),
            udp_addr: String::from("0.0.0.0:8081"),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables, starting from defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Override fields from `WAKEHUB_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("WAKEHUB_TCP_ADDR") {
            self.tcp_addr = addr;
        }

        if let Ok(addr) = std::env::var("WAKEHUB_UDP_ADDR") {
            self.udp_addr = addr;
        }

        if let Ok(interval) = std::env::var("WAKEHUB_HEARTBEAT_INTERVAL_MS") {
            if let Ok(val) = interval.parse::<u64>() {
                self.heartbeat_interval = Duration::from_millis(val);
            }
        }

        if let Ok(size) = std::env::var("WAKEHUB_MAX_PAYLOAD_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                self.max_payload_size = val;
            }
        }
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Idle deadline for a connection: twice the heartbeat interval.
    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.tcp_addr.is_empty() {
            errors.push("TCP listen address cannot be empty".to_string());
        } else if self.tcp_addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid TCP listen address: '{}' (expected format: '0.0.0.0:8080')",
                self.tcp_addr
            ));
        }

        if self.udp_addr.is_empty() {
            errors.push("UDP listen address cannot be empty".to_string());
        } else if self.udp_addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid UDP listen address: '{}' (expected format: '0.0.0.0:8081')",
                self.udp_addr
            ));
        }

        if self.heartbeat_interval.as_millis() < 10 {
            errors.push("Heartbeat interval too short (minimum: 10ms)".to_string());
        } else if self.heartbeat_interval.as_secs() > 3600 {
            errors.push("Heartbeat interval too long (maximum: 1 hour)".to_string());
        }

        if self.max_payload_size < HEADER_LEN {
            errors.push(format!(
                "Max payload size too small: {} (minimum: {HEADER_LEN})",
                self.max_payload_size
            ));
        } else if self.max_payload_size > 256 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size very large: {} (ensure system memory can support this)",
                self.max_payload_size
            ));
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Serde support for Duration fields expressed as milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
