//! Client configuration
//!
//! Loaded from a JSON file; every field has a default so a partial file
//! (or none at all) is valid. Command-line flags override file values in
//! the binaries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{DEFAULT_KEY_BITS, MAX_KEY_BITS, MIN_KEY_BITS};

/// Name of the config file inside the data directory
pub const CONFIG_FILE: &str = "config.json";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Could not read or write the config file
    #[error("Config file {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File is not valid JSON for this schema
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Reconnection schedule for the broker connection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnect attempts after an unexpected loss before giving up
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay
    pub max_backoff_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Randomize each delay by ±30%
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = (self.initial_backoff_ms as f64 * self.multiplier.powi(exponent))
            .min(self.max_backoff_ms as f64);

        let millis = if self.jitter {
            base * (1.0 + rand::thread_rng().gen_range(-0.3..0.3))
        } else {
            base
        };
        Duration::from_millis(millis.max(0.0) as u64)
    }

    fn validate(&self) -> ConfigResult<()> {
        if !(self.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "reconnect.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "reconnect.initial_backoff_ms exceeds reconnect.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level client configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the message broker
    pub broker_url: String,
    /// Base URL of the key directory, history and roster services
    pub api_base_url: String,
    /// Root of the per-user key stores
    pub data_dir: PathBuf,
    /// RSA modulus size for newly generated identities
    pub key_bits: usize,
    /// Handshake plus subscription deadline
    pub connect_timeout_ms: u64,
    /// Broker reconnection schedule
    pub reconnect: ReconnectPolicy,
    /// How often the selected conversation's history is re-fetched
    pub status_refresh_secs: u64,
    /// How often the selected group's roster is re-fetched
    pub roster_refresh_secs: u64,
    /// Capacity of the store event broadcast channels
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://127.0.0.1:8765".to_string(),
            api_base_url: "http://127.0.0.1:8080/api".to_string(),
            data_dir: default_data_dir(),
            key_bits: DEFAULT_KEY_BITS,
            connect_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
            status_refresh_secs: 30,
            roster_refresh_secs: 60,
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ClientConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else `<default data dir>/config.json` if it
    /// exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let fallback = default_data_dir().join(CONFIG_FILE);
        if fallback.exists() {
            Self::load(&fallback)
        } else {
            Ok(Self::default())
        }
    }

    /// Write as pretty JSON
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.broker_url.starts_with("ws://") || self.broker_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "broker_url must be a ws:// or wss:// URL, got {:?}",
                self.broker_url
            )));
        }
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "api_base_url must be an http:// or https:// URL, got {:?}",
                self.api_base_url
            )));
        }
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&self.key_bits) {
            return Err(ConfigError::Invalid(format!(
                "key_bits must be between {MIN_KEY_BITS} and {MAX_KEY_BITS}, got {}",
                self.key_bits
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connect_timeout_ms must be positive".into()));
        }
        if self.status_refresh_secs == 0 || self.roster_refresh_secs == 0 {
            return Err(ConfigError::Invalid("refresh intervals must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive".into()));
        }
        self.reconnect.validate()
    }

    /// Handshake deadline
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Status refresh period
    pub fn status_refresh(&self) -> Duration {
        Duration::from_secs(self.status_refresh_secs)
    }

    /// Roster refresh period
    pub fn roster_refresh(&self) -> Duration {
        Duration::from_secs(self.roster_refresh_secs)
    }
}

/// `<platform data dir>/whisperline`, or `./whisperline` when the platform
/// has none
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("whisperline")
}
