//! Call subsystem configuration
//!
//! Defaults match the production client. A TOML file can override any field:
//!
//! ```toml
//! ended_display_ms = 2000
//! ring_timeout_secs = 45
//! decline_when_busy = true
//!
//! [[ice_servers]]
//! urls = ["stun:stun.l.google.com:19302"]
//!
//! [[ice_servers]]
//! urls = ["stun:stun1.l.google.com:19302"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Minimum number of independent STUN servers
pub const MIN_STUN_SERVERS: usize = 2;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config {path}: {source}")]
    Io {
        /// Path that was read
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// TOML did not parse
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Parsed but unusable
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// One ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// `stun:` or `turn:` URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default)]
    pub username: String,
    /// TURN credential
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// ICE servers handed to every peer connection
    pub ice_servers: Vec<IceServer>,
    /// How long `Ended` is shown before resetting to `Idle`
    pub ended_display_ms: u64,
    /// Give up on unanswered calls after this many seconds; `0` waits forever
    pub ring_timeout_secs: u64,
    /// Publish `ended` on offers that arrive while busy instead of ignoring them
    pub decline_when_busy: bool,
    /// Capacity of the call event broadcast channel
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
            ],
            ended_display_ms: 2000,
            ring_timeout_secs: 45,
            decline_when_busy: true,
            event_capacity: 100,
        }
    }
}

impl CallConfig {
    /// Parse and validate a TOML document
    ///
    /// # Errors
    ///
    /// Returns error if the document does not parse or fails validation
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "Loaded call config");
        Ok(config)
    }

    /// Check invariants the rest of the crate relies on
    ///
    /// # Errors
    ///
    /// Returns error describing the first violated rule
    pub fn validate(&self) -> Result<(), ConfigError> {
        let stun = self
            .ice_servers
            .iter()
            .flat_map(|s| s.urls.iter())
            .filter(|u| u.starts_with("stun:") || u.starts_with("stuns:"))
            .count();
        if stun < MIN_STUN_SERVERS {
            return Err(ConfigError::Invalid(format!(
                "at least {} STUN servers required, found {}",
                MIN_STUN_SERVERS, stun
            )));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before `Ended` resets to `Idle`
    #[must_use]
    pub fn ended_display(&self) -> Duration {
        Duration::from_millis(self.ended_display_ms)
    }

    /// Setup timeout, if enabled
    #[must_use]
    pub fn ring_timeout(&self) -> Option<Duration> {
        (self.ring_timeout_secs > 0).then(|| Duration::from_secs(self.ring_timeout_secs))
    }
}
