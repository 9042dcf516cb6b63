//! Daemon and scheduler configuration.
//!
//! Configuration is read from a TOML file. Every field has a default, so
//! an absent file or a partial file is valid. `TICKCAST_SOCKET` overrides
//! the socket path.
//!
//! ```toml
//! socket_path = "/tmp/tickcast.sock"
//!
//! [scheduler]
//! pool_capacity = 1000
//! sort_group_key_params = false
//! reply_timeout_secs = 180
//!
//! [scheduler.reap]
//! on_connect = true
//! scope = "all_feeds"
//! sweep_interval_secs = 30
//!
//! [feeds.sine]
//! period_secs = 1800.0
//! min = 0.0
//! max = 100.0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::timer::DEFAULT_POOL_CAPACITY;

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tickcast.sock";

/// Environment variable overriding the socket path
pub const SOCKET_ENV: &str = "TICKCAST_SOCKET";

/// Default maximum wait for a reply (3 minutes)
pub const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 180;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

// ============================================================================
// Scheduler
// ============================================================================

/// Which feeds a connect-triggered sweep visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReapScope {
    /// Every feed on every connect
    #[default]
    AllFeeds,
    /// Only the feed that received the connect
    Feed,
}

/// When empty cohorts are reclaimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReapConfig {
    /// Sweep after each passive connect
    pub on_connect: bool,
    pub scope: ReapScope,
    /// Period of a background sweep over all feeds (disabled when absent)
    pub sweep_interval_secs: Option<u64>,
}

impl Default for ReapConfig {
    fn default() -> Self {
        Self {
            on_connect: true,
            scope: ReapScope::AllFeeds,
            sweep_interval_secs: None,
        }
    }
}

impl ReapConfig {
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs.map(Duration::from_secs)
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrent tick slots; `0` means the default
    pub pool_capacity: usize,
    /// Sort connect parameters by name before building group keys
    pub sort_group_key_params: bool,
    /// Maximum wait in `SocketSession::request_reply`
    pub reply_timeout_secs: u64,
    pub reap: ReapConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            sort_group_key_params: false,
            reply_timeout_secs: DEFAULT_REPLY_TIMEOUT_SECS,
            reap: ReapConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reply_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.reply_timeout_secs".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.reap.sweep_interval_secs == Some(0) {
            return Err(ConfigError::Invalid {
                field: "scheduler.reap.sweep_interval_secs".to_string(),
                reason: "must be at least 1 (omit to disable)".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Built-in Feeds
// ============================================================================

/// Parameters of the built-in `sine` feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SineConfig {
    pub period_secs: f64,
    pub min: f64,
    pub max: f64,
    /// Phase offset index; each step shifts the curve by 60 s
    pub phase_index: i64,
}

impl Default for SineConfig {
    fn default() -> Self {
        Self {
            period_secs: 1800.0,
            min: 0.0,
            max: 100.0,
            phase_index: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedsConfig {
    pub sine: SineConfig,
}

// ============================================================================
// Daemon
// ============================================================================

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    /// Maximum concurrent client connections
    pub max_connections: usize,
    /// Time allowed for the first client message
    pub handshake_timeout_secs: u64,
    /// Disconnect clients silent for this long (disabled when absent)
    pub idle_timeout_secs: Option<u64>,
    pub scheduler: SchedulerConfig,
    pub feeds: FeedsConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            max_connections: 10_000,
            handshake_timeout_secs: 10,
            idle_timeout_secs: None,
            scheduler: SchedulerConfig::default(),
            feeds: FeedsConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Default config file location (`~/.config/tickcast/tickcastd.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tickcast").join("tickcastd.toml"))
    }

    /// Loads configuration.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// used when present and built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(default) => Self::from_file(&default)?,
                None => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        if let Ok(socket) = std::env::var(SOCKET_ENV) {
            config.socket_path = PathBuf::from(socket);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        let config = Self::from_toml(&text).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            error: e.to_string(),
        })
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "max_connections".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "handshake_timeout_secs".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.idle_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid {
                field: "idle_timeout_secs".to_string(),
                reason: "must be at least 1 (omit to disable)".to_string(),
            });
        }
        let sine = &self.feeds.sine;
        if sine.period_secs <= 0.0 || sine.max < sine.min {
            return Err(ConfigError::Invalid {
                field: "feeds.sine".to_string(),
                reason: "period_secs must be positive and max >= min".to_string(),
            });
        }
        self.scheduler.validate()
    }
}
