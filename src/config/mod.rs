//! Configuration module for the PubSub engine
//!
//! This module handles engine configuration including:
//! - Dispatcher limits (undo depth, blocking timeout, nesting guard)
//! - Profile persistence location and history retention
//! - Logging filter and log file location
//!
//! # App Data Location
//!
//! Application data is stored in the platform-appropriate location:
//! - **Linux**: `~/.local/share/joulescope-ui/`
//! - **macOS**: `~/Library/Application Support/joulescope-ui/`
//! - **Windows**: `%APPDATA%\joulescope-ui\`
//!
//! The `JSUI_PUBSUB_HOME` environment variable overrides this directory.
//!
//! # Files
//!
//! - `pubsub.toml` - This configuration
//! - `profiles/` - Saved profiles and their history
//! - `log/` - Daily rolling log files
//!
//! # Example
//!
//! ```ignore
//! use jsui_pubsub::config::PubSubConfig;
//!
//! let mut config = PubSubConfig::load_or_default();
//! config.dispatch.undo_depth = 250;
//! config.save_default()?;
//! ```

use crate::error::{PubSubError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for data directories
pub const APP_ID: &str = "joulescope-ui";

/// Environment variable overriding the app data directory
pub const HOME_ENV: &str = "JSUI_PUBSUB_HOME";

/// Configuration filename
pub const CONFIG_FILE: &str = "pubsub.toml";

/// Default number of undo transactions kept
pub const DEFAULT_UNDO_DEPTH: usize = 100;

/// Default timeout for blocking calls in milliseconds
pub const DEFAULT_BLOCKING_TIMEOUT_MS: u64 = 5000;

/// Default limit for callback re-publish nesting
pub const DEFAULT_MAX_NESTING_DEPTH: usize = 64;

/// Default number of previous versions kept per profile file
pub const DEFAULT_HISTORY_COUNT: usize = 10;

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|h| !h.is_empty()) {
        return Some(PathBuf::from(home));
    }
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        PubSubError::Config("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            PubSubError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Sections ====================

/// Dispatcher limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Undo transactions kept before the oldest is dropped
    pub undo_depth: usize,
    /// How long `*_blocking` calls wait for the processing context
    pub blocking_timeout_ms: u64,
    /// Maximum depth of publishes issued from within callbacks
    pub max_nesting_depth: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            undo_depth: DEFAULT_UNDO_DEPTH,
            blocking_timeout_ms: DEFAULT_BLOCKING_TIMEOUT_MS,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
        }
    }
}

impl DispatchConfig {
    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }
}

/// Profile persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Profile directory; `<app data>/profiles` when unset
    pub profile_dir: Option<PathBuf>,
    /// Previous versions kept per profile file
    pub history_count: usize,
    /// Profile loaded at startup
    pub default_profile: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            profile_dir: None,
            history_count: DEFAULT_HISTORY_COUNT,
            default_profile: "default".to_string(),
        }
    }
}

/// Logging output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Also write a daily rolling log file
    pub log_to_file: bool,
    /// Log directory; `<app data>/log` when unset
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            log_to_file: true,
            log_dir: None,
        }
    }
}

// ==================== PubSubConfig ====================

/// Engine configuration stored in `pubsub.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Version for future migration support
    pub version: u32,
    pub dispatch: DispatchConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            version: 1,
            dispatch: DispatchConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PubSubConfig {
    /// Load configuration from a file. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            PubSubError::Config(format!("Failed to read config {:?}: {}", path, e))
        })?;

        toml::from_str(&content)
            .map_err(|e| PubSubError::Config(format!("Failed to parse config {:?}: {}", path, e)))
    }

    /// Load configuration from the default location, returning defaults on any error
    pub fn load_or_default() -> Self {
        let Some(path) = config_path() else {
            tracing::warn!("Could not determine config path, using defaults");
            return Self::default();
        };
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PubSubError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| PubSubError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| PubSubError::Config(format!("Failed to write config {:?}: {}", path, e)))
    }

    /// Save configuration to the default location
    pub fn save_default(&self) -> Result<()> {
        let dir = ensure_app_data_dir()?;
        self.save(dir.join(CONFIG_FILE))
    }

    /// Resolved profile directory
    pub fn profile_dir(&self) -> Result<PathBuf> {
        match &self.persistence.profile_dir {
            Some(dir) => Ok(dir.clone()),
            None => app_data_dir()
                .map(|d| d.join("profiles"))
                .ok_or_else(|| PubSubError::Config("Could not determine profile directory".to_string())),
        }
    }

    /// Resolved log directory
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.logging
            .log_dir
            .clone()
            .or_else(|| app_data_dir().map(|d| d.join("log")))
    }
}
