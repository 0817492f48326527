//! Service configuration
//!
//! Loaded from TOML at startup, falls back to defaults if no config file
//! exists or it fails to parse.

use crate::types::BindMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StewardConfig {
    /// HTTP boundary.
    pub server: ServerConfig,
    /// Long-poll dispatch.
    pub dispatch: DispatchConfig,
    /// Task retention.
    pub tasks: TaskConfig,
    /// Log filter.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: BindMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// How long an agent poll blocks before returning empty.
    pub long_poll_timeout_secs: u64,
    /// Backend a node must advertise to run adventures.
    pub adventurator_capability: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Terminal tasks completed longer ago than this are pruned.
    pub retention_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`.
    pub filter: String,
}

// ============================================================
// Defaults
// ============================================================

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: BindMode::default(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout_secs: 30,
            adventurator_capability: "adventurator".into(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            retention_secs: 1800,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "steward=info,tower_http=info".into(),
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl StewardConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {} - using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {} - using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

impl DispatchConfig {
    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.long_poll_timeout_secs)
    }
}
