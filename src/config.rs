//! TOML configuration for the fail-open breaker.
//!
//! Layered model: the file named by `FAILOPEN_CONFIG`, then the standard
//! system location, then compiled-in defaults. Values are static for the
//! life of a process.

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "FAILOPEN_CONFIG";

/// Standard system location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/failopen/failopen.toml";

/// Ten years of baseline.
pub const MAX_HISTORY_DAYS: u32 = 3650;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BreakerConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        info!(path = %path.display(), "loaded breaker configuration");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Try, in order: `FAILOPEN_CONFIG`, the system path, compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "FAILOPEN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let hours = self.window.bucket_hours;
        if hours == 0 || hours > 24 || 24 % hours != 0 {
            return Err(ConfigError::Invalid(format!(
                "window.bucket_hours must divide 24, got {hours}"
            )));
        }
        let days = self.window.history_days;
        if days == 0 || days > MAX_HISTORY_DAYS {
            return Err(ConfigError::Invalid(format!(
                "window.history_days must be between 1 and {MAX_HISTORY_DAYS}, got {days}"
            )));
        }
        let z = self.evaluation.z_threshold;
        if !z.is_finite() || z >= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "evaluation.z_threshold must be a negative number, got {z}"
            )));
        }
        if self.store.namespace.is_empty() || self.store.namespace.contains(':') {
            return Err(ConfigError::Invalid(format!(
                "store.namespace must be non-empty and free of ':', got {:?}",
                self.store.namespace
            )));
        }
        Ok(())
    }

    pub fn bucket_duration(&self) -> Duration {
        Duration::hours(i64::from(self.window.bucket_hours))
    }

    /// Counters outlive their bucket by one full bucket so the evaluator can read them.
    pub fn counter_ttl(&self) -> Duration {
        self.bucket_duration() * 2
    }

    /// Capacity of the rate history: one sample per bucket over the retention period.
    pub fn max_entries(&self) -> usize {
        let per_day = (24 / self.window.bucket_hours.max(1)) as usize;
        (self.window.history_days as usize).saturating_mul(per_day)
    }
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Length of one counting bucket, in hours. Must divide 24.
    pub bucket_hours: u32,
    /// How many days of per-bucket rates the baseline retains.
    pub history_days: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            bucket_hours: 4,
            history_days: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Buckets with fewer attempts than this are ignored entirely.
    pub min_attempts: u64,
    /// Baseline samples required before anomalies can be flagged.
    pub min_baseline: usize,
    /// A window is anomalous when its z-score is at or below this value.
    pub z_threshold: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            min_attempts: 400,
            min_baseline: 10,
            z_threshold: -3.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local maps. Counters are not shared between processes.
    Memory,
    /// SQLite database file shared by every process on the host.
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Key prefix, so several providers can share one store.
    pub namespace: String,
    pub backend: StoreBackend,
    /// Database file for the sqlite backend.
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "captcha".to_string(),
            backend: StoreBackend::Sqlite,
            path: PathBuf::from("data/failopen.db"),
            busy_timeout_ms: 5000,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
