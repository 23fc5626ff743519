use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub changefeed: ChangefeedConfig,
    pub logging: LoggingConfig,
}

/// Change-feed subsystem tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangefeedConfig {
    /// Upper bound on the cluster round-trip of a cold `new_feed`
    pub registration_timeout_ms: u64,
    /// Out-of-order messages buffered per shard before the gap is declared stuck
    pub max_pending_per_shard: usize,
    /// How long a gap may stay open while later messages wait behind it
    pub gap_timeout_ms: u64,
}

impl Default for ChangefeedConfig {
    fn default() -> Self {
        Self {
            registration_timeout_ms: 10_000,
            max_pending_per_shard: 10_000,
            gap_timeout_ms: 30_000,
        }
    }
}

impl ChangefeedConfig {
    #[must_use]
    pub const fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    #[must_use]
    pub const fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }

    /// Reject settings that would make every feed fail immediately
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registration_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "changefeed.registration_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_pending_per_shard == 0 {
            return Err(ConfigError::Message(
                "changefeed.max_pending_per_shard must be greater than 0".to_string(),
            ));
        }
        if self.gap_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "changefeed.gap_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional file, then environment overrides
    ///
    /// Environment variables use the `RIPPLEFEED` prefix with `__` between
    /// sections, e.g. `RIPPLEFEED__CHANGEFEED__GAP_TIMEOUT_MS=5000`.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("RIPPLEFEED")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.changefeed.validate()?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from a file plus environment overrides
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }
}
