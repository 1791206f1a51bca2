//! Engine configuration.
//!
//! Configuration is plain serde data loaded from JSON and checked with
//! [`EngineConfig::validate`] before anything is constructed from it.
//!
//! ```json
//! {
//!   "backend": { "type": "log", "path": "/var/lib/pointvault", "sync_writes": true },
//!   "writer": {
//!     "workers": 4,
//!     "batch_size": 500,
//!     "warning_threshold": 100000,
//!     "dewarning_threshold": 50000,
//!     "discard_threshold": 200000,
//!     "size_check_interval": 5.0,
//!     "overflow_policy": "discard_oldest",
//!     "max_attempts": 3,
//!     "retry_backoff": 0.1,
//!     "rate_window": 60.0
//!   }
//! }
//! ```
//!
//! Durations are fractional seconds. Every writer field has a default, so
//! `{"backend": {"type": "memory"}}` is a complete configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendConfig;
use crate::error::{ConfigError, Result};

/// What the async queues do when a shard holds too many values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Keep accepting; the periodic size check evicts the oldest values.
    #[default]
    DiscardOldest,
    /// Make producers wait until the shard drains below the discard threshold.
    Block,
}

/// Tuning for the asynchronous write path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Number of worker threads and queue shards.
    pub workers: usize,
    /// Maximum values persisted per backend call.
    pub batch_size: usize,
    /// Queue size above which a warning is raised.
    pub warning_threshold: usize,
    /// Queue size at or below which a raised warning clears.
    pub dewarning_threshold: usize,
    /// Queue size the overflow policy enforces.
    pub discard_threshold: usize,
    /// Minimum time between queue size checks.
    #[serde(with = "duration_serde")]
    pub size_check_interval: Duration,
    /// Behaviour when a shard reaches `discard_threshold`.
    pub overflow_policy: OverflowPolicy,
    /// Attempts per batch before its values are dropped.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    #[serde(with = "duration_serde")]
    pub retry_backoff: Duration,
    /// Width of the sliding window behind the write rates.
    #[serde(with = "duration_serde")]
    pub rate_window: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            batch_size: 500,
            warning_threshold: 100_000,
            dewarning_threshold: 50_000,
            discard_threshold: 200_000,
            size_check_interval: Duration::from_secs(5),
            overflow_policy: OverflowPolicy::DiscardOldest,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(100),
            rate_window: Duration::from_secs(60),
        }
    }
}

impl WriterConfig {
    /// Validates the writer configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if:
    /// - `workers`, `batch_size` or `max_attempts` is zero
    /// - the thresholds are not ordered `dewarning < warning <= discard`
    /// - `rate_window` is shorter than one second
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(invalid("workers", "must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be > 0".to_string()));
        }
        if self.dewarning_threshold >= self.warning_threshold {
            return Err(invalid(
                "dewarning_threshold",
                format!(
                    "{} must be below warning_threshold {}",
                    self.dewarning_threshold, self.warning_threshold
                ),
            ));
        }
        if self.warning_threshold > self.discard_threshold {
            return Err(invalid(
                "warning_threshold",
                format!(
                    "{} must not exceed discard_threshold {}",
                    self.warning_threshold, self.discard_threshold
                ),
            ));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be > 0".to_string()));
        }
        if self.rate_window < Duration::from_secs(1) {
            return Err(invalid(
                "rate_window",
                format!("{:?} is shorter than one second", self.rate_window),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration for a [`PointValueStore`](crate::store::PointValueStore).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Which backend to open.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Async write path tuning.
    #[serde(default)]
    pub writer: WriterConfig,
}

impl EngineConfig {
    /// Loads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Load`] if the file cannot be read
    /// - [`ConfigError::Parse`] if it is not a valid configuration document
    /// - [`ConfigError::Invalid`] if a value fails validation
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.writer.validate()
    }
}

fn invalid(field: &'static str, reason: String) -> crate::error::PointVaultError {
    ConfigError::Invalid { field, reason }.into()
}

/// Serde support for Duration fields.
///
/// Durations are serialized as total seconds (f64) for human readability
/// in JSON configuration files.
mod duration_serde {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds)
            .map_err(|e| D::Error::custom(format!("invalid duration {seconds}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PointVaultError;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn invalid_field(config: &WriterConfig) -> &'static str {
        match config.validate().unwrap_err() {
            PointVaultError::Config(ConfigError::Invalid { field, .. }) => field,
            other => panic!("Expected Invalid, got: {other:?}"),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
        assert_eq!(
            WriterConfig::default().overflow_policy,
            OverflowPolicy::DiscardOldest
        );
        assert_eq!(
            WriterConfig::default().size_check_interval,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_validation_rejects_bad_fields() {
        let base = WriterConfig::default();
        assert_eq!(
            invalid_field(&WriterConfig {
                workers: 0,
                ..base.clone()
            }),
            "workers"
        );
        assert_eq!(
            invalid_field(&WriterConfig {
                batch_size: 0,
                ..base.clone()
            }),
            "batch_size"
        );
        assert_eq!(
            invalid_field(&WriterConfig {
                dewarning_threshold: base.warning_threshold,
                ..base.clone()
            }),
            "dewarning_threshold"
        );
        assert_eq!(
            invalid_field(&WriterConfig {
                warning_threshold: base.discard_threshold + 1,
                ..base.clone()
            }),
            "warning_threshold"
        );
        assert_eq!(
            invalid_field(&WriterConfig {
                max_attempts: 0,
                ..base.clone()
            }),
            "max_attempts"
        );
        assert_eq!(
            invalid_field(&WriterConfig {
                rate_window: Duration::from_millis(500),
                ..base
            }),
            "rate_window"
        );
    }

    #[test]
    fn test_load_partial_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(
            &path,
            r#"{
                "backend": {"type": "log", "path": "/tmp/pv", "sync_writes": true},
                "writer": {"workers": 8, "size_check_interval": 0.25, "overflow_policy": "block"}
            }"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(
            config.backend,
            BackendConfig::Log {
                path: PathBuf::from("/tmp/pv"),
                sync_writes: true,
            }
        );
        assert_eq!(config.writer.workers, 8);
        assert_eq!(config.writer.size_check_interval, Duration::from_millis(250));
        assert_eq!(config.writer.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.writer.batch_size, 500);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempdir().unwrap();
        match EngineConfig::load(dir.path().join("missing.json")).unwrap_err() {
            PointVaultError::Config(ConfigError::Load { .. }) => {}
            other => panic!("Expected Load, got: {other:?}"),
        }

        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{"writer": {"retry_backoff": -1.0}}"#).unwrap();
        match EngineConfig::load(&path).unwrap_err() {
            PointVaultError::Config(ConfigError::Parse { .. }) => {}
            other => panic!("Expected Parse, got: {other:?}"),
        }

        fs::write(&path, r#"{"writer": {"workers": 0}}"#).unwrap();
        match EngineConfig::load(&path).unwrap_err() {
            PointVaultError::Config(ConfigError::Invalid { field, .. }) => {
                assert_eq!(field, "workers");
            }
            other => panic!("Expected Invalid, got: {other:?}"),
        }
    }
}
