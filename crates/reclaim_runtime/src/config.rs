//! Runtime configuration
//!
//! Groups the collector settings with the logging settings so both can be
//! loaded from one TOML file and overridden from the environment.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{GcError, GcResult};
use crate::memory::config::GcConfig;

/// Complete runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Garbage collection configuration
    pub gc: GcConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            gc: GcConfig::from_env(),
            logging: LoggingConfig::from_env(),
        }
    }

    /// Load configuration from TOML file
    #[cfg(feature = "toml-config")]
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML file (stub when toml feature is disabled)
    #[cfg(not(feature = "toml-config"))]
    pub fn from_file(_path: &Path) -> anyhow::Result<Self> {
        anyhow::bail!("TOML support not enabled. Enable the 'toml-config' feature.")
    }

    /// Save configuration to TOML file
    #[cfg(feature = "toml-config")]
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Save configuration to TOML file (stub when toml feature is disabled)
    #[cfg(not(feature = "toml-config"))]
    pub fn save_to_file(&self, _path: &Path) -> anyhow::Result<()> {
        anyhow::bail!("TOML support not enabled. Enable the 'toml-config' feature.")
    }

    /// Merge with environment variables (env vars take precedence)
    #[must_use]
    pub fn merge_with_env(mut self) -> Self {
        self.gc.apply_env();
        if let Ok(filter) = std::env::var("RECLAIM_LOG") {
            self.logging.filter = Some(filter);
        }
        self
    }

    /// Reject settings the collector cannot run with.
    pub fn validate(&self) -> GcResult<()> {
        if self.gc.min_objects_per_task == 0 {
            return Err(GcError::Config {
                key: "gc.min_objects_per_task",
                value: "0".to_string(),
            });
        }
        let limit = self.gc.incremental_purge_time_limit_ms;
        if !limit.is_finite() || limit < 0.0 {
            return Err(GcError::Config {
                key: "gc.incremental_purge_time_limit_ms",
                value: limit.to_string(),
            });
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` still wins when set
    pub filter: Option<String>,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self {
            filter: std::env::var("RECLAIM_LOG").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.gc.min_objects_per_task, 128);
        assert!(config.logging.filter.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = RuntimeConfig::default();
        config.gc.min_objects_per_task = 0;
        assert_eq!(
            config.validate(),
            Err(GcError::Config {
                key: "gc.min_objects_per_task",
                value: "0".to_string(),
            })
        );
    }

    #[test]
    fn test_validate_rejects_negative_time_limit() {
        let mut config = RuntimeConfig::default();
        config.gc.incremental_purge_time_limit_ms = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[cfg(not(feature = "toml-config"))]
    fn test_file_loading_requires_feature() {
        let error = RuntimeConfig::from_file(Path::new("reclaim.toml")).unwrap_err();
        assert!(error.to_string().contains("toml-config"));
    }

    #[test]
    #[cfg(feature = "toml-config")]
    fn test_partial_toml_keeps_defaults() {
        let config: RuntimeConfig = toml::from_str(
            "[gc]\nworker_threads = 2\nmember_reference_keeps_cluster = true\n",
        )
        .unwrap();
        assert_eq!(config.gc.worker_threads, 2);
        assert!(config.gc.member_reference_keeps_cluster);
        assert_eq!(config.gc.min_objects_per_task, 128);
        assert!(config.logging.filter.is_none());
    }

    #[test]
    #[cfg(feature = "toml-config")]
    fn test_config_serialization() {
        let mut config = RuntimeConfig::default();
        config.logging.filter = Some("reclaim_runtime=debug".to_string());
        let toml = toml::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = toml::from_str(&toml).unwrap();
        assert_eq!(config, deserialized);
    }
}
