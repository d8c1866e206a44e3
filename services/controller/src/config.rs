//! Controller configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::Phase;

/// Default path of the LOD tool.
pub const DEFAULT_LOD_PATH: &str = "/usr/sbin/lod";

/// Fallback timeout for setup and teardown.
pub const DEFAULT_OTHER_TIMEOUT: Duration = Duration::from_secs(300);

/// Fallback timeout for stage-in and stage-out copies.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Burst buffer controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// LOD executable invoked for every phase.
    pub lod_path: PathBuf,

    /// LOD configuration file consulted when `setup` omits device lists.
    pub lod_conf_path: PathBuf,

    /// Stage-in timeout in seconds.
    pub stage_in_timeout_secs: Option<u64>,

    /// Stage-out timeout in seconds.
    pub stage_out_timeout_secs: Option<u64>,

    /// Timeout for every other phase, and fallback for staging.
    pub other_timeout_secs: Option<u64>,

    /// How long shutdown waits for outstanding workers.
    pub drain_timeout_secs: u64,

    /// Log every entry point at info level.
    pub debug: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            lod_path: PathBuf::from(DEFAULT_LOD_PATH),
            lod_conf_path: PathBuf::from(lodbb_directives::DEFAULT_LOD_CONF),
            stage_in_timeout_secs: None,
            stage_out_timeout_secs: None,
            other_timeout_secs: None,
            drain_timeout_secs: 10,
            debug: false,
        }
    }
}

fn env_secs(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}

impl ControllerConfig {
    /// Load configuration from `LODBB_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let lod_path = std::env::var("LODBB_LOD_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.lod_path);

        let lod_conf_path = std::env::var("LODBB_CONF_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.lod_conf_path);

        let debug = std::env::var("LODBB_DEBUG")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            lod_path,
            lod_conf_path,
            stage_in_timeout_secs: env_secs("LODBB_STAGE_IN_TIMEOUT")?,
            stage_out_timeout_secs: env_secs("LODBB_STAGE_OUT_TIMEOUT")?,
            other_timeout_secs: env_secs("LODBB_OTHER_TIMEOUT")?,
            drain_timeout_secs: env_secs("LODBB_DRAIN_TIMEOUT")?
                .unwrap_or(defaults.drain_timeout_secs),
            debug,
        })
    }

    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Timeout for one phase.
    ///
    /// Resolution order: the phase's own setting, then `other_timeout_secs`,
    /// then the built-in default for the phase.
    pub fn timeout_for(&self, phase: Phase) -> Duration {
        let specific = match phase {
            Phase::StageIn => self.stage_in_timeout_secs,
            Phase::StageOut => self.stage_out_timeout_secs,
            Phase::Setup | Phase::Teardown => None,
        };
        let fallback = match phase {
            Phase::StageIn | Phase::StageOut => DEFAULT_STAGE_TIMEOUT,
            Phase::Setup | Phase::Teardown => DEFAULT_OTHER_TIMEOUT,
        };
        specific
            .or(self.other_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(fallback)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let config = ControllerConfig::default();
        assert_eq!(config.timeout_for(Phase::Setup), DEFAULT_OTHER_TIMEOUT);
        assert_eq!(config.timeout_for(Phase::Teardown), DEFAULT_OTHER_TIMEOUT);
        assert_eq!(config.timeout_for(Phase::StageIn), DEFAULT_STAGE_TIMEOUT);
        assert_eq!(config.timeout_for(Phase::StageOut), DEFAULT_STAGE_TIMEOUT);
    }

    #[test]
    fn test_other_timeout_is_the_fallback() {
        let config = ControllerConfig {
            other_timeout_secs: Some(60),
            stage_out_timeout_secs: Some(7200),
            ..Default::default()
        };
        assert_eq!(config.timeout_for(Phase::Setup), Duration::from_secs(60));
        assert_eq!(config.timeout_for(Phase::StageIn), Duration::from_secs(60));
        assert_eq!(config.timeout_for(Phase::StageOut), Duration::from_secs(7200));
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lodbb.toml");
        std::fs::write(
            &path,
            "lod_path = \"/opt/lod/bin/lod\"\nother_timeout_secs = 120\ndebug = true\n",
        )
        .unwrap();

        let config = ControllerConfig::from_file(&path).unwrap();
        assert_eq!(config.lod_path, PathBuf::from("/opt/lod/bin/lod"));
        assert_eq!(config.other_timeout_secs, Some(120));
        assert!(config.debug);
        assert_eq!(config.drain_timeout_secs, 10);
        assert_eq!(config.lod_conf_path, PathBuf::from("/etc/lod.conf"));
    }

    #[test]
    fn test_from_file_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lodbb.toml");
        std::fs::write(&path, "other_timeout_secs = \"soon\"\n").unwrap();

        let err = ControllerConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
