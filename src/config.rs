//! Explicit configuration passed into [`crate::repo::Repository::open`].
//!
//! Values come from `~/.flair/config.yaml` when it exists, then environment
//! overrides, then the defaults below.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:2112";
pub const DEFAULT_ZKML_URL: &str = "http://localhost:2003";

pub const ENV_API_BASE: &str = "FLAIR_API_BASE";
pub const ENV_TOKEN: &str = "FLAIR_TOKEN";
pub const ENV_ZKML_URL: &str = "FLAIR_ZKML_URL";

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
        source: serde_yaml::Error,
    },
    #[error("could not determine the home directory")]
    NoHome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    pub api_base_url: String,
    /// Bearer token presented to the ledger.
    pub auth_token: Option<String>,
    pub request_timeout_secs: u64,
    pub zkml_url: String,
    pub default_framework: String,
    pub retention: Retention,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            auth_token: None,
            request_timeout_secs: 30,
            zkml_url: DEFAULT_ZKML_URL.to_string(),
            default_framework: "safetensors".to_string(),
            retention: Retention::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Retention {
    /// Newest commits that keep their full params.
    pub full_params_window: usize,
    /// Newest commits kept locally after a push.
    pub commit_horizon: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Retention {
            full_params_window: 2,
            commit_horizon: 25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CacheConfig {
    /// Branches whose working artifacts stay cached.
    pub slots: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { slots: 4 }
    }
}

impl Config {
    /// `~/.flair/config.yaml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let base = BaseDirs::new().ok_or(ConfigError::NoHome)?;
        Ok(base.home_dir().join(".flair").join("config.yaml"))
    }

    /// Reads the user config file (if any) and applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        let mut config = Self::from_file(&path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parses `path`, falling back to defaults when the file does not exist.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Config::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(Config::default());
        }
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_BASE).filter(|v| !v.is_empty()) {
            self.api_base_url = url;
        }
        if let Some(token) = lookup(ENV_TOKEN).filter(|v| !v.is_empty()) {
            self.auth_token = Some(token);
        }
        if let Some(url) = lookup(ENV_ZKML_URL).filter(|v| !v.is_empty()) {
            self.zkml_url = url;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_file(&dir.path().join("config.yaml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.retention.full_params_window, 2);
        assert_eq!(config.retention.commit_horizon, 25);
        assert_eq!(config.cache.slots, 4);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "api_base_url: https://ledger.example\nretention:\n  commit_horizon: 5\n",
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.api_base_url, "https://ledger.example");
        assert_eq!(config.retention.commit_horizon, 5);
        assert_eq!(config.retention.full_params_window, 2);
        assert_eq!(config.zkml_url, DEFAULT_ZKML_URL);
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            ENV_API_BASE => Some("http://other:9".to_string()),
            ENV_TOKEN => Some("secret".to_string()),
            _ => None,
        });
        assert_eq!(config.api_base_url, "http://other:9");
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.zkml_url, DEFAULT_ZKML_URL);
    }
}
