use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::builder::BuildOptions;
use common::hash::HashMode;
use common::session::SyncOptions;
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "nereid";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Settings read from `~/.nereid/config.toml`.
///  Every field is optional; command line flags win over the file,
///  the file wins over the library defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub build: BuildConfig,
    pub sync: SyncConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub hash_mode: Option<HashMode>,
    pub chunk_size: Option<usize>,
    pub index: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Used when no `--source` is given
    pub sources: Vec<String>,
    pub output: Option<PathBuf>,
    pub index: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_tasks: Option<usize>,
    pub retry: Option<u32>,
    pub check_file_hash: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// e.g. `info`, `debug`
    pub level: Option<String>,
    /// Also write daily rolling log files here
    pub dir: Option<PathBuf>,
}

impl AppConfig {
    /// Get the nereid directory path (default ~/.nereid)
    pub fn nereid_dir() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    /// Load the config at `custom_path`, or the default one if it exists.
    ///  An explicit path has to exist, a missing default file is not an error.
    pub fn load(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match custom_path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::MissingFile(path.to_path_buf()));
                }
                path.to_path_buf()
            }
            None => {
                let path = Self::nereid_dir()?.join(CONFIG_FILE_NAME);
                if !path.exists() {
                    return Ok(Self::default());
                }
                path
            }
        };

        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config_toml = fs::read_to_string(path)?;
        Ok(toml::from_str(&config_toml)?)
    }
}

impl BuildConfig {
    pub fn options(&self) -> BuildOptions {
        let defaults = BuildOptions::default();
        BuildOptions {
            hash_mode: self.hash_mode.unwrap_or(defaults.hash_mode),
            chunk_size: self.chunk_size.unwrap_or(defaults.chunk_size),
            index: self.index.clone().unwrap_or(defaults.index),
        }
    }
}

impl SyncConfig {
    pub fn options(&self) -> SyncOptions {
        let defaults = SyncOptions::default();
        SyncOptions {
            timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            check_file_hash: self.check_file_hash.unwrap_or(defaults.check_file_hash),
            index: self.index.clone().unwrap_or(defaults.index),
            output: self.output.clone().unwrap_or(defaults.output),
            max_task_count: self.max_tasks.unwrap_or(defaults.max_task_count),
            hash: None,
            retry: self.retry.unwrap_or(defaults.retry),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("config file not found: {0}")]
    MissingFile(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
