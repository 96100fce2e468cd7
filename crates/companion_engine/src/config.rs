use companion_engine_executor::{
    BridgeConfig, ExportNames, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_MODULE_PATH,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::logging::DEFAULT_LOG_LEVEL;

pub const ENV_WASM_PATH: &str = "COMPANION_ENGINE_WASM_PATH";
pub const ENV_DATA_DIR: &str = "COMPANION_ENGINE_DATA_DIR";
pub const ENV_IDLE_TIMEOUT_SECS: &str = "COMPANION_ENGINE_IDLE_TIMEOUT_SECS";
pub const ENV_HISTORY_LIMIT: &str = "COMPANION_ENGINE_HISTORY_LIMIT";
pub const ENV_MAX_OUTPUT_BYTES: &str = "COMPANION_ENGINE_MAX_OUTPUT_BYTES";
pub const ENV_LOG_LEVEL: &str = "COMPANION_ENGINE_LOG_LEVEL";
pub const ENV_LOG_FILE: &str = "COMPANION_ENGINE_LOG_FILE";

pub const DEFAULT_CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub wasm_path: PathBuf,
    pub data_dir: PathBuf,
    pub idle_timeout: Duration,
    pub history_limit: usize,
    pub max_output_bytes: u64,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            wasm_path: PathBuf::from(DEFAULT_MODULE_PATH),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_file: None,
        }
    }
}

impl HostConfig {
    pub fn from_default_sources() -> Result<Self, HostConfigError> {
        let config_path = Path::new(DEFAULT_CONFIG_FILE_NAME);
        if config_path.exists() {
            return Self::from_config_file(config_path);
        }
        Self::from_env()
    }

    /// Reads a flat TOML table keyed by the environment variable names. Keys
    /// missing from the file fall back to the process environment.
    pub fn from_config_file(path: &Path) -> Result<Self, HostConfigError> {
        let content = fs::read_to_string(path).map_err(|err| HostConfigError::ReadConfigFile {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        let value: toml::Value =
            toml::from_str(&content).map_err(|err| HostConfigError::ParseConfigFile {
                path: path.display().to_string(),
                message: err.to_string(),
            })?;
        let table = value
            .as_table()
            .ok_or_else(|| HostConfigError::ParseConfigFile {
                path: path.display().to_string(),
                message: "root is not a TOML table".to_string(),
            })?;

        Self::from_env_with(|key| {
            table
                .get(key)
                .and_then(toml_value_to_string)
                .or_else(|| std::env::var(key).ok())
        })
    }

    pub fn from_env() -> Result<Self, HostConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    fn from_env_with<F>(mut getter: F) -> Result<Self, HostConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(path) = non_empty(&mut getter, ENV_WASM_PATH) {
            config.wasm_path = PathBuf::from(path);
        }
        if let Some(path) = non_empty(&mut getter, ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(path);
        }
        if let Some(secs) = positive_number::<u64, _>(&mut getter, ENV_IDLE_TIMEOUT_SECS)? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(limit) = positive_number::<usize, _>(&mut getter, ENV_HISTORY_LIMIT)? {
            config.history_limit = limit;
        }
        if let Some(bytes) = positive_number::<u64, _>(&mut getter, ENV_MAX_OUTPUT_BYTES)? {
            config.max_output_bytes = bytes;
        }
        if let Some(level) = non_empty(&mut getter, ENV_LOG_LEVEL) {
            config.log_level = level;
        }
        config.log_file = non_empty(&mut getter, ENV_LOG_FILE).map(PathBuf::from);
        Ok(config)
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            module_path: self.wasm_path.clone(),
            exports: ExportNames::default(),
            max_output_bytes: self.max_output_bytes,
        }
    }
}

fn toml_value_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(value) => Some(value.clone()),
        toml::Value::Integer(value) => Some(value.to_string()),
        toml::Value::Float(value) => Some(value.to_string()),
        toml::Value::Boolean(value) => Some(value.to_string()),
        _ => None,
    }
}

fn non_empty<F>(getter: &mut F, key: &str) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    getter(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn positive_number<T, F>(getter: &mut F, key: &'static str) -> Result<Option<T>, HostConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = non_empty(getter, key) else {
        return Ok(None);
    };
    match value.parse::<T>() {
        Ok(number) if number > T::default() => Ok(Some(number)),
        _ => Err(HostConfigError::InvalidNumber { key, value }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostConfigError {
    #[error("invalid value for {key}: {value} (expected a positive integer)")]
    InvalidNumber { key: &'static str, value: String },
    #[error("read config file failed ({path}): {message}")]
    ReadConfigFile { path: String, message: String },
    #[error("parse config file failed ({path}): {message}")]
    ParseConfigFile { path: String, message: String },
}
