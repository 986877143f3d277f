//! Common loading patterns for [`EngineOptions`]

use crate::{ConfigBuilder, ConfigError, ConfigResult, EngineOptions};
use std::path::{Path, PathBuf};

/// Environment variable prefix used by the default loaders
pub const ENV_PREFIX: &str = "FERROXFER";

/// Options loader with common loading patterns
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load options from the first config file found in the working
    /// directory, then the environment
    pub fn load_default() -> ConfigResult<EngineOptions> {
        let mut builder = ConfigBuilder::new().add_defaults();

        if let Some(path) = Self::config_exists() {
            builder = builder.add_source_file(path);
        }

        builder.add_env_prefix(ENV_PREFIX).build()
    }

    /// Load options from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<EngineOptions> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Configuration file not found",
                ),
            });
        }

        ConfigBuilder::new()
            .add_defaults()
            .add_source_file(path)
            .add_env_prefix(ENV_PREFIX)
            .build()
    }

    /// Save options to a file, format chosen by extension
    pub fn save_to_file<P: AsRef<Path>>(options: &EngineOptions, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::to_string_pretty(options).map_err(|e| {
                ConfigError::serialization(format!("Failed to serialize to TOML: {}", e))
            })?,
            Some("json") => serde_json::to_string_pretty(options).map_err(|e| {
                ConfigError::serialization(format!("Failed to serialize to JSON: {}", e))
            })?,
            _ => serde_yaml::to_string(options).map_err(|e| {
                ConfigError::serialization(format!("Failed to serialize to YAML: {}", e))
            })?,
        };

        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// First existing config file of the default candidates
    pub fn config_exists() -> Option<PathBuf> {
        ["ferroxfer.yaml", "ferroxfer.yml", "ferroxfer.toml", "ferroxfer.json"]
            .into_iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}
