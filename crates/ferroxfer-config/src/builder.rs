//! Layered loading of [`EngineOptions`]

use crate::{ConfigResult, EngineOptions};
use config::{Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Builder that layers defaults, files and environment variables
#[derive(Debug)]
pub struct ConfigBuilder {
    sources: Vec<ConfigSource>,
    env_separator: String,
}

#[derive(Debug, Clone)]
enum ConfigSource {
    File { path: PathBuf, format: FileFormat },
    Defaults,
    Environment { prefix: String },
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            env_separator: "__".to_string(),
        }
    }

    /// Add default configuration values
    pub fn add_defaults(mut self) -> Self {
        self.sources.push(ConfigSource::Defaults);
        self
    }

    /// Add a configuration file source, format detected from the extension
    ///
    /// Missing files are skipped.
    pub fn add_source_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let format = Self::detect_format(&path);
        self.sources.push(ConfigSource::File { path, format });
        self
    }

    /// Add a configuration file source with explicit format
    pub fn add_source_file_with_format<P: AsRef<Path>>(
        mut self,
        path: P,
        format: FileFormat,
    ) -> Self {
        let path = path.as_ref().to_path_buf();
        self.sources.push(ConfigSource::File { path, format });
        self
    }

    /// Add environment variable source with prefix
    pub fn add_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.sources.push(ConfigSource::Environment {
            prefix: prefix.into(),
        });
        self
    }

    /// Set environment variable separator (default: "__")
    pub fn env_separator<S: Into<String>>(mut self, separator: S) -> Self {
        self.env_separator = separator.into();
        self
    }

    /// Build and validate the options
    pub fn build(self) -> ConfigResult<EngineOptions> {
        // Defaults are always the base layer so partial files deserialize
        let mut inner =
            config::Config::builder().add_source(config::Config::try_from(&EngineOptions::default())?);

        for source in &self.sources {
            match source {
                ConfigSource::File { path, format } => {
                    if path.exists() {
                        debug!("Loading options from {}", path.display());
                        inner = inner.add_source(File::from(path.clone()).format(*format));
                    }
                }
                ConfigSource::Environment { prefix } => {
                    inner = inner.add_source(
                        Environment::with_prefix(prefix).separator(&self.env_separator),
                    );
                }
                ConfigSource::Defaults => {}
            }
        }

        let options: EngineOptions = inner.build()?.try_deserialize()?;
        options.validate()?;

        Ok(options)
    }

    /// Try to build the options, returning defaults on error
    pub fn build_or_default(self) -> EngineOptions {
        self.build().unwrap_or_default()
    }

    fn detect_format(path: &Path) -> FileFormat {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("json") => FileFormat::Json,
            _ => FileFormat::Yaml,
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_builder_defaults() {
        let options = ConfigBuilder::new().add_defaults().build().unwrap();
        assert_eq!(options, EngineOptions::default());
    }

    #[test]
    fn test_builder_yaml_file() {
        let mut temp_file = Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            temp_file,
            r#"
limit_ports: true
limit_ports_low: 50000
limit_ports_high: 50100
fsync: true
"#
        )
        .unwrap();

        let options = ConfigBuilder::new()
            .add_defaults()
            .add_source_file(temp_file.path())
            .build()
            .unwrap();

        assert!(options.limit_ports);
        assert_eq!(options.limit_ports_low, 50000);
        assert_eq!(options.limit_ports_high, 50100);
        assert!(options.fsync);
        assert_eq!(options.buffer_size, crate::DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_builder_env_override() {
        std::env::set_var("FXBUILDERTEST__BUFFER_SIZE", "65536");
        let options = ConfigBuilder::new()
            .add_defaults()
            .add_env_prefix("FXBUILDERTEST")
            .build()
            .unwrap();
        std::env::remove_var("FXBUILDERTEST__BUFFER_SIZE");

        assert_eq!(options.buffer_size, 65536);
    }

    #[test]
    fn test_builder_validation() {
        let mut temp_file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(temp_file, "buffer_size = 16").unwrap();

        let result = ConfigBuilder::new()
            .add_defaults()
            .add_source_file(temp_file.path())
            .build();

        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Buffer size must be at least 4096 bytes"));
    }
}
