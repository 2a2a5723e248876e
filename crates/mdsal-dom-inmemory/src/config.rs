//! Store configuration, loaded from TOML or JSON.

use mdsal_dom_spi::InstanceIdentifier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors loading or checking a [`StoreConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    /// The file is not valid JSON for this schema.
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    /// Only `.toml` and `.json` files are understood.
    #[error("unsupported config file extension: {0}")]
    UnsupportedExtension(String),
    /// The configuration parsed but makes no sense.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where backend chain commits run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitMode {
    /// On the submitting thread.
    #[default]
    Inline,
    /// On a tokio worker per chain.
    Spawned,
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is not set.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: String::from("info"),
            json: false,
        }
    }
}

/// Configuration of an in-memory data store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store name, used in log output.
    pub name: String,
    /// Where chain commits run.
    pub commit_mode: CommitMode,
    /// Commits kept per shard for conflict detection.
    pub history_depth: usize,
    /// Prefixes of the child shards attached below the root shard.
    pub shards: Vec<String>,
    /// Log output.
    pub logging: LoggingConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: String::from("operational"),
            commit_mode: CommitMode::Inline,
            history_depth: 64,
            shards: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Load a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: StoreConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => return Err(ConfigError::UnsupportedExtension(ext.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the settings and parse the shard prefixes, shortest first.
    pub fn validate(&self) -> Result<Vec<InstanceIdentifier>, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("store name must not be empty".to_string()));
        }
        if self.history_depth == 0 {
            return Err(ConfigError::Invalid("history_depth must be at least 1".to_string()));
        }

        let mut prefixes = BTreeSet::new();
        for text in &self.shards {
            let prefix: InstanceIdentifier = text
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("shard prefix {}: {}", text, e)))?;
            if prefix.is_empty() {
                return Err(ConfigError::Invalid("the root shard is implicit".to_string()));
            }
            if !prefixes.insert(prefix) {
                return Err(ConfigError::Invalid(format!("shard prefix {} listed twice", text)));
            }
        }
        let mut prefixes: Vec<_> = prefixes.into_iter().collect();
        prefixes.sort_by_key(InstanceIdentifier::len);
        Ok(prefixes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = StoreConfig::default();
        assert_eq!(config.name, "operational");
        assert_eq!(config.commit_mode, CommitMode::Inline);
        assert_eq!(config.history_depth, 64);
        assert!(config.shards.is_empty());
        assert_eq!(config.logging.filter, "info");
        assert!(!config.logging.json);
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
name = "config"
commit_mode = "spawned"
shards = ["/network/topology", "/network"]

[logging]
json = true
            "#
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "config");
        assert_eq!(config.commit_mode, CommitMode::Spawned);
        assert_eq!(config.history_depth, 64);
        assert!(config.logging.json);
        assert_eq!(config.logging.filter, "info");

        let prefixes = config.validate().unwrap();
        assert_eq!(prefixes[0].to_string(), "/network");
        assert_eq!(prefixes[1].to_string(), "/network/topology");
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "name": "inventory",
                "history_depth": 8,
                "shards": ["/nodes/node[id=1]"]
            }}"#
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "inventory");
        assert_eq!(config.history_depth, 8);
        assert_eq!(config.commit_mode, CommitMode::Inline);
        assert_eq!(config.shards, vec!["/nodes/node[id=1]"]);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "name: test").unwrap();
        assert!(matches!(
            StoreConfig::from_file(file.path()),
            Err(ConfigError::UnsupportedExtension(ext)) if ext == "yaml"
        ));
    }

    #[test]
    fn test_from_file_missing() {
        let result = StoreConfig::from_file(Path::new("/nonexistent/store.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = StoreConfig {
            shards: vec!["network".to_string()],
            ..StoreConfig::default()
        };
        assert!(config.validate().is_err());

        config.shards = vec!["/".to_string()];
        assert!(config.validate().is_err());

        config.shards = vec!["/a".to_string(), "/a".to_string()];
        assert!(config.validate().is_err());

        config.shards.clear();
        config.history_depth = 0;
        assert!(config.validate().is_err());
    }
}
