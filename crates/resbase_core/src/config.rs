//! Repository configuration.
//!
//! # Responsibility
//! - Describe where the repository database lives and how connections and
//!   attribute handlers are bootstrapped.
//! - Parse configuration documents supplied by the embedding application.
//!
//! # Invariants
//! - Every field has a default, so an empty document is a valid config.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// Database location for the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatabaseLocation {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
}

/// Top-level repository configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub database: DatabaseLocation,
    /// SQLite busy timeout applied on connection bootstrap.
    pub busy_timeout_ms: u64,
    /// Scan attribute side tables into memory when the schema is activated.
    pub preload_attribute_values: bool,
    /// Log level passed to `init_logging`; `None` uses `default_log_level()`.
    pub log_level: Option<String>,
    /// Absolute log directory; logging stays uninitialized when absent.
    pub log_dir: Option<PathBuf>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            database: DatabaseLocation::Memory,
            busy_timeout_ms: 5_000,
            preload_attribute_values: false,
            log_level: None,
            log_dir: None,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read repository config: {err}"),
            Self::Parse(err) => write!(f, "invalid repository config: {err}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
        }
    }
}

impl RepositoryConfig {
    /// Parses a JSON configuration document.
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(document).map_err(ConfigError::Parse)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_json_str(&document)
    }

    /// File-backed config with defaults for everything else.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            database: DatabaseLocation::File { path: path.into() },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DatabaseLocation, RepositoryConfig};
    use std::path::PathBuf;

    #[test]
    fn empty_document_uses_defaults() {
        let config = RepositoryConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RepositoryConfig::default());
        assert_eq!(config.busy_timeout_ms, 5_000);
        assert_eq!(config.database, DatabaseLocation::Memory);
    }

    #[test]
    fn parses_file_location_and_flags() {
        let config = RepositoryConfig::from_json_str(
            r#"{
                "database": { "kind": "file", "path": "/var/lib/resbase/repo.db" },
                "busy_timeout_ms": 250,
                "preload_attribute_values": true,
                "log_level": "debug"
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.database,
            DatabaseLocation::File {
                path: PathBuf::from("/var/lib/resbase/repo.db")
            }
        );
        assert_eq!(config.busy_timeout_ms, 250);
        assert!(config.preload_attribute_values);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn rejects_unknown_location_kind() {
        let err = RepositoryConfig::from_json_str(r#"{ "database": { "kind": "cloud" } }"#)
            .unwrap_err();
        assert!(err.to_string().contains("invalid repository config"));
    }
}
