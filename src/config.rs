//! `relq.toml` configuration.
//!
//! ```toml
//! schema = "schema.toml"
//!
//! [database]
//! url = "postgres://localhost/transit"
//! max_connections = 10
//! ```
//!
//! `RELQ_DATABASE_URL` overrides `database.url`.

use crate::error::{RelqError, RelqResult};
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "relq.toml";
pub const DATABASE_URL_ENV: &str = "RELQ_DATABASE_URL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelqConfig {
    pub database: DatabaseConfig,
    /// Schema description loaded by [`RelqConfig::load_schema`].
    pub schema: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

impl RelqConfig {
    pub fn from_toml_str(content: &str) -> RelqResult<Self> {
        toml::from_str(content).map_err(|e| RelqError::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> RelqResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| RelqError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// `./relq.toml`, then `<config dir>/relq/relq.toml`, then defaults;
    /// `RELQ_DATABASE_URL` is applied last.
    pub fn load() -> RelqResult<Self> {
        let candidates = std::iter::once(PathBuf::from(CONFIG_FILE))
            .chain(dirs::config_dir().map(|dir| dir.join("relq").join(CONFIG_FILE)));

        let mut config = None;
        for path in candidates {
            if path.exists() {
                config = Some(Self::load_from_file(&path)?);
                break;
            }
        }
        let config = config.unwrap_or_else(|| {
            tracing::debug!("No {} found, using defaults", CONFIG_FILE);
            Self::default()
        });
        Ok(config.with_database_url_override(std::env::var(DATABASE_URL_ENV).ok()))
    }

    pub fn with_database_url_override(mut self, url: Option<String>) -> Self {
        if let Some(url) = url.filter(|url| !url.is_empty()) {
            tracing::debug!("database.url overridden by {}", DATABASE_URL_ENV);
            self.database.url = Some(url);
        }
        self
    }

    /// Load the configured schema file, if any.
    pub fn load_schema(&self) -> RelqResult<Option<Schema>> {
        self.schema
            .as_ref()
            .map(|path| Schema::load_from_file(path))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelqConfig::from_toml_str("").unwrap();
        assert_eq!(config, RelqConfig::default());
        assert_eq!(config.database.max_connections, 5);
        assert!(config.load_schema().unwrap().is_none());
    }

    #[test]
    fn test_parse_database_section() {
        let config = RelqConfig::from_toml_str(
            r#"
            schema = "schema.toml"

            [database]
            url = "sqlite::memory:"
            "#,
        )
        .unwrap();
        assert_eq!(config.database.url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.schema, Some(PathBuf::from("schema.toml")));
    }

    #[test]
    fn test_url_override() {
        let config = RelqConfig::default()
            .with_database_url_override(Some("postgres://db/x".to_string()));
        assert_eq!(config.database.url.as_deref(), Some("postgres://db/x"));

        let unchanged = config.clone().with_database_url_override(Some(String::new()));
        assert_eq!(unchanged, config);
    }

    #[test]
    fn test_parse_error() {
        let err = RelqConfig::from_toml_str("[database\nurl = 1").unwrap_err();
        assert!(matches!(err, RelqError::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = RelqConfig::load_from_file("/nonexistent/relq.toml").unwrap_err();
        assert!(matches!(err, RelqError::Config(msg) if msg.contains("/nonexistent/relq.toml")));
    }
}
