//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for an in-memory run with default migration settings.
    pub fn memory() -> Self {
        Self {
            source: SourceConfig::default(),
            target: TargetConfig::memory(),
            migration: MigrationConfig::default(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA-256 fingerprint of the configuration, recorded in the run report.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl TargetConfig {
    /// Connection URI for MongoDB, built from host and port when `uri` is unset.
    pub fn mongodb_uri(&self) -> String {
        match &self.uri {
            Some(uri) => uri.clone(),
            None if self.user.is_empty() => {
                format!("mongodb://{}:{}", self.host, self.port())
            }
            None => format!(
                "mongodb://{}:{}@{}:{}",
                self.user,
                self.password,
                self.host,
                self.port()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::Backend;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml(
            r#"
source:
  path: users.json
  root_table: users
target:
  type: postgres
  host: db
  database: app
  user: app
  password: secret
"#,
        )
        .unwrap();

        assert_eq!(config.source.format, InputFormat::Json);
        assert_eq!(config.target.r#type, Backend::Postgres);
        assert_eq!(config.target.port(), 5432);
        assert_eq!(config.target.schema(), "public");
        assert_eq!(config.migration.chunk_size, 1000);
        assert_eq!(config.migration.target_mode, TargetMode::DropRecreate);
        assert!(config.migration.defer_constraints);
        assert!(!config.migration.parallel_waves);
    }

    #[test]
    fn test_schema_defaults_per_backend() {
        let mut target = TargetConfig::memory();
        target.r#type = Backend::Mssql;
        assert_eq!(target.schema(), "dbo");
        target.r#type = Backend::Mysql;
        target.database = "shop".into();
        assert_eq!(target.schema(), "shop");
        target.schema = Some("custom".into());
        assert_eq!(target.schema(), "custom");
    }

    #[test]
    fn test_hash_is_stable_and_sensitive() {
        let a = Config::memory();
        let mut b = Config::memory();
        assert_eq!(a.hash(), b.hash());
        b.migration.chunk_size = 10;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_mongodb_uri_fallback() {
        let mut target = TargetConfig::memory();
        target.r#type = Backend::Mongodb;
        target.host = "mongo".into();
        assert_eq!(target.mongodb_uri(), "mongodb://mongo:27017");
        target.uri = Some("mongodb://replica/?replicaSet=rs0".into());
        assert_eq!(target.mongodb_uri(), "mongodb://replica/?replicaSet=rs0");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "target:\n  type: memory\nmigration:\n  chunk_size: 50\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.migration.chunk_size, 50);
    }
}
