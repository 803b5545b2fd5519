//! Configuration validation.

use super::{Config, InputFormat};
use crate::core::traits::Backend;
use crate::drivers::SslMode;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.root_table.trim().is_empty() {
        return Err(MigrateError::Config("source.root_table is required".into()));
    }
    if config.source.format == InputFormat::Tables && config.source.schema_path.is_none() {
        return Err(MigrateError::Config(
            "source.schema_path is required when source.format is 'tables'".into(),
        ));
    }

    // Target validation
    let target = &config.target;
    match target.r#type {
        Backend::Postgres | Backend::Mysql | Backend::Mssql => {
            if target.host.is_empty() {
                return Err(MigrateError::Config("target.host is required".into()));
            }
            if target.database.is_empty() {
                return Err(MigrateError::Config("target.database is required".into()));
            }
            if target.user.is_empty() {
                return Err(MigrateError::Config("target.user is required".into()));
            }
        }
        Backend::Mongodb => {
            if target.uri.is_none() && target.host.is_empty() {
                return Err(MigrateError::Config(
                    "target.uri or target.host is required for mongodb".into(),
                ));
            }
            if target.database.is_empty() {
                return Err(MigrateError::Config("target.database is required".into()));
            }
        }
        Backend::Memory => {}
    }

    if target.fail_on_table.is_some() && target.r#type != Backend::Memory {
        return Err(MigrateError::Config(
            "target.fail_on_table is only supported by the memory target".into(),
        ));
    }

    target.ssl_mode.parse::<SslMode>()?;

    // Migration config validation
    if config.migration.chunk_size == 0 {
        return Err(MigrateError::Config(
            "migration.chunk_size must be at least 1".into(),
        ));
    }
    if config.migration.max_connections == 0 {
        return Err(MigrateError::Config(
            "migration.max_connections must be at least 1".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationConfig, SourceConfig, TargetConfig};

    fn valid_config() -> Config {
        Config {
            source: SourceConfig::default(),
            target: TargetConfig {
                r#type: Backend::Postgres,
                host: "localhost".to_string(),
                port: Some(5432),
                database: "target_db".to_string(),
                user: "postgres".to_string(),
                password: "password".to_string(),
                schema: None,
                ssl_mode: "disable".to_string(),
                uri: None,
                fail_on_table: None,
            },
            migration: MigrationConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_target_host() {
        let mut config = valid_config();
        config.target.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_memory_target_needs_nothing() {
        let mut config = valid_config();
        config.target = TargetConfig::memory();
        config.target.fail_on_table = Some("users".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_fail_on_table_rejected_for_real_backends() {
        let mut config = valid_config();
        config.target.fail_on_table = Some("users".into());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_tables_format_requires_schema_path() {
        let mut config = valid_config();
        config.source.format = InputFormat::Tables;
        assert!(validate(&config).is_err());
        config.source.schema_path = Some("schema.json".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_chunk_size() {
        let mut config = valid_config();
        config.migration.chunk_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_ssl_mode() {
        let mut config = valid_config();
        config.target.ssl_mode = "sometimes".into();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_target_config_debug_redacts_password() {
        let mut config = valid_config();
        config.target.password = "super_secret_password_456".to_string();
        let debug_output = format!("{:?}", config.target);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_password_456"),
            "Debug output should not contain actual password value"
        );
    }
}
