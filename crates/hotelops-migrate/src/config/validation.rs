//! Configuration validation.

use super::{Config, DatabaseConfig};
use crate::drivers::SslMode;
use crate::error::{MigrateError, Result};

fn validate_database(side: &str, db: &DatabaseConfig) -> Result<()> {
    if db.host.is_empty() {
        return Err(MigrateError::Config(format!("{}.host is required", side)));
    }
    if db.database.is_empty() {
        return Err(MigrateError::Config(format!("{}.database is required", side)));
    }
    if db.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", side)));
    }
    if db.schema.is_empty() {
        return Err(MigrateError::Config(format!("{}.schema cannot be empty", side)));
    }
    if SslMode::parse(&db.ssl_mode).is_err() {
        return Err(MigrateError::Config(format!(
            "{}.ssl_mode '{}' is invalid. Valid values: disable, require, verify-ca, verify-full",
            side, db.ssl_mode
        )));
    }
    Ok(())
}

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_database("source", &config.source)?;
    validate_database("destination", &config.destination)?;

    // Cannot migrate into the schema being read
    if config.source.host == config.destination.host
        && config.source.port == config.destination.port
        && config.source.database == config.destination.database
        && config.source.schema == config.destination.schema
    {
        return Err(MigrateError::Config(
            "source and destination cannot be the same database schema".into(),
        ));
    }

    // Migration config validation - only check if explicitly set
    if let Some(0) = config.migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.batch_size {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.max_connections {
        return Err(MigrateError::Config(
            "migration.max_connections must be at least 1".into(),
        ));
    }

    if !(1..=100).contains(&config.verification.sample_percent) {
        return Err(MigrateError::Config(format!(
            "verification.sample_percent must be between 1 and 100, got {}",
            config.verification.sample_percent
        )));
    }

    if config.plan.tables.is_empty() {
        return Err(MigrateError::Config(
            "plan.tables must list at least one table".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BackupConfig, MigrationConfig, PlanConfig, ReportConfig, VerificationConfig,
    };
    use crate::plan::{ColumnMapping, TableSpec};

    fn database(host: &str, database: &str) -> DatabaseConfig {
        DatabaseConfig {
            host: host.to_string(),
            port: 5432,
            database: database.to_string(),
            user: "postgres".to_string(),
            password: "password".to_string(),
            schema: "public".to_string(),
            ssl_mode: "disable".to_string(),
        }
    }

    fn valid_config() -> Config {
        Config {
            source: database("localhost", "legacy"),
            destination: database("localhost", "hotelops"),
            migration: MigrationConfig::default(),
            verification: VerificationConfig::default(),
            backup: BackupConfig::default(),
            report: ReportConfig::default(),
            plan: PlanConfig {
                tables: vec![TableSpec::new(
                    "legacy_hotel",
                    "hotels",
                    vec!["id"],
                    vec![ColumnMapping::new("hotel_id", "id")],
                )],
            },
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_same_schema_rejected() {
        let mut config = valid_config();
        config.destination.database = "legacy".to_string();
        assert!(validate(&config).is_err());

        // Same database, different schema is a supported layout.
        config.destination.schema = "hotelops".to_string();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_ssl_mode() {
        let mut config = valid_config();
        config.destination.ssl_mode = "sometimes".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("destination"));
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = valid_config();
        config.migration.batch_size = Some(0);
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.migration.workers = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_sample_percent_range() {
        let mut config = valid_config();
        config.verification.sample_percent = 0;
        assert!(validate(&config).is_err());
        config.verification.sample_percent = 101;
        assert!(validate(&config).is_err());
        config.verification.sample_percent = 100;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_empty_plan_rejected() {
        let mut config = valid_config();
        config.plan.tables.clear();
        assert_eq!(validate(&config).unwrap_err().exit_code(), 1);
    }

    #[test]
    fn test_database_config_debug_redacts_password() {
        let mut config = valid_config();
        config.source.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.source);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_password_123"),
            "Debug output should not contain actual password value"
        );
    }
}
