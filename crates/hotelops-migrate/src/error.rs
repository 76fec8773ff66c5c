//! Error types for the migration engine.

use thiserror::Error;

/// Process exit code: configuration error.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Process exit code: plan validation failure.
pub const EXIT_PLAN_ERROR: u8 = 2;
/// Process exit code: backup failure (nothing was migrated).
pub const EXIT_BACKUP_ERROR: u8 = 3;
/// Process exit code: migration or verification failure (automatic rollback attempted).
pub const EXIT_MIGRATION_ERROR: u8 = 4;
/// Process exit code: rollback failure (manual intervention required).
pub const EXIT_ROLLBACK_ERROR: u8 = 5;
/// Process exit code: run cancelled by the operator.
pub const EXIT_CANCELLED: u8 = 6;
/// Process exit code: file system error.
pub const EXIT_IO_ERROR: u8 = 7;
/// Process exit code: database connectivity error.
pub const EXIT_DATABASE_ERROR: u8 = 8;

/// Plan validation errors. All of them are raised before any data is read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency between tables: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A dependency references a table that is not part of the plan.
    #[error("Table {table} depends on unknown table {dependency}")]
    UnknownTable { table: String, dependency: String },

    /// A table depends on itself.
    #[error("Table {0} depends on itself")]
    SelfDependency(String),

    /// Two specs share the same destination table.
    #[error("Table {0} appears more than once in the plan")]
    DuplicateTable(String),

    /// A requested table is not part of the plan.
    #[error("Selected table {0} is not part of the migration plan")]
    UnknownSelection(String),

    /// A planned table does not exist in the live schema.
    #[error("Table {table} does not exist on the {side} database")]
    MissingTable { table: String, side: &'static str },

    /// A mapped column is missing from the live schema.
    #[error("Table {table}: column {column} does not exist on the {side} table")]
    UnknownColumn {
        table: String,
        column: String,
        side: &'static str,
    },

    /// A table spec is malformed.
    #[error("Invalid spec for table {table}: {message}")]
    InvalidSpec { table: String, message: String },
}

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Plan validation failed.
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    /// Snapshot creation or loading failed.
    #[error("Backup failed{}: {message}", .table.as_deref().map(|t| format!(" for table {}", t)).unwrap_or_default())]
    Backup {
        table: Option<String>,
        message: String,
    },

    /// Reading the source table failed.
    #[error("Source read failed for table {table}: {message}")]
    SourceRead { table: String, message: String },

    /// A row could not be transformed.
    #[error("Transform failed for table {table}, row {row}, column {column}: {message}")]
    Transform {
        table: String,
        row: String,
        column: String,
        message: String,
    },

    /// Writing to the destination table failed.
    #[error("Destination write failed for table {table}: {message}")]
    DestinationWrite { table: String, message: String },

    /// Post-load verification did not match.
    #[error("Verification mismatch for table {table}: expected {expected} rows, found {actual}{}", .detail.as_deref().map(|d| format!(" ({})", d)).unwrap_or_default())]
    VerificationMismatch {
        table: String,
        expected: i64,
        actual: i64,
        detail: Option<String>,
    },

    /// Restoring a snapshot failed. Data safety now depends on the retained snapshot.
    #[error("Rollback from snapshot {snapshot_id} failed: {message}")]
    Rollback {
        snapshot_id: String,
        message: String,
    },

    /// PostgreSQL connection or query error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Error reported by a non-PostgreSQL driver.
    #[error("Driver error: {0}")]
    Driver(String),

    /// A table outcome was moved through an illegal state transition.
    #[error("Invalid state transition for table {table}: {from} -> {to}")]
    InvalidTransition {
        table: String,
        from: String,
        to: String,
    },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Backup error, optionally scoped to a table.
    pub fn backup(table: Option<&str>, message: impl Into<String>) -> Self {
        MigrateError::Backup {
            table: table.map(str::to_string),
            message: message.into(),
        }
    }

    /// Create a SourceRead error.
    pub fn source_read(table: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::SourceRead {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Create a DestinationWrite error.
    pub fn destination_write(table: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::DestinationWrite {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Create a Rollback error.
    pub fn rollback(snapshot_id: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Rollback {
            snapshot_id: snapshot_id.into(),
            message: message.into(),
        }
    }

    /// Short machine-readable name of the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            MigrateError::Config(_) => "config",
            MigrateError::Plan(_) => "plan",
            MigrateError::Backup { .. } => "backup",
            MigrateError::SourceRead { .. } => "source_read",
            MigrateError::Transform { .. } => "transform",
            MigrateError::DestinationWrite { .. } => "destination_write",
            MigrateError::VerificationMismatch { .. } => "verification_mismatch",
            MigrateError::Rollback { .. } => "rollback",
            MigrateError::Postgres(_) | MigrateError::Pool { .. } | MigrateError::Driver(_) => {
                "database"
            }
            MigrateError::InvalidTransition { .. } => "state",
            MigrateError::Io(_) => "io",
            MigrateError::Yaml(_) => "config",
            MigrateError::Json(_) => "io",
            MigrateError::Cancelled => "cancelled",
        }
    }

    /// Table the error is attributed to, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            MigrateError::Backup { table, .. } => table.as_deref(),
            MigrateError::SourceRead { table, .. }
            | MigrateError::Transform { table, .. }
            | MigrateError::DestinationWrite { table, .. }
            | MigrateError::VerificationMismatch { table, .. }
            | MigrateError::InvalidTransition { table, .. } => Some(table),
            _ => None,
        }
    }

    /// Failing row identifier, for transform errors.
    pub fn row(&self) -> Option<&str> {
        match self {
            MigrateError::Transform { row, .. } => Some(row),
            _ => None,
        }
    }

    /// Whether the error is fatal to a single table (and so triggers the halt-and-rollback policy).
    pub fn is_table_failure(&self) -> bool {
        matches!(
            self,
            MigrateError::SourceRead { .. }
                | MigrateError::Transform { .. }
                | MigrateError::DestinationWrite { .. }
                | MigrateError::VerificationMismatch { .. }
        )
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => EXIT_CONFIG_ERROR,
            MigrateError::Plan(_) => EXIT_PLAN_ERROR,
            MigrateError::Backup { .. } => EXIT_BACKUP_ERROR,
            MigrateError::SourceRead { .. }
            | MigrateError::Transform { .. }
            | MigrateError::DestinationWrite { .. }
            | MigrateError::VerificationMismatch { .. }
            | MigrateError::InvalidTransition { .. } => EXIT_MIGRATION_ERROR,
            MigrateError::Rollback { .. } => EXIT_ROLLBACK_ERROR,
            MigrateError::Cancelled => EXIT_CANCELLED,
            MigrateError::Io(_) | MigrateError::Json(_) => EXIT_IO_ERROR,
            MigrateError::Postgres(_) | MigrateError::Pool { .. } | MigrateError::Driver(_) => {
                EXIT_DATABASE_ERROR
            }
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        // Add error chain for wrapped errors
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_phase() {
        let plan = MigrateError::Plan(PlanError::SelfDependency("hotels".into()));
        let backup = MigrateError::backup(Some("hotels"), "disk full");
        let migration = MigrateError::destination_write("hotels", "duplicate key");
        let rollback = MigrateError::rollback("20260101T000000000Z", "count mismatch");

        let codes = [
            plan.exit_code(),
            backup.exit_code(),
            migration.exit_code(),
            rollback.exit_code(),
        ];
        assert_eq!(codes, [EXIT_PLAN_ERROR, EXIT_BACKUP_ERROR, EXIT_MIGRATION_ERROR, EXIT_ROLLBACK_ERROR]);
    }

    #[test]
    fn test_transform_error_names_table_and_row() {
        let err = MigrateError::Transform {
            table: "reservations".into(),
            row: "id=7".into(),
            column: "check_in".into(),
            message: "invalid date".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("reservations"));
        assert!(msg.contains("id=7"));
        assert_eq!(err.table(), Some("reservations"));
        assert_eq!(err.row(), Some("id=7"));
        assert!(err.is_table_failure());
    }

    #[test]
    fn test_cycle_message_lists_path() {
        let err = PlanError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency between tables: a -> b -> a");
    }

    #[test]
    fn test_backup_message_without_table() {
        let err = MigrateError::backup(None, "directory exists");
        assert_eq!(err.to_string(), "Backup failed: directory exists");
    }
}
