//! Configuration type definitions with auto-tuning based on system resources.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::plan::TableSpec;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Legacy database rows are read from.
    pub source: DatabaseConfig,

    /// New database rows are written to.
    #[serde(alias = "target")]
    pub destination: DatabaseConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Post-load verification.
    #[serde(default)]
    pub verification: VerificationConfig,

    /// Snapshot storage.
    #[serde(default)]
    pub backup: BackupConfig,

    /// Run report storage.
    #[serde(default)]
    pub report: ReportConfig,

    /// Table mappings.
    #[serde(default)]
    pub plan: PlanConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Connection settings for one PostgreSQL database.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schema holding the tables (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode: disable, require, verify-ca, verify-full (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

impl DatabaseConfig {
    /// `host:port/database`, for log lines and health checks.
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// How rows are loaded into a destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Empty the table inside the load transaction before inserting.
    #[default]
    Truncate,

    /// Insert next to the rows already present.
    Append,
}

/// Migration behavior configuration.
/// Performance-related fields use Option<T> to distinguish between
/// "not set" (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationConfig {
    /// Rows per page read from the source. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Tables migrated concurrently within one dependency level (default: 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Pool size per database. Auto-tuned based on workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// Load mode (default: truncate).
    #[serde(default)]
    pub load_mode: LoadMode,

    /// Exercise destination inserts during a dry run (always rolled back).
    #[serde(default)]
    pub dry_run_writes: bool,
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;

        // Batch size: 1K rows, +1K per 4GB of RAM, cap at 10K
        if self.batch_size.is_none() {
            let batch = 1_000 + ((ram_gb / 4.0) as usize * 1_000);
            self.batch_size = Some(batch.clamp(1_000, 10_000));
        }

        let workers = self.get_workers();

        // Every worker holds one destination transaction plus one source reader
        if self.max_connections.is_none() {
            self.max_connections = Some((workers * 2 + 2).clamp(4, 32));
        }

        info!(
            "Auto-tuned config: batch_size={}, workers={}, max_connections={}",
            self.get_batch_size(),
            workers,
            self.get_max_connections(),
        );

        self
    }

    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(1_000)
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(1)
    }

    pub fn get_max_connections(&self) -> usize {
        self.max_connections.unwrap_or(4)
    }
}

/// Strictness of post-load verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLevel {
    /// Row counts only.
    #[default]
    Count,

    /// Row counts plus a checksum over a content-selected sample of rows.
    Sampled,

    /// Row counts plus a checksum over every row.
    Full,
}

impl fmt::Display for VerificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationLevel::Count => write!(f, "count"),
            VerificationLevel::Sampled => write!(f, "sampled"),
            VerificationLevel::Full => write!(f, "full"),
        }
    }
}

/// Verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default)]
    pub level: VerificationLevel,

    /// Share of rows checksummed at the `sampled` level, 1-100 (default: 10).
    #[serde(default = "default_sample_percent")]
    pub sample_percent: u8,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            level: VerificationLevel::default(),
            sample_percent: default_sample_percent(),
        }
    }
}

/// Backup snapshot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory snapshots are written to (default: "backups").
    #[serde(default = "default_backup_dir")]
    pub directory: PathBuf,

    /// Also export the source tables for audit.
    #[serde(default)]
    pub include_source: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: default_backup_dir(),
            include_source: false,
        }
    }
}

/// Report output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Directory run reports are written to (default: "reports").
    #[serde(default = "default_report_dir")]
    pub directory: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            directory: default_report_dir(),
        }
    }
}

/// The configured table mappings, in configuration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default)]
    pub tables: Vec<TableSpec>,
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_sample_percent() -> u8 {
    10
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("reports")
}
