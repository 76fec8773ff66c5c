//! # hotelops-migrate
//!
//! Moves hotel-operations data from a legacy PostgreSQL schema into a new one.
//!
//! A run resolves a dependency-ordered plan of table mappings, snapshots the
//! destination, then loads each table inside its own transaction and verifies
//! it before moving on. The first failure halts the run and restores the
//! snapshot, so the destination is either fully migrated or back where it
//! started.
//!
//! - **Typed plans** validated before any row is read
//! - **Per-table transactions** with truncate or append loading
//! - **Verification** by row count or order-independent checksum
//! - **Snapshots and rollback** with SHA-256 checked artifacts
//! - **JSON run reports** with a recovery hint naming the snapshot
//!
//! ## Example
//!
//! ```rust,no_run
//! use hotelops_migrate::{Config, MigrateOptions, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> hotelops_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let report = orchestrator
//!         .run(MigrateOptions::default(), CancellationToken::new())
//!         .await?;
//!     println!("{}", report.render_text());
//!     std::process::exit(i32::from(report.exit_code));
//! }
//! ```

pub mod backup;
pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod migrator;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod rollback;
pub mod state;
pub mod verify;

// Re-exports for convenient access
pub use backup::{BackupManager, BackupSnapshot, SnapshotManifest};
pub use config::{Config, LoadMode, MigrationConfig, VerificationLevel};
pub use crate::core::{ColumnInfo, Row, SqlValue};
pub use drivers::{MemoryDatabase, PostgresDatabase};
pub use error::{MigrateError, PlanError, Result};
pub use orchestrator::{HealthCheckResult, MigrateOptions, Orchestrator};
pub use plan::{ColumnMapping, Literal, MigrationPlan, TableSpec, Transform};
pub use report::MigrationReport;
pub use rollback::{RollbackManager, RollbackResult};
pub use state::{MigrationRun, RunMode, RunStatus, TableStatus};
pub use verify::{CountReport, VerificationEngine, VerificationResult};
