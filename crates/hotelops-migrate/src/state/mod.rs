//! Run and per-table state.
//!
//! A [`MigrationRun`] is an explicit value owned by the orchestrator. It is
//! created when a run starts, updated only through [`MigrationRun::record`],
//! and frozen by [`MigrationRun::finalize`]. Each [`TableOutcome`] moves through
//! a small state machine; illegal moves are rejected.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};
use crate::rollback::TableRestore;
use crate::verify::VerificationResult;

/// Generate a run identifier: UTC timestamp plus a random suffix.
/// Snapshot ids reuse the run id of the run that took them.
pub fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S%3fZ"), &suffix[..8])
}

/// What the run was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    DryRun,
    TableSubset,
    Rollback,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Full => write!(f, "full"),
            RunMode::DryRun => write!(f, "dry_run"),
            RunMode::TableSubset => write!(f, "table_subset"),
            RunMode::Rollback => write!(f, "rollback"),
        }
    }
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Every selected table reached its terminal success state.
    Success,
    /// The run failed before any destination write committed.
    Failed,
    /// A table failed and the destination was restored from the snapshot.
    RolledBack,
    /// Restoring the snapshot failed. Manual intervention required.
    RollbackFailed,
    /// Cancelled by the operator; committed tables were kept.
    Partial,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::RolledBack => "rolled_back",
            RunStatus::RollbackFailed => "rollback_failed",
            RunStatus::Partial => "partial",
        };
        write!(f, "{}", s)
    }
}

/// Per-table status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Pending,
    Migrating,
    Verified,
    Failed,
    Simulated,
    RolledBack,
}

impl TableStatus {
    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(self, to: TableStatus) -> bool {
        use TableStatus::*;
        matches!(
            (self, to),
            (Pending, Migrating)
                | (Migrating, Verified)
                | (Migrating, Failed)
                | (Migrating, Simulated)
                | (Failed, RolledBack)
                | (Pending, RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TableStatus::Verified | TableStatus::Simulated | TableStatus::RolledBack
        )
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TableStatus::Pending => "pending",
            TableStatus::Migrating => "migrating",
            TableStatus::Verified => "verified",
            TableStatus::Failed => "failed",
            TableStatus::Simulated => "simulated",
            TableStatus::RolledBack => "rolled_back",
        };
        write!(f, "{}", s)
    }
}

/// Error detail recorded on an outcome or run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error category (see [`MigrateError::kind`]).
    pub kind: String,
    pub message: String,
    /// Failing row identifier, e.g. `id=7`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<String>,
    /// Process exit code this error maps to.
    pub exit_code: u8,
}

impl From<&MigrateError> for ErrorDetail {
    fn from(err: &MigrateError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            row: err.row().map(str::to_string),
            exit_code: err.exit_code(),
        }
    }
}

/// Everything known about one table in one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableOutcome {
    /// Destination table name.
    pub table: String,

    pub status: TableStatus,

    /// Rows read from the source.
    pub source_rows: Option<i64>,

    /// Destination row count before the load.
    pub destination_rows_before: Option<i64>,

    /// Destination row count after the load.
    pub destination_rows_after: Option<i64>,

    /// Rows inserted (or that would have been inserted in a dry run).
    pub rows_written: u64,

    pub verification: Option<VerificationResult>,

    pub error: Option<ErrorDetail>,

    /// Committed rows were later replaced by a snapshot restore.
    #[serde(default)]
    pub restored: bool,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,
}

impl TableOutcome {
    /// A pending outcome.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            status: TableStatus::Pending,
            source_rows: None,
            destination_rows_before: None,
            destination_rows_after: None,
            rows_written: 0,
            verification: None,
            error: None,
            restored: false,
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, to: TableStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(MigrateError::InvalidTransition {
                table: self.table.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Mark the table as being migrated.
    pub fn mark_migrating(&mut self) -> Result<()> {
        self.transition(TableStatus::Migrating)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the table as loaded and verified.
    pub fn mark_verified(&mut self, result: VerificationResult) -> Result<()> {
        self.transition(TableStatus::Verified)?;
        self.verification = Some(result);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Mark a dry run of the table as complete.
    pub fn mark_simulated(&mut self) -> Result<()> {
        self.transition(TableStatus::Simulated)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the table as failed.
    pub fn mark_failed(&mut self, error: &MigrateError) -> Result<()> {
        self.transition(TableStatus::Failed)?;
        self.error = Some(ErrorDetail::from(error));
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the table as restored from a snapshot.
    pub fn mark_rolled_back(&mut self) -> Result<()> {
        self.transition(TableStatus::RolledBack)?;
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Wall time spent on the table, if it started.
    pub fn elapsed_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// What a rollback did, as recorded on the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackSummary {
    pub snapshot_id: String,
    pub succeeded: bool,
    /// Per-table restore counts (empty if the restore failed early).
    pub tables: Vec<TableRestore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One engine invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRun {
    /// Unique run identifier.
    pub run_id: String,

    pub mode: RunMode,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    /// Selected tables, in plan order.
    pub tables: Vec<String>,

    pub started_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Snapshot taken (or restored) by this run.
    pub snapshot_id: Option<String>,

    pub status: RunStatus,

    /// Per-table outcomes, in plan order.
    pub outcomes: Vec<TableOutcome>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackSummary>,

    /// Run-level failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,

    #[serde(default)]
    finalized: bool,
}

impl MigrationRun {
    /// Start a run over `tables`, each with a pending outcome.
    pub fn new(
        run_id: impl Into<String>,
        mode: RunMode,
        config_hash: impl Into<String>,
        tables: Vec<String>,
    ) -> Self {
        let outcomes = tables.iter().map(TableOutcome::new).collect();
        Self {
            run_id: run_id.into(),
            mode,
            config_hash: config_hash.into(),
            tables,
            started_at: Utc::now(),
            finished_at: None,
            snapshot_id: None,
            status: RunStatus::Running,
            outcomes,
            rollback: None,
            error: None,
            finalized: false,
        }
    }

    fn ensure_open(&self, what: &str) -> Result<()> {
        if self.finalized {
            return Err(MigrateError::InvalidTransition {
                table: what.to_string(),
                from: format!("finalized run {}", self.run_id),
                to: "modified".to_string(),
            });
        }
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Outcome for a table.
    pub fn outcome(&self, table: &str) -> Option<&TableOutcome> {
        self.outcomes.iter().find(|o| o.table == table)
    }

    /// Replace a table's outcome.
    pub fn record(&mut self, outcome: TableOutcome) -> Result<()> {
        self.ensure_open(&outcome.table)?;
        match self.outcomes.iter_mut().find(|o| o.table == outcome.table) {
            Some(slot) => {
                *slot = outcome;
                Ok(())
            }
            None => Err(MigrateError::InvalidTransition {
                table: outcome.table,
                from: "unselected".to_string(),
                to: "recorded".to_string(),
            }),
        }
    }

    /// Apply a state change to a recorded outcome.
    pub fn update<F>(&mut self, table: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut TableOutcome) -> Result<()>,
    {
        self.ensure_open(table)?;
        let outcome = self
            .outcomes
            .iter_mut()
            .find(|o| o.table == table)
            .ok_or_else(|| MigrateError::InvalidTransition {
                table: table.to_string(),
                from: "unselected".to_string(),
                to: "updated".to_string(),
            })?;
        f(outcome)
    }

    pub fn set_snapshot(&mut self, snapshot_id: impl Into<String>) -> Result<()> {
        self.ensure_open("run")?;
        self.snapshot_id = Some(snapshot_id.into());
        Ok(())
    }

    pub fn set_rollback(&mut self, summary: RollbackSummary) -> Result<()> {
        self.ensure_open("run")?;
        self.rollback = Some(summary);
        Ok(())
    }

    pub fn set_error(&mut self, error: &MigrateError) -> Result<()> {
        self.ensure_open("run")?;
        self.error = Some(ErrorDetail::from(error));
        Ok(())
    }

    /// Freeze the run with its final status. Can only happen once.
    pub fn finalize(&mut self, status: RunStatus) -> Result<()> {
        self.ensure_open("run")?;
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.finalized = true;
        Ok(())
    }

    /// Whether every selected table reached the success state of this mode.
    pub fn all_succeeded(&self) -> bool {
        let wanted = match self.mode {
            RunMode::DryRun => TableStatus::Simulated,
            RunMode::Rollback => TableStatus::RolledBack,
            RunMode::Full | RunMode::TableSubset => TableStatus::Verified,
        };
        self.outcomes.iter().all(|o| o.status == wanted)
    }

    /// First failed table, if any.
    pub fn failed_table(&self) -> Option<&TableOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.error.is_some() && matches!(o.status, TableStatus::Failed | TableStatus::RolledBack))
    }

    pub fn elapsed_ms(&self) -> i64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds()
    }
}
