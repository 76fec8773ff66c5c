//! Run reports.
//!
//! A [`MigrationReport`] is a read-only view of a finalized [`MigrationRun`].
//! It is rendered as text for the terminal and persisted as JSON next to
//! earlier reports.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{
    MigrateError, Result, EXIT_CANCELLED, EXIT_MIGRATION_ERROR, EXIT_ROLLBACK_ERROR,
};
use crate::state::{
    ErrorDetail, MigrationRun, RollbackSummary, RunMode, RunStatus, TableOutcome, TableStatus,
};
use crate::verify::VerificationResult;

/// Per-table section of a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReport {
    pub table: String,
    pub status: TableStatus,
    pub source_rows: Option<i64>,
    pub destination_rows_before: Option<i64>,
    pub destination_rows_after: Option<i64>,
    pub rows_written: u64,
    pub elapsed_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Rows committed by this run were undone by the automatic rollback.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub restored: bool,
}

impl From<&TableOutcome> for TableReport {
    fn from(outcome: &TableOutcome) -> Self {
        Self {
            table: outcome.table.clone(),
            status: outcome.status,
            source_rows: outcome.source_rows,
            destination_rows_before: outcome.destination_rows_before,
            destination_rows_after: outcome.destination_rows_after,
            rows_written: outcome.rows_written,
            elapsed_ms: outcome.elapsed_ms(),
            verification: outcome.verification.clone(),
            error: outcome.error.clone(),
            restored: outcome.restored,
        }
    }
}

/// Final report of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Unique run identifier.
    pub run_id: String,

    pub mode: RunMode,

    pub status: RunStatus,

    /// True only if every selected table reached its success state.
    pub success: bool,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Snapshot taken or restored by the run.
    pub snapshot_id: Option<String>,

    pub tables: Vec<TableReport>,

    /// Rows inserted across all tables.
    pub rows_written: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackSummary>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,

    /// What the operator can do next.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_hint: Option<String>,

    /// Process exit code for this run.
    pub exit_code: u8,
}

impl MigrationReport {
    /// Build the report of a finalized run.
    pub fn from_run(run: &MigrationRun) -> Result<Self> {
        let finished_at = match (run.is_finalized(), run.finished_at) {
            (true, Some(at)) => at,
            _ => {
                return Err(MigrateError::InvalidTransition {
                    table: "run".to_string(),
                    from: format!("unfinished run {}", run.run_id),
                    to: "reported".to_string(),
                })
            }
        };

        let success = run.status == RunStatus::Success && run.all_succeeded();
        Ok(Self {
            run_id: run.run_id.clone(),
            mode: run.mode,
            status: run.status,
            success,
            config_hash: run.config_hash.clone(),
            started_at: run.started_at,
            finished_at,
            duration_seconds: run.elapsed_ms() as f64 / 1000.0,
            snapshot_id: run.snapshot_id.clone(),
            tables: run.outcomes.iter().map(TableReport::from).collect(),
            rows_written: run.outcomes.iter().map(|o| o.rows_written).sum(),
            rollback: run.rollback.clone(),
            error: run.error.clone(),
            recovery_hint: recovery_hint(run),
            exit_code: exit_code(run, success),
        })
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// File name the report is stored under.
    pub fn file_name(&self) -> String {
        format!("report-{}.json", self.run_id)
    }

    /// Persist as `<dir>/report-<run_id>.json`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        let tmp = dir.join(format!("{}.tmp", self.file_name()));
        fs::write(&tmp, self.to_json()?)?;
        fs::rename(&tmp, &path)?;
        info!("Report written to {}", path.display());
        Ok(path)
    }

    /// Plain-text rendering for the terminal.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Run {} ({}): {}", self.run_id, self.mode, self.status);
        if let Some(id) = &self.snapshot_id {
            let _ = writeln!(out, "Snapshot: {}", id);
        }
        let _ = writeln!(
            out,
            "Duration: {:.2}s, rows written: {}",
            self.duration_seconds, self.rows_written
        );
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:<24} {:<12} {:>10} {:>10} {:>10}  verification",
            "table", "status", "source", "written", "after"
        );
        for t in &self.tables {
            let _ = writeln!(
                out,
                "{:<24} {:<12} {:>10} {:>10} {:>10}  {}",
                t.table,
                if t.restored {
                    format!("{} (restored)", t.status)
                } else {
                    t.status.to_string()
                },
                opt(t.source_rows),
                t.rows_written,
                opt(t.destination_rows_after),
                t.verification
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            if let Some(e) = &t.error {
                match &e.row {
                    Some(row) => {
                        let _ = writeln!(out, "    error at row {}: {}", row, e.message);
                    }
                    None => {
                        let _ = writeln!(out, "    error: {}", e.message);
                    }
                }
            }
        }
        if let Some(rb) = &self.rollback {
            let _ = writeln!(out);
            if rb.succeeded {
                let _ = writeln!(
                    out,
                    "Rollback from snapshot {} restored {} tables",
                    rb.snapshot_id,
                    rb.tables.len()
                );
            } else {
                let _ = writeln!(
                    out,
                    "Rollback from snapshot {} FAILED: {}",
                    rb.snapshot_id,
                    rb.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        if let Some(e) = &self.error {
            let _ = writeln!(out, "Error: {}", e.message);
        }
        if let Some(hint) = &self.recovery_hint {
            let _ = writeln!(out, "{}", hint);
        }
        out
    }
}

fn opt(v: Option<i64>) -> String {
    v.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string())
}

fn exit_code(run: &MigrationRun, success: bool) -> u8 {
    if success {
        return 0;
    }
    match run.status {
        RunStatus::RollbackFailed => EXIT_ROLLBACK_ERROR,
        RunStatus::Partial => EXIT_CANCELLED,
        RunStatus::RolledBack => EXIT_MIGRATION_ERROR,
        _ => run
            .error
            .as_ref()
            .or_else(|| run.failed_table().and_then(|o| o.error.as_ref()))
            .map(|e| e.exit_code)
            .unwrap_or(EXIT_MIGRATION_ERROR),
    }
}

fn recovery_hint(run: &MigrationRun) -> Option<String> {
    let snapshot = run.snapshot_id.as_deref()?;
    let failed = run.failed_table().map(|o| o.table.as_str());
    match run.status {
        RunStatus::RolledBack => Some(match failed {
            Some(table) => format!(
                "Destination restored from snapshot {}. Fix {} and rerun the migration.",
                snapshot, table
            ),
            None => format!("Destination restored from snapshot {}.", snapshot),
        }),
        RunStatus::RollbackFailed => Some(format!(
            "Manual intervention required. Retry the restore with: hotelops-migrate migrate --rollback --snapshot={}",
            snapshot
        )),
        RunStatus::Partial => Some(format!(
            "Committed tables were kept; tables not reached yet may be empty. Restore with: hotelops-migrate migrate --rollback --snapshot={}",
            snapshot
        )),
        RunStatus::Failed => Some(format!(
            "No table was committed. Snapshot {} is available for recovery.",
            snapshot
        )),
        RunStatus::Running | RunStatus::Success => None,
    }
}
