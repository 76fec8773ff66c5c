//! Migration orchestrator - main workflow coordinator.
//!
//! One call to [`Orchestrator::run`] is one run:
//!
//! 1. resolve the plan and check it against both live schemas
//! 2. snapshot the destination (skipped in dry runs)
//! 3. in truncate mode, empty the selected tables in reverse dependency order
//! 4. migrate and verify each table in dependency order
//! 5. on the first table failure, halt and restore the snapshot
//! 6. finalize the run and persist its report

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::{BackupManager, BackupSnapshot, SnapshotManifest};
use crate::config::{Config, LoadMode};
use crate::core::traits::{SourceReader, TargetWriter};
use crate::drivers::postgres::PostgresDatabase;
use crate::error::{MigrateError, Result};
use crate::migrator::{clear_tables, TableMigrator};
use crate::plan::{dependency_levels, validate_schema, MigrationPlan, TableSpec};
use crate::report::MigrationReport;
use crate::rollback::RollbackManager;
use crate::state::{
    new_run_id, MigrationRun, RollbackSummary, RunMode, RunStatus, TableOutcome, TableStatus,
};
use crate::verify::{CountReport, VerificationEngine, VerificationResult};

/// What `migrate` was asked to do.
#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    /// Simulate: read and transform, never commit.
    pub dry_run: bool,
    /// Restrict the run to these tables and their dependencies. Empty means all.
    pub tables: Vec<String>,
}

/// Connectivity of both databases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub destination_connected: bool,
    pub destination_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_error: Option<String>,
    pub healthy: bool,
}

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn SourceReader>,
    destination: Arc<dyn TargetWriter>,
}

impl Orchestrator {
    /// Connect to the source and destination databases described by `config`.
    pub async fn new(config: Config) -> Result<Self> {
        let max_conns = config.migration.get_max_connections();
        let source = PostgresDatabase::connect(&config.source, max_conns).await?;
        let destination = PostgresDatabase::connect(&config.destination, max_conns).await?;
        Ok(Self::with_databases(
            config,
            Arc::new(source),
            Arc::new(destination),
        ))
    }

    /// Use already constructed database collaborators.
    pub fn with_databases(
        config: Config,
        source: Arc<dyn SourceReader>,
        destination: Arc<dyn TargetWriter>,
    ) -> Self {
        Self {
            config,
            source,
            destination,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The resolved plan for `tables` (all tables if empty). No database I/O.
    pub fn plan(&self, tables: &[String]) -> Result<Vec<TableSpec>> {
        plan_for(&self.config, tables)
    }

    fn backup_manager(&self) -> BackupManager {
        BackupManager::new(&self.config.backup, self.config.migration.get_batch_size())
    }

    /// Retained snapshots, oldest first.
    pub fn snapshots(&self) -> Result<Vec<SnapshotManifest>> {
        self.backup_manager().list()
    }

    /// Run a migration.
    ///
    /// Plan and schema errors are returned before any run is created. Every
    /// later failure is recorded in the returned report, whose `exit_code`
    /// tells the caller how the run ended.
    pub async fn run(&self, options: MigrateOptions, cancel: CancellationToken) -> Result<MigrationReport> {
        let specs = self.plan(&options.tables)?;
        validate_schema(&specs, self.source.as_ref(), self.destination.as_ref()).await?;

        let mode = if options.dry_run {
            RunMode::DryRun
        } else if !options.tables.is_empty() {
            RunMode::TableSubset
        } else {
            RunMode::Full
        };
        let names: Vec<String> = specs.iter().map(|s| s.destination.clone()).collect();
        let mut run = MigrationRun::new(new_run_id(), mode, self.config.hash(), names.clone());

        info!(
            "Starting {} run {}: {}",
            mode,
            run.run_id,
            names.join(" -> ")
        );

        let snapshot = if options.dry_run {
            info!("Dry run: skipping snapshot, nothing will be committed");
            None
        } else {
            match self
                .backup_manager()
                .snapshot(&run.run_id, &specs, self.destination.as_ref(), self.source.as_ref())
                .await
            {
                Ok(snapshot) => {
                    run.set_snapshot(snapshot.id.clone())?;
                    Some(snapshot)
                }
                Err(e) => {
                    error!("Backup failed, no table was migrated: {}", e);
                    run.set_error(&e)?;
                    run.finalize(RunStatus::Failed)?;
                    return self.finish(&run);
                }
            }
        };

        let truncate = self.config.migration.load_mode == LoadMode::Truncate;
        if let (Some(snapshot), true) = (&snapshot, truncate && !cancel.is_cancelled()) {
            if let Err(e) = clear_tables(&specs, self.destination.as_ref()).await {
                error!("Clearing destination tables failed: {}", e);
                run.set_error(&e)?;
                self.auto_rollback(snapshot, &mut run).await?;
                return self.finish(&run);
            }
        }

        let failure = self
            .migrate_tables(&specs, options.dry_run, &mut run, &cancel)
            .await?;

        match failure {
            None => {
                info!("All {} tables completed", specs.len());
                run.finalize(RunStatus::Success)?;
            }
            Some(MigrateError::Cancelled) => {
                run.set_error(&MigrateError::Cancelled)?;
                match &run.snapshot_id {
                    Some(id) => warn!(
                        "Run cancelled; committed tables were kept. Restore them with snapshot {}",
                        id
                    ),
                    None => warn!("Run cancelled"),
                }
                run.finalize(RunStatus::Partial)?;
            }
            Some(e) => {
                run.set_error(&e)?;
                match snapshot {
                    Some(snapshot) => self.auto_rollback(&snapshot, &mut run).await?,
                    None => run.finalize(RunStatus::Failed)?,
                }
            }
        }

        self.finish(&run)
    }

    /// Migrate every table, stopping at the first failure. Returns that failure.
    async fn migrate_tables(
        &self,
        specs: &[TableSpec],
        dry_run: bool,
        run: &mut MigrationRun,
        cancel: &CancellationToken,
    ) -> Result<Option<MigrateError>> {
        let workers = self.config.migration.get_workers();
        let batch_size = self.config.migration.get_batch_size();
        let verifier = Arc::new(VerificationEngine::new(
            &self.config.verification,
            batch_size,
            self.config.migration.load_mode,
        ));

        if workers <= 1 {
            let migrator = TableMigrator::new(&self.config.migration, cancel.clone());
            for spec in specs {
                if cancel.is_cancelled() {
                    return Ok(Some(MigrateError::Cancelled));
                }
                let (outcome, failure) = process_table(
                    spec,
                    dry_run,
                    &migrator,
                    &verifier,
                    self.source.as_ref(),
                    self.destination.as_ref(),
                )
                .await;
                run.record(outcome)?;
                if failure.is_some() {
                    return Ok(failure);
                }
            }
            return Ok(None);
        }

        let semaphore = Arc::new(Semaphore::new(workers));
        let levels = dependency_levels(specs);
        info!(
            "Migrating {} tables in {} dependency levels with {} workers",
            specs.len(),
            levels.len(),
            workers
        );

        for level in levels {
            if cancel.is_cancelled() {
                return Ok(Some(MigrateError::Cancelled));
            }

            // Siblings of a failed table are stopped through this token.
            let level_cancel = cancel.child_token();
            let migrator = TableMigrator::new(&self.config.migration, level_cancel.clone());
            let mut handles = Vec::new();

            for spec in level {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| MigrateError::Driver(format!("worker pool closed: {}", e)))?;
                let migrator = migrator.clone();
                let verifier = verifier.clone();
                let source = self.source.clone();
                let destination = self.destination.clone();
                let level_cancel = level_cancel.clone();
                let table = spec.destination.clone();

                let handle = tokio::spawn(async move {
                    let result = process_table(
                        &spec,
                        dry_run,
                        &migrator,
                        &verifier,
                        source.as_ref(),
                        destination.as_ref(),
                    )
                    .await;
                    if result.1.is_some() {
                        level_cancel.cancel();
                    }
                    drop(permit);
                    result
                });
                handles.push((table, handle));
            }

            let mut first_failure: Option<MigrateError> = None;
            for (table, handle) in handles {
                let (outcome, failure) = handle
                    .await
                    .map_err(|e| MigrateError::Driver(format!("{} worker panicked: {}", table, e)))?;
                run.record(outcome)?;
                first_failure = match (first_failure, failure) {
                    (None, f) => f,
                    (Some(MigrateError::Cancelled), Some(f)) if !cancel.is_cancelled() => Some(f),
                    (kept, _) => kept,
                };
            }

            if let Some(failure) = first_failure {
                return Ok(Some(failure));
            }
        }
        Ok(None)
    }

    async fn auto_rollback(&self, snapshot: &BackupSnapshot, run: &mut MigrationRun) -> Result<()> {
        warn!("Halting run {}; restoring snapshot {}", run.run_id, snapshot.id);
        let manager = RollbackManager::new(self.config.migration.get_batch_size());
        match manager.rollback(snapshot, self.destination.as_ref()).await {
            Ok(result) => {
                let touched: Vec<(String, TableStatus)> = run
                    .outcomes
                    .iter()
                    .filter(|o| matches!(o.status, TableStatus::Failed | TableStatus::Verified))
                    .map(|o| (o.table.clone(), o.status))
                    .collect();
                for (table, status) in touched {
                    run.update(&table, |o| {
                        if status == TableStatus::Failed {
                            o.mark_rolled_back()
                        } else {
                            o.restored = true;
                            Ok(())
                        }
                    })?;
                }
                run.set_rollback(RollbackSummary {
                    snapshot_id: result.snapshot_id,
                    succeeded: true,
                    tables: result.tables,
                    error: None,
                })?;
                run.finalize(RunStatus::RolledBack)
            }
            Err(e) => {
                error!("Automatic rollback failed: {}", e);
                run.set_rollback(RollbackSummary {
                    snapshot_id: snapshot.id.clone(),
                    succeeded: false,
                    tables: Vec::new(),
                    error: Some(e.to_string()),
                })?;
                run.finalize(RunStatus::RollbackFailed)
            }
        }
    }

    /// Restore a snapshot without migrating. Uses the latest snapshot if
    /// `snapshot_id` is `None`.
    pub async fn rollback(&self, snapshot_id: Option<&str>) -> Result<MigrationReport> {
        let backups = self.backup_manager();
        let snapshot = match snapshot_id {
            Some(id) => backups
                .load(id)
                .map_err(|e| MigrateError::rollback(id, e.to_string()))?,
            None => backups
                .latest()
                .map_err(|e| MigrateError::rollback("latest", e.to_string()))?
                .ok_or_else(|| {
                    MigrateError::rollback(
                        "latest",
                        format!("no snapshot found in {}", backups.directory().display()),
                    )
                })?,
        };

        let mut run = MigrationRun::new(
            new_run_id(),
            RunMode::Rollback,
            self.config.hash(),
            snapshot.tables(),
        );
        run.set_snapshot(snapshot.id.clone())?;
        info!("Restoring snapshot {} (run {})", snapshot.id, run.run_id);

        let manager = RollbackManager::new(self.config.migration.get_batch_size());
        match manager.rollback(&snapshot, self.destination.as_ref()).await {
            Ok(result) => {
                for restore in &result.tables {
                    let rows = restore.restored_rows;
                    run.update(&restore.table, |o| {
                        o.destination_rows_after = Some(rows);
                        o.mark_rolled_back()
                    })?;
                }
                run.set_rollback(RollbackSummary {
                    snapshot_id: result.snapshot_id,
                    succeeded: true,
                    tables: result.tables,
                    error: None,
                })?;
                run.finalize(RunStatus::Success)?;
            }
            Err(e) => {
                error!("Rollback failed: {}", e);
                run.set_error(&e)?;
                run.set_rollback(RollbackSummary {
                    snapshot_id: snapshot.id.clone(),
                    succeeded: false,
                    tables: Vec::new(),
                    error: Some(e.to_string()),
                })?;
                run.finalize(RunStatus::RollbackFailed)?;
            }
        }

        self.finish(&run)
    }

    /// Compare source and destination row counts of every planned table.
    pub async fn verify_counts(&self) -> Result<CountReport> {
        let specs = self.plan(&[])?;
        let engine = VerificationEngine::new(
            &self.config.verification,
            self.config.migration.get_batch_size(),
            self.config.migration.load_mode,
        );
        engine
            .compare_counts(&specs, self.source.as_ref(), self.destination.as_ref())
            .await
    }

    /// Check both database connections.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let start = Instant::now();
        let source = self.source.ping().await;
        let source_latency_ms = start.elapsed().as_millis() as u64;

        let start = Instant::now();
        let destination = self.destination.ping().await;
        let destination_latency_ms = start.elapsed().as_millis() as u64;

        let healthy = source.is_ok() && destination.is_ok();
        Ok(HealthCheckResult {
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.err().map(|e| e.to_string()),
            destination_connected: destination.is_ok(),
            destination_latency_ms,
            destination_error: destination.err().map(|e| e.to_string()),
            healthy,
        })
    }

    /// Close both connection pools.
    pub async fn close(&self) {
        self.source.close().await;
        self.destination.close().await;
    }

    fn finish(&self, run: &MigrationRun) -> Result<MigrationReport> {
        let report = MigrationReport::from_run(run)?;
        report.write(&self.config.report.directory)?;
        info!(
            "Run {} finished: {} ({:.1}s)",
            report.run_id, report.status, report.duration_seconds
        );
        Ok(report)
    }
}

/// The resolved plan for `tables` (all tables if empty).
pub fn plan_for(config: &Config, tables: &[String]) -> Result<Vec<TableSpec>> {
    let plan = MigrationPlan::new(config.plan.tables.clone())?;
    Ok(plan.select(tables)?)
}

/// Migrate and verify one table. Never returns early: the outcome always
/// reflects what happened, and the failure (if any) is handed back.
async fn process_table<S, D>(
    spec: &TableSpec,
    dry_run: bool,
    migrator: &TableMigrator,
    verifier: &VerificationEngine,
    source: &S,
    destination: &D,
) -> (TableOutcome, Option<MigrateError>)
where
    S: SourceReader + ?Sized,
    D: TargetWriter + ?Sized,
{
    let table = spec.destination.as_str();
    let mut outcome = TableOutcome::new(table);
    info!("{}: migrating from {}", table, spec.source);

    if let Err(e) = migrator
        .migrate(spec, dry_run, &mut outcome, source, destination)
        .await
    {
        error!("{}: {}", table, e);
        return (outcome, Some(e));
    }

    if dry_run {
        outcome.verification = Some(VerificationResult::Skipped {
            reason: "dry run".to_string(),
        });
        return match outcome.mark_simulated() {
            Ok(()) => (outcome, None),
            Err(e) => (outcome, Some(e)),
        };
    }

    let result = match verifier.verify(spec, &mut outcome, source, destination).await {
        Ok(result) => result,
        Err(e) => return fail(outcome, e),
    };

    if result.is_mismatch() {
        let (expected, actual) = match &result {
            VerificationResult::Mismatch {
                expected, actual, ..
            } => (*expected, *actual),
            _ => (0, 0),
        };
        let e = MigrateError::VerificationMismatch {
            table: table.to_string(),
            expected,
            actual,
            detail: result.mismatch_detail(),
        };
        outcome.verification = Some(result);
        error!("{}: {}", table, e);
        return fail(outcome, e);
    }

    match outcome.mark_verified(result) {
        Ok(()) => (outcome, None),
        Err(e) => (outcome, Some(e)),
    }
}

fn fail(mut outcome: TableOutcome, e: MigrateError) -> (TableOutcome, Option<MigrateError>) {
    if let Err(state_err) = outcome.mark_failed(&e) {
        warn!("{}: {}", outcome.table, state_err);
    }
    (outcome, Some(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source: { host: legacy-db, database: pms, user: reader }
destination: { host: new-db, database: hotelops, user: loader }
plan:
  tables:
    - source: legacy_invoice
      destination: invoices
      primary_key: [id]
      depends_on: [hotels]
      columns:
        - { source: invoice_id, destination: id }
    - source: legacy_hotel
      destination: hotels
      primary_key: [id]
      columns:
        - { source: hotel_id, destination: id }
    - source: legacy_spa
      destination: spa_visits
      primary_key: [id]
      columns:
        - { source: visit_id, destination: id }
"#;

    #[test]
    fn test_plan_for_selection_includes_dependencies() {
        let config = Config::from_yaml(YAML).unwrap();
        let specs = plan_for(&config, &["invoices".to_string()]).unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.destination.as_str()).collect();
        assert_eq!(names, vec!["hotels", "invoices"]);
    }

    #[test]
    fn test_plan_for_unknown_selection() {
        let config = Config::from_yaml(YAML).unwrap();
        let err = plan_for(&config, &["laundry".to_string()]).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_PLAN_ERROR);
    }
}
