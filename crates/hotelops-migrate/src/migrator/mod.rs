//! Per-table extract, transform and load.
//!
//! A table is migrated inside exactly one destination transaction. Nothing is
//! committed until every source row has been read, transformed and inserted;
//! any failure (or cancellation) rolls the transaction back explicitly.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LoadMode, MigrationConfig};
use crate::core::traits::{ReadOptions, TableReader, TableTransaction, TargetWriter};
use crate::core::value::Row;
use crate::error::{MigrateError, Result};
use crate::plan::TableSpec;
use crate::state::TableOutcome;

/// Identify a source row by its primary key, e.g. `id=7` or `hotel_id=1,room_no=12`.
pub fn row_id(spec: &TableSpec, row: &Row) -> String {
    let positions = spec.primary_key_positions();
    if positions.is_empty() {
        return "unknown".to_string();
    }
    positions
        .iter()
        .map(|&i| {
            let column = &spec.columns[i].source;
            let value = row.get(i).map(|v| v.to_string()).unwrap_or_default();
            format!("{}={}", column, value)
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Map a source row (values ordered like [`TableSpec::source_columns`]) to a
/// destination row (ordered like [`TableSpec::destination_columns`]).
pub fn transform_row(spec: &TableSpec, row: Row) -> Result<Row> {
    if row.len() != spec.columns.len() {
        return Err(MigrateError::source_read(
            &spec.destination,
            format!(
                "expected {} columns from {}, got {}",
                spec.columns.len(),
                spec.source,
                row.len()
            ),
        ));
    }

    let id = row_id(spec, &row);
    let mut out = Vec::with_capacity(spec.columns.len() + spec.defaults.len());
    for (mapping, value) in spec.columns.iter().zip(row) {
        let value = mapping.apply(value).map_err(|message| MigrateError::Transform {
            table: spec.destination.clone(),
            row: id.clone(),
            column: mapping.destination.clone(),
            message,
        })?;
        out.push(value);
    }
    out.extend(spec.defaults.values().map(|literal| literal.to_value()));
    Ok(out)
}

/// Read options for a full ordered pass over the source table.
pub fn source_read_options(spec: &TableSpec, batch_size: usize) -> ReadOptions {
    ReadOptions::new(
        spec.source.clone(),
        spec.source_columns(),
        spec.source_primary_key(),
        batch_size,
    )
}

fn as_source_error(table: &str, e: MigrateError) -> MigrateError {
    match e {
        MigrateError::SourceRead { .. } | MigrateError::Cancelled => e,
        other => MigrateError::source_read(table, other),
    }
}

fn as_write_error(table: &str, e: MigrateError) -> MigrateError {
    match e {
        MigrateError::DestinationWrite { .. } => e,
        other => MigrateError::destination_write(table, other),
    }
}

/// Empty every table of `specs` in reverse plan order, one committed
/// transaction per table, so no table is cleared while a table loaded after
/// it still references its rows.
pub async fn clear_tables<D>(specs: &[TableSpec], destination: &D) -> Result<()>
where
    D: TargetWriter + ?Sized,
{
    for spec in specs.iter().rev() {
        let table = spec.destination.as_str();
        let mut tx = destination
            .begin(table)
            .await
            .map_err(|e| as_write_error(table, e))?;
        match tx.clear().await {
            Ok(cleared) => {
                tx.commit().await.map_err(|e| as_write_error(table, e))?;
                info!("{}: cleared {} rows before loading", table, cleared);
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("{}: rollback after failed clear also failed: {}", table, rollback_err);
                }
                return Err(as_write_error(table, e));
            }
        }
    }
    Ok(())
}

/// Migrates one table at a time.
#[derive(Clone)]
pub struct TableMigrator {
    batch_size: usize,
    load_mode: LoadMode,
    dry_run_writes: bool,
    cancel: CancellationToken,
}

impl TableMigrator {
    pub fn new(config: &MigrationConfig, cancel: CancellationToken) -> Self {
        Self {
            batch_size: config.get_batch_size(),
            load_mode: config.load_mode,
            dry_run_writes: config.dry_run_writes,
            cancel,
        }
    }

    /// Migrate `spec`, recording counts on `outcome`.
    ///
    /// Marks the outcome `migrating` on entry and `failed` on error. The
    /// caller verifies the load and records the terminal state.
    pub async fn migrate<S, D>(
        &self,
        spec: &TableSpec,
        dry_run: bool,
        outcome: &mut TableOutcome,
        source: &S,
        destination: &D,
    ) -> Result<()>
    where
        S: TableReader + ?Sized,
        D: TargetWriter + ?Sized,
    {
        outcome.mark_migrating()?;
        match self.run(spec, dry_run, outcome, source, destination).await {
            Ok(()) => Ok(()),
            Err(e) => {
                outcome.mark_failed(&e)?;
                Err(e)
            }
        }
    }

    async fn run<S, D>(
        &self,
        spec: &TableSpec,
        dry_run: bool,
        outcome: &mut TableOutcome,
        source: &S,
        destination: &D,
    ) -> Result<()>
    where
        S: TableReader + ?Sized,
        D: TargetWriter + ?Sized,
    {
        let table = spec.destination.as_str();
        let before = destination
            .row_count(table)
            .await
            .map_err(|e| as_write_error(table, e))?;
        outcome.destination_rows_before = Some(before);

        let writes = !dry_run || self.dry_run_writes;
        let mut tx = if writes {
            Some(destination.begin(table).await.map_err(|e| as_write_error(table, e))?)
        } else {
            None
        };

        let result = self.load(spec, tx.as_deref_mut(), outcome, source).await;

        match (result, tx.as_mut()) {
            (Ok(()), Some(tx)) if !dry_run => {
                tx.commit().await.map_err(|e| as_write_error(table, e))?;
                info!(
                    "{}: committed {} rows from {}",
                    table, outcome.rows_written, spec.source
                );
                Ok(())
            }
            (Ok(()), tx) => {
                if let Some(tx) = tx {
                    tx.rollback().await.map_err(|e| as_write_error(table, e))?;
                }
                info!(
                    "{}: dry run transformed {} rows from {} (nothing committed)",
                    table, outcome.rows_written, spec.source
                );
                Ok(())
            }
            (Err(e), tx) => {
                if let Some(tx) = tx {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!("{}: rollback after failure also failed: {}", table, rollback_err);
                    } else {
                        warn!("{}: transaction rolled back", table);
                    }
                }
                Err(e)
            }
        }
    }

    async fn load<S>(
        &self,
        spec: &TableSpec,
        mut tx: Option<&mut (dyn TableTransaction + 'static)>,
        outcome: &mut TableOutcome,
        source: &S,
    ) -> Result<()>
    where
        S: TableReader + ?Sized,
    {
        let table = spec.destination.as_str();
        let columns = spec.destination_columns();

        if let (Some(tx), LoadMode::Truncate) = (tx.as_deref_mut(), self.load_mode) {
            let cleared = tx.clear().await.map_err(|e| as_write_error(table, e))?;
            debug!("{}: cleared {} existing rows", table, cleared);
        }

        let mut opts = source_read_options(spec, self.batch_size);
        let mut read = 0i64;
        let mut written = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }

            let page = source
                .read_batch(&opts)
                .await
                .map_err(|e| as_source_error(table, e))?;
            let n = page.len();
            if n == 0 {
                break;
            }
            read += n as i64;

            let batch = page
                .into_iter()
                .map(|row| transform_row(spec, row))
                .collect::<Result<Vec<Row>>>()?;

            match tx.as_deref_mut() {
                Some(tx) => {
                    written += tx
                        .insert_batch(&columns, &batch)
                        .await
                        .map_err(|e| as_write_error(table, e))?;
                }
                None => written += batch.len() as u64,
            }
            debug!("{}: {} rows loaded so far", table, written);

            if n < opts.limit {
                break;
            }
            opts.advance(n);
        }

        outcome.source_rows = Some(read);
        outcome.rows_written = written;
        Ok(())
    }
}
