//! Restore destination tables from a snapshot.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::backup::BackupSnapshot;
use crate::core::traits::TargetWriter;
use crate::error::{MigrateError, Result};

/// Restore counts for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRestore {
    pub table: String,
    /// Row count recorded in the manifest.
    pub expected_rows: i64,
    /// Row count after the reload.
    pub restored_rows: i64,
}

/// What a successful rollback restored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub snapshot_id: String,
    /// Restored tables, in plan order.
    pub tables: Vec<TableRestore>,
}

/// Reloads snapshots into the destination.
///
/// The destination is emptied in reverse dependency order so dependents go
/// before the rows they reference, then reloaded in dependency order. Every
/// table gets its own transaction per phase.
pub struct RollbackManager {
    batch_size: usize,
}

impl RollbackManager {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Restore every table of `snapshot`. A count that differs from the
    /// manifest afterwards is a [`MigrateError::Rollback`]; there is no retry.
    pub async fn rollback<D>(&self, snapshot: &BackupSnapshot, destination: &D) -> Result<RollbackResult>
    where
        D: TargetWriter + ?Sized,
    {
        let id = snapshot.id.as_str();
        let tables = &snapshot.manifest.tables;
        info!("Rolling back {} tables from snapshot {}", tables.len(), id);

        // Nothing is cleared unless every file can be reloaded.
        snapshot
            .verify_files()
            .and_then(|()| snapshot.validate_rows())
            .map_err(|e| MigrateError::rollback(id, e.to_string()))?;

        for entry in tables.iter().rev() {
            let mut tx = destination
                .begin(&entry.table)
                .await
                .map_err(|e| MigrateError::rollback(id, format!("{}: {}", entry.table, e)))?;
            let cleared = match tx.clear().await {
                Ok(n) => n,
                Err(e) => {
                    discard(tx.as_mut(), &entry.table).await;
                    return Err(MigrateError::rollback(
                        id,
                        format!("clearing {}: {}", entry.table, e),
                    ));
                }
            };
            tx.commit()
                .await
                .map_err(|e| MigrateError::rollback(id, format!("clearing {}: {}", entry.table, e)))?;
            info!("{}: cleared {} rows", entry.table, cleared);
        }

        let mut restored = Vec::with_capacity(tables.len());
        for entry in tables {
            let rows = snapshot
                .read_rows(&entry.table)
                .map_err(|e| MigrateError::rollback(id, e.to_string()))?;

            let mut tx = destination
                .begin(&entry.table)
                .await
                .map_err(|e| MigrateError::rollback(id, format!("{}: {}", entry.table, e)))?;
            for chunk in rows.chunks(self.batch_size) {
                if let Err(e) = tx.insert_batch(&entry.columns, chunk).await {
                    discard(tx.as_mut(), &entry.table).await;
                    return Err(MigrateError::rollback(
                        id,
                        format!("reloading {}: {}", entry.table, e),
                    ));
                }
            }
            tx.commit()
                .await
                .map_err(|e| MigrateError::rollback(id, format!("reloading {}: {}", entry.table, e)))?;

            let count = destination
                .row_count(&entry.table)
                .await
                .map_err(|e| MigrateError::rollback(id, format!("counting {}: {}", entry.table, e)))?;
            if count != entry.row_count {
                error!(
                    "{}: restored {} rows, manifest has {}",
                    entry.table, count, entry.row_count
                );
                return Err(MigrateError::rollback(
                    id,
                    format!(
                        "{} has {} rows after restore, manifest records {}",
                        entry.table, count, entry.row_count
                    ),
                ));
            }
            info!("{}: restored {} rows", entry.table, count);
            restored.push(TableRestore {
                table: entry.table.clone(),
                expected_rows: entry.row_count,
                restored_rows: count,
            });
        }

        info!("Rollback to snapshot {} complete", id);
        Ok(RollbackResult {
            snapshot_id: id.to_string(),
            tables: restored,
        })
    }
}

async fn discard(tx: &mut (dyn crate::core::traits::TableTransaction + 'static), table: &str) {
    if let Err(e) = tx.rollback().await {
        warn!("{}: discarding restore transaction failed: {}", table, e);
    }
}
