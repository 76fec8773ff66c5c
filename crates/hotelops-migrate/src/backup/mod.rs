//! Destination snapshots taken before any table is written.
//!
//! Layout of one snapshot:
//!
//! ```text
//! <backup_dir>/<snapshot_id>/
//!     manifest.json
//!     destination/<table>.jsonl
//!     source/<table>.jsonl        (only with backup.include_source)
//! ```
//!
//! Each data file holds one JSON-encoded row per line. The snapshot is written
//! under `<snapshot_id>.partial/` and renamed into place only after every table
//! was exported, so a directory without the suffix is always complete.
//! Snapshots are never deleted by the engine.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::BackupConfig;
use crate::core::traits::{read_pages, ReadOptions, TableReader};
use crate::core::value::Row;
use crate::error::{MigrateError, Result};
use crate::plan::TableSpec;

const MANIFEST_FILE: &str = "manifest.json";
const PARTIAL_SUFFIX: &str = ".partial";
const DESTINATION_DIR: &str = "destination";
const SOURCE_DIR: &str = "source";

/// One exported table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestTable {
    /// Table name.
    pub table: String,
    /// Rows at capture time.
    pub row_count: i64,
    /// Exported columns, in row value order.
    pub columns: Vec<String>,
    /// Data file, relative to the snapshot directory.
    pub file: String,
    /// SHA-256 of the data file.
    pub sha256: String,
}

/// Contents of `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    /// Destination tables, in plan order.
    pub tables: Vec<ManifestTable>,
    /// Source exports kept for audit. Never restored.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_tables: Vec<ManifestTable>,
}

impl SnapshotManifest {
    pub fn table(&self, name: &str) -> Option<&ManifestTable> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn total_rows(&self) -> i64 {
        self.tables.iter().map(|t| t.row_count).sum()
    }
}

/// A complete, retained snapshot.
#[derive(Debug, Clone)]
pub struct BackupSnapshot {
    pub id: String,
    pub location: PathBuf,
    pub manifest: SnapshotManifest,
}

impl BackupSnapshot {
    /// Destination table names covered, in plan order.
    pub fn tables(&self) -> Vec<String> {
        self.manifest.tables.iter().map(|t| t.table.clone()).collect()
    }

    /// Read every captured row of a destination table.
    pub fn read_rows(&self, table: &str) -> Result<Vec<Row>> {
        let entry = self.entry(table)?;
        let mut rows = Vec::with_capacity(entry.row_count.max(0) as usize);
        self.scan_rows(entry, |row| rows.push(row))?;
        Ok(rows)
    }

    /// Parse every destination data file end to end without keeping the
    /// rows. Each file must decode and hold exactly the manifest row count.
    pub fn validate_rows(&self) -> Result<()> {
        for entry in &self.manifest.tables {
            let parsed = self.scan_rows(entry, drop)?;
            if parsed != entry.row_count {
                return Err(MigrateError::backup(
                    Some(&entry.table),
                    format!(
                        "{} holds {} rows, manifest records {}",
                        entry.file, parsed, entry.row_count
                    ),
                ));
            }
        }
        Ok(())
    }

    fn entry(&self, table: &str) -> Result<&ManifestTable> {
        self.manifest.table(table).ok_or_else(|| {
            MigrateError::backup(Some(table), format!("not part of snapshot {}", self.id))
        })
    }

    fn scan_rows<F>(&self, entry: &ManifestTable, mut f: F) -> Result<i64>
    where
        F: FnMut(Row),
    {
        let file = File::open(self.location.join(&entry.file))?;
        let mut count = 0i64;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let row: Row = serde_json::from_str(&line).map_err(|e| {
                MigrateError::backup(
                    Some(&entry.table),
                    format!("corrupt row in {}: {}", entry.file, e),
                )
            })?;
            f(row);
            count += 1;
        }
        Ok(count)
    }

    /// Check every data file against the SHA-256 recorded in the manifest.
    pub fn verify_files(&self) -> Result<()> {
        for entry in self.manifest.tables.iter().chain(&self.manifest.source_tables) {
            let path = self.location.join(&entry.file);
            let actual = sha256_file(&path).map_err(|e| {
                MigrateError::backup(Some(&entry.table), format!("cannot read {}: {}", path.display(), e))
            })?;
            if actual != entry.sha256 {
                return Err(MigrateError::backup(
                    Some(&entry.table),
                    format!(
                        "checksum mismatch for {} in snapshot {} (expected {}, found {})",
                        entry.file, self.id, entry.sha256, actual
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Creates and reads snapshots under the configured backup directory.
pub struct BackupManager {
    directory: PathBuf,
    batch_size: usize,
    include_source: bool,
}

impl BackupManager {
    pub fn new(config: &BackupConfig, batch_size: usize) -> Self {
        Self {
            directory: config.directory.clone(),
            batch_size,
            include_source: config.include_source,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Export the destination tables of `specs` (and, if configured, their
    /// source tables) into a new snapshot named `snapshot_id`.
    ///
    /// On any failure the partial directory is removed and nothing is left behind.
    pub async fn snapshot<D, S>(
        &self,
        snapshot_id: &str,
        specs: &[TableSpec],
        destination: &D,
        source: &S,
    ) -> Result<BackupSnapshot>
    where
        D: TableReader + ?Sized,
        S: TableReader + ?Sized,
    {
        let final_dir = self.directory.join(snapshot_id);
        let partial_dir = self.directory.join(format!("{}{}", snapshot_id, PARTIAL_SUFFIX));

        if final_dir.exists() {
            return Err(MigrateError::backup(
                None,
                format!("snapshot directory {} already exists", final_dir.display()),
            ));
        }
        if partial_dir.exists() {
            warn!("Removing stale partial snapshot {}", partial_dir.display());
            fs::remove_dir_all(&partial_dir).map_err(|e| io_error(None, &partial_dir, e))?;
        }

        info!(
            "Creating snapshot {} of {} tables in {}",
            snapshot_id,
            specs.len(),
            self.directory.display()
        );

        match self
            .write_partial(snapshot_id, &partial_dir, specs, destination, source)
            .await
        {
            Ok(manifest) => {
                fs::rename(&partial_dir, &final_dir)
                    .map_err(|e| io_error(None, &final_dir, e))?;
                info!(
                    "Snapshot {} complete: {} tables, {} rows",
                    snapshot_id,
                    manifest.tables.len(),
                    manifest.total_rows()
                );
                Ok(BackupSnapshot {
                    id: snapshot_id.to_string(),
                    location: final_dir,
                    manifest,
                })
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&partial_dir) {
                    warn!(
                        "Failed to remove partial snapshot {}: {}",
                        partial_dir.display(),
                        cleanup
                    );
                }
                Err(match e {
                    MigrateError::Backup { .. } => e,
                    other => MigrateError::backup(other.table(), other.to_string()),
                })
            }
        }
    }

    async fn write_partial<D, S>(
        &self,
        snapshot_id: &str,
        dir: &Path,
        specs: &[TableSpec],
        destination: &D,
        source: &S,
    ) -> Result<SnapshotManifest>
    where
        D: TableReader + ?Sized,
        S: TableReader + ?Sized,
    {
        fs::create_dir_all(dir.join(DESTINATION_DIR)).map_err(|e| io_error(None, dir, e))?;

        let mut tables = Vec::with_capacity(specs.len());
        for spec in specs {
            let entry = self
                .export_table(dir, DESTINATION_DIR, destination, &spec.destination, &spec.primary_key)
                .await?;
            tables.push(entry);
        }

        let mut source_tables = Vec::new();
        if self.include_source {
            fs::create_dir_all(dir.join(SOURCE_DIR)).map_err(|e| io_error(None, dir, e))?;
            for spec in specs {
                let entry = self
                    .export_table(dir, SOURCE_DIR, source, &spec.source, &spec.source_primary_key())
                    .await?;
                source_tables.push(entry);
            }
        }

        let manifest = SnapshotManifest {
            snapshot_id: snapshot_id.to_string(),
            created_at: Utc::now(),
            tables,
            source_tables,
        };
        let path = dir.join(MANIFEST_FILE);
        let content = serde_json::to_string_pretty(&manifest)?;
        fs::write(&path, content).map_err(|e| io_error(None, &path, e))?;
        Ok(manifest)
    }

    async fn export_table<R>(
        &self,
        dir: &Path,
        side: &str,
        reader: &R,
        table: &str,
        order_by: &[String],
    ) -> Result<ManifestTable>
    where
        R: TableReader + ?Sized,
    {
        check_file_name(table)?;
        let columns: Vec<String> = reader
            .table_columns(table)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        if columns.is_empty() {
            return Err(MigrateError::backup(Some(table), format!("{} table does not exist", side)));
        }

        let relative = format!("{}/{}.jsonl", side, table);
        let path = dir.join(&relative);
        let file = File::create(&path).map_err(|e| io_error(Some(table), &path, e))?;
        let mut writer = HashingWriter::new(BufWriter::new(file));

        let opts = ReadOptions::new(table, columns.clone(), order_by.to_vec(), self.batch_size);
        let rows = read_pages(reader, opts, |page| {
            for row in &page {
                serde_json::to_writer(&mut writer, row)?;
                writer.write_all(b"\n")?;
            }
            debug!("{}: exported {} rows", table, page.len());
            Ok(())
        })
        .await?;

        let sha256 = writer.finish().map_err(|e| io_error(Some(table), &path, e))?;
        info!("Backed up {} {}: {} rows", side, table, rows);

        Ok(ManifestTable {
            table: table.to_string(),
            row_count: rows as i64,
            columns,
            file: relative,
            sha256,
        })
    }

    /// Manifests of every complete snapshot, oldest first.
    pub fn list(&self) -> Result<Vec<SnapshotManifest>> {
        if !self.directory.exists() {
            return Ok(Vec::new());
        }

        let mut manifests = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            let is_partial = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(PARTIAL_SUFFIX))
                .unwrap_or(true);
            if !path.is_dir() || is_partial {
                continue;
            }
            match read_manifest(&path) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!("Ignoring {}: {}", path.display(), e),
            }
        }

        manifests.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.snapshot_id.cmp(&b.snapshot_id))
        });
        Ok(manifests)
    }

    /// The most recent complete snapshot, checksums verified.
    pub fn latest(&self) -> Result<Option<BackupSnapshot>> {
        match self.list()?.pop() {
            Some(manifest) => self.load(&manifest.snapshot_id).map(Some),
            None => Ok(None),
        }
    }

    /// Load a snapshot by id and verify its data files.
    pub fn load(&self, snapshot_id: &str) -> Result<BackupSnapshot> {
        check_file_name(snapshot_id)?;
        let location = self.directory.join(snapshot_id);
        if !location.is_dir() {
            return Err(MigrateError::backup(
                None,
                format!("snapshot {} not found in {}", snapshot_id, self.directory.display()),
            ));
        }

        let manifest = read_manifest(&location)?;
        if manifest.snapshot_id != snapshot_id {
            return Err(MigrateError::backup(
                None,
                format!(
                    "manifest in {} belongs to snapshot {}",
                    location.display(),
                    manifest.snapshot_id
                ),
            ));
        }

        let snapshot = BackupSnapshot {
            id: snapshot_id.to_string(),
            location,
            manifest,
        };
        snapshot.verify_files()?;
        Ok(snapshot)
    }
}

fn read_manifest(dir: &Path) -> Result<SnapshotManifest> {
    let path = dir.join(MANIFEST_FILE);
    let content = fs::read_to_string(&path).map_err(|e| io_error(None, &path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| MigrateError::backup(None, format!("invalid manifest {}: {}", path.display(), e)))
}

/// Table names and snapshot ids become path components.
fn check_file_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(MigrateError::backup(
            None,
            format!("{:?} cannot be used as a snapshot file name", name),
        ));
    }
    Ok(())
}

fn io_error(table: Option<&str>, path: &Path, e: std::io::Error) -> MigrateError {
    MigrateError::backup(table, format!("{}: {}", path.display(), e))
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut file = File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Writer that hashes everything passing through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Flush and return the hex digest.
    fn finish(mut self) -> std::io::Result<String> {
        self.inner.flush()?;
        Ok(hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
