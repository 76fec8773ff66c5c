//! Post-load verification.
//!
//! Three strictness levels:
//!
//! - **count**: destination row count equals the expected count
//! - **sampled**: count check plus a checksum over a content-selected sample
//! - **full**: count check plus a checksum over every row
//!
//! Checksums compare the transformed source rows against the destination rows,
//! both canonically encoded, so the comparison does not depend on read order
//! or on the integer width either driver reports.

pub mod types;

pub use types::{
    row_digest, CountComparison, CountReport, RowSampler, TableChecksum, VerificationResult,
};

use tracing::{debug, info, warn};

use crate::config::{LoadMode, VerificationConfig, VerificationLevel};
use crate::core::traits::{read_pages, ReadOptions, TableReader};
use crate::error::{MigrateError, Result};
use crate::migrator::{source_read_options, transform_row};
use crate::plan::TableSpec;
use crate::state::TableOutcome;

/// Verifies committed tables against their source.
#[derive(Debug, Clone)]
pub struct VerificationEngine {
    level: VerificationLevel,
    sample_percent: u8,
    batch_size: usize,
    load_mode: LoadMode,
}

impl VerificationEngine {
    pub fn new(config: &VerificationConfig, batch_size: usize, load_mode: LoadMode) -> Self {
        Self {
            level: config.level,
            sample_percent: config.sample_percent,
            batch_size,
            load_mode,
        }
    }

    pub fn level(&self) -> VerificationLevel {
        self.level
    }

    fn sampler(&self) -> Option<RowSampler> {
        match self.level {
            VerificationLevel::Count => None,
            VerificationLevel::Sampled => Some(RowSampler::new(self.sample_percent)),
            VerificationLevel::Full => Some(RowSampler::all()),
        }
    }

    /// Verify `spec` right after its transaction committed.
    ///
    /// Also records the post-load destination count on `outcome`. A mismatch
    /// is returned as [`VerificationResult::Mismatch`]; only read failures are
    /// errors.
    pub async fn verify<S, D>(
        &self,
        spec: &TableSpec,
        outcome: &mut TableOutcome,
        source: &S,
        destination: &D,
    ) -> Result<VerificationResult>
    where
        S: TableReader + ?Sized,
        D: TableReader + ?Sized,
    {
        let table = spec.destination.as_str();

        let loaded = match outcome.source_rows {
            Some(n) => n,
            None => source
                .row_count(&spec.source)
                .await
                .map_err(|e| MigrateError::source_read(&spec.source, e))?,
        };
        let expected = match self.load_mode {
            LoadMode::Truncate => loaded,
            LoadMode::Append => outcome.destination_rows_before.unwrap_or(0) + loaded,
        };
        let actual = destination
            .row_count(table)
            .await
            .map_err(|e| MigrateError::destination_write(table, e))?;
        outcome.destination_rows_after = Some(actual);

        if expected != actual {
            warn!(
                "{}: row count MISMATCH (source {}, destination {})",
                table, expected, actual
            );
            return Ok(VerificationResult::Mismatch {
                expected,
                actual,
                expected_checksum: None,
                actual_checksum: None,
            });
        }

        let sampler = match (self.sampler(), self.load_mode) {
            (Some(sampler), LoadMode::Truncate) => sampler,
            (Some(_), LoadMode::Append) => {
                debug!(
                    "{}: append mode keeps earlier rows, checksum skipped",
                    table
                );
                return Ok(count_match(table, expected, actual));
            }
            (None, _) => return Ok(count_match(table, expected, actual)),
        };

        let expected_sum = self.source_checksum(spec, sampler, source).await?;
        let actual_sum = self
            .destination_checksum(spec, sampler, destination)
            .await?;

        if expected_sum == actual_sum {
            info!(
                "{}: {} rows match, checksum {} over {} rows",
                table,
                actual,
                actual_sum.to_hex(),
                actual_sum.rows()
            );
            Ok(VerificationResult::Match {
                expected,
                actual,
                checksum: Some(actual_sum.to_hex()),
                rows_checksummed: actual_sum.rows(),
            })
        } else {
            warn!(
                "{}: checksum MISMATCH (source {}, destination {})",
                table,
                expected_sum.to_hex(),
                actual_sum.to_hex()
            );
            Ok(VerificationResult::Mismatch {
                expected,
                actual,
                expected_checksum: Some(expected_sum.to_hex()),
                actual_checksum: Some(actual_sum.to_hex()),
            })
        }
    }

    async fn source_checksum<S>(
        &self,
        spec: &TableSpec,
        sampler: RowSampler,
        source: &S,
    ) -> Result<TableChecksum>
    where
        S: TableReader + ?Sized,
    {
        let mut checksum = TableChecksum::new();
        let opts = source_read_options(spec, self.batch_size);
        read_pages(source, opts, |page| {
            for row in page {
                let row = transform_row(spec, row)?;
                let digest = row_digest(&row);
                if sampler.includes(&digest) {
                    checksum.add_digest(&digest);
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| match e {
            MigrateError::Transform { .. } | MigrateError::SourceRead { .. } => e,
            other => MigrateError::source_read(&spec.source, other),
        })?;
        Ok(checksum)
    }

    async fn destination_checksum<D>(
        &self,
        spec: &TableSpec,
        sampler: RowSampler,
        destination: &D,
    ) -> Result<TableChecksum>
    where
        D: TableReader + ?Sized,
    {
        let mut checksum = TableChecksum::new();
        let opts = ReadOptions::new(
            spec.destination.clone(),
            spec.destination_columns(),
            spec.primary_key.clone(),
            self.batch_size,
        );
        read_pages(destination, opts, |page| {
            for row in page {
                let digest = row_digest(&row);
                if sampler.includes(&digest) {
                    checksum.add_digest(&digest);
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| MigrateError::destination_write(&spec.destination, e))?;
        Ok(checksum)
    }

    /// Compare source and destination row counts for every table, without
    /// migrating anything.
    pub async fn compare_counts<S, D>(
        &self,
        specs: &[TableSpec],
        source: &S,
        destination: &D,
    ) -> Result<CountReport>
    where
        S: TableReader + ?Sized,
        D: TableReader + ?Sized,
    {
        let mut report = CountReport::default();
        for spec in specs {
            let source_rows = source
                .row_count(&spec.source)
                .await
                .map_err(|e| MigrateError::source_read(&spec.source, e))?;
            let destination_rows = destination
                .row_count(&spec.destination)
                .await
                .map_err(|e| MigrateError::destination_write(&spec.destination, e))?;
            let result = CountComparison {
                table: spec.destination.clone(),
                source_rows,
                destination_rows,
            };
            if result.matches() {
                info!("{}: {} rows (match)", result.table, destination_rows);
            } else {
                warn!(
                    "{}: source {} rows, destination {} rows (MISMATCH)",
                    result.table, source_rows, destination_rows
                );
            }
            report.add_table(result);
        }
        Ok(report)
    }
}

fn count_match(table: &str, expected: i64, actual: i64) -> VerificationResult {
    info!("{}: {} rows match", table, actual);
    VerificationResult::Match {
        expected,
        actual,
        checksum: None,
        rows_checksummed: 0,
    }
}
