//! Type definitions for post-load verification.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::value::SqlValue;

/// Outcome of verifying one table.
///
/// A mismatch is a value, not an error: the caller decides what failing
/// verification means for the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum VerificationResult {
    /// Counts (and checksums, when computed) agree.
    Match {
        expected: i64,
        actual: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
        #[serde(default)]
        rows_checksummed: u64,
    },

    /// Counts or checksums differ.
    Mismatch {
        expected: i64,
        actual: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_checksum: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actual_checksum: Option<String>,
    },

    /// Verification did not run (dry run without writes).
    Skipped { reason: String },
}

impl VerificationResult {
    pub fn is_match(&self) -> bool {
        matches!(self, VerificationResult::Match { .. })
    }

    pub fn is_mismatch(&self) -> bool {
        matches!(self, VerificationResult::Mismatch { .. })
    }

    /// Human-readable detail of a mismatch, if any.
    pub fn mismatch_detail(&self) -> Option<String> {
        match self {
            VerificationResult::Mismatch {
                expected,
                actual,
                expected_checksum: Some(e),
                actual_checksum: Some(a),
            } if expected == actual => Some(format!("checksum {} != {}", a, e)),
            VerificationResult::Mismatch {
                expected, actual, ..
            } => Some(format!("row count {} != {}", actual, expected)),
            _ => None,
        }
    }
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationResult::Match {
                actual, checksum, ..
            } => match checksum {
                Some(c) => write!(f, "match ({} rows, checksum {})", actual, c),
                None => write!(f, "match ({} rows)", actual),
            },
            VerificationResult::Mismatch { .. } => write!(
                f,
                "MISMATCH ({})",
                self.mismatch_detail().unwrap_or_default()
            ),
            VerificationResult::Skipped { reason } => write!(f, "skipped ({})", reason),
        }
    }
}

/// Order-independent checksum over canonically encoded rows.
///
/// Each row is hashed with SHA-256; the first 16 bytes of every digest are
/// summed with wrapping arithmetic. Two row multisets produce the same
/// checksum regardless of the order the rows were read in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableChecksum {
    sum: u128,
    rows: u64,
}

impl TableChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a row whose digest was computed with [`row_digest`].
    pub fn add_digest(&mut self, digest: &[u8; 32]) {
        let mut prefix = [0u8; 16];
        prefix.copy_from_slice(&digest[..16]);
        self.sum = self.sum.wrapping_add(u128::from_be_bytes(prefix));
        self.rows += 1;
    }

    /// Rows folded into the checksum.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Hex form, as stored in reports.
    pub fn to_hex(&self) -> String {
        format!("{:032x}", self.sum)
    }
}

/// SHA-256 of a row's canonical encoding. Every value is length-prefixed so
/// that column boundaries are unambiguous.
pub fn row_digest(row: &[SqlValue]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for value in row {
        let text = value.canonical();
        hasher.update((text.len() as u64).to_le_bytes());
        hasher.update(text.as_bytes());
    }
    hasher.finalize().into()
}

/// Content-based row sampler.
///
/// A row is in the sample when the first byte of its digest falls below a
/// threshold derived from the sample percentage, so the source and destination
/// sides select the same rows without coordinating on keys or order.
#[derive(Debug, Clone, Copy)]
pub struct RowSampler {
    threshold: u16,
}

impl RowSampler {
    /// Sampler keeping roughly `percent`% of rows (100 keeps all).
    pub fn new(percent: u8) -> Self {
        let percent = u16::from(percent.min(100));
        Self {
            threshold: (percent * 256).div_ceil(100),
        }
    }

    /// Sampler keeping every row.
    pub fn all() -> Self {
        Self::new(100)
    }

    pub fn includes(&self, digest: &[u8; 32]) -> bool {
        u16::from(digest[0]) < self.threshold
    }
}

/// Row counts of one table on both sides, for the standalone `verify` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountComparison {
    /// Destination table name.
    pub table: String,
    /// Row count of the source table.
    pub source_rows: i64,
    /// Row count of the destination table.
    pub destination_rows: i64,
}

impl CountComparison {
    pub fn matches(&self) -> bool {
        self.source_rows == self.destination_rows
    }
}

/// Row count comparison across every planned table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CountReport {
    /// Results for each table, in plan order.
    pub tables: Vec<CountComparison>,
    /// Tables whose counts agree.
    pub tables_matched: usize,
    /// Tables whose counts differ.
    pub tables_mismatched: usize,
}

impl CountReport {
    /// Add a table result.
    pub fn add_table(&mut self, result: CountComparison) {
        if result.matches() {
            self.tables_matched += 1;
        } else {
            self.tables_mismatched += 1;
        }
        self.tables.push(result);
    }

    pub fn all_match(&self) -> bool {
        self.tables_mismatched == 0
    }
}
