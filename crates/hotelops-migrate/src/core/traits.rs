//! Core traits for the database collaborators used by the migration engine.
//!
//! - [`TableReader`]: column introspection, counting and paged reads
//! - [`SourceReader`]: the legacy schema, read-only
//! - [`TargetWriter`]: the new schema, read plus per-table transactions
//! - [`TableTransaction`]: one exclusive destination transaction on one table
//!
//! Every component of the engine talks to the databases through these traits,
//! so each stage can be exercised against [`MemoryDatabase`] in tests.
//!
//! [`MemoryDatabase`]: crate::drivers::memory::MemoryDatabase

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::value::Row;

/// Column metadata reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Driver-specific type name (e.g. `int4`, `varchar`).
    pub data_type: String,
    /// Whether the column accepts NULL.
    pub is_nullable: bool,
}

impl ColumnInfo {
    /// Create column metadata.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, is_nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable,
        }
    }
}

/// Options for reading one page of rows from a table.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Table name (unqualified; the driver applies its schema).
    pub table: String,
    /// Columns to read, in output order.
    pub columns: Vec<String>,
    /// Columns giving a stable total order (normally the primary key).
    pub order_by: Vec<String>,
    /// Rows to skip.
    pub offset: u64,
    /// Maximum rows to return.
    pub limit: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            table: String::new(),
            columns: Vec::new(),
            order_by: Vec::new(),
            offset: 0,
            limit: 10_000,
        }
    }
}

impl ReadOptions {
    /// Options for the first page of `table`.
    pub fn new(
        table: impl Into<String>,
        columns: Vec<String>,
        order_by: Vec<String>,
        limit: usize,
    ) -> Self {
        Self {
            table: table.into(),
            columns,
            order_by,
            offset: 0,
            limit,
        }
    }

    /// Move to the page following one that returned `rows` rows.
    pub fn advance(&mut self, rows: usize) {
        self.offset += rows as u64;
    }
}

/// Read access shared by source and destination databases.
#[async_trait]
pub trait TableReader: Send + Sync {
    /// Column metadata for a table, in ordinal order. Empty if the table does not exist.
    async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Exact row count for a table.
    async fn row_count(&self, table: &str) -> Result<i64>;

    /// Read one page of rows. An empty page means the table is exhausted.
    async fn read_batch(&self, opts: &ReadOptions) -> Result<Vec<Row>>;

    /// Round-trip a trivial query to check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Get the database type identifier (e.g., "postgres", "memory").
    fn db_type(&self) -> &str;

    /// Close the connection pool.
    async fn close(&self);
}

/// The legacy database rows are extracted from.
pub trait SourceReader: TableReader {}

/// The new database rows are loaded into.
#[async_trait]
pub trait TargetWriter: TableReader {
    /// Open an exclusive transaction on `table`.
    ///
    /// Nothing written through the returned handle is visible to other
    /// readers until [`TableTransaction::commit`] succeeds.
    async fn begin(&self, table: &str) -> Result<Box<dyn TableTransaction>>;
}

/// A destination transaction scoped to a single table.
///
/// Dropping a transaction that was neither committed nor rolled back must
/// discard its writes.
#[async_trait]
pub trait TableTransaction: Send {
    /// Table this transaction writes to.
    fn table(&self) -> &str;

    /// Delete every row of the table inside the transaction. Returns rows deleted.
    async fn clear(&mut self) -> Result<u64>;

    /// Insert rows, values ordered like `columns`. Returns rows inserted.
    async fn insert_batch(&mut self, columns: &[String], rows: &[Row]) -> Result<u64>;

    /// Make every write of this transaction durable.
    async fn commit(&mut self) -> Result<()>;

    /// Discard every write of this transaction.
    async fn rollback(&mut self) -> Result<()>;
}

/// Read a whole table page by page, handing each page to `on_page`.
///
/// Returns the number of rows read.
pub async fn read_pages<R, F>(reader: &R, mut opts: ReadOptions, mut on_page: F) -> Result<u64>
where
    R: TableReader + ?Sized,
    F: FnMut(Vec<Row>) -> Result<()>,
{
    let mut total = 0u64;
    loop {
        let page = reader.read_batch(&opts).await?;
        let n = page.len();
        if n == 0 {
            break;
        }
        total += n as u64;
        on_page(page)?;
        if n < opts.limit {
            break;
        }
        opts.advance(n);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_options_default() {
        let opts = ReadOptions::default();
        assert_eq!(opts.limit, 10_000);
        assert_eq!(opts.offset, 0);
        assert!(opts.columns.is_empty());
    }

    #[test]
    fn test_read_options_advance() {
        let mut opts = ReadOptions::new("hotels", vec!["id".into()], vec!["id".into()], 500);
        opts.advance(500);
        opts.advance(120);
        assert_eq!(opts.offset, 620);
        assert_eq!(opts.limit, 500);
    }
}
