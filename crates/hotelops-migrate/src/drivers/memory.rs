//! In-process database.
//!
//! Implements the same traits as the PostgreSQL driver so every engine stage
//! can run without a server. Tables enforce primary-key uniqueness and NOT NULL
//! columns; transactions work on a private copy of the table that replaces the
//! original only on commit. Foreign keys can be declared so that clearing a
//! table still referenced by committed rows fails the way PostgreSQL's
//! `ON DELETE RESTRICT` does. Reads and inserts can be made to fail on purpose.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::core::traits::{
    ColumnInfo, ReadOptions, SourceReader, TableReader, TableTransaction, TargetWriter,
};
use crate::core::value::{Row, SqlValue};
use crate::error::{MigrateError, Result};

#[derive(Debug, Clone)]
struct MemTable {
    columns: Vec<ColumnInfo>,
    primary_key: Vec<usize>,
    rows: Vec<Row>,
}

impl MemTable {
    fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    fn key(&self, row: &Row) -> String {
        self.primary_key
            .iter()
            .map(|&i| row.get(i).map(SqlValue::canonical).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }

    fn check_row(&self, table: &str, row: &Row) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(MigrateError::Driver(format!(
                "{}: row has {} values, table has {} columns",
                table,
                row.len(),
                self.columns.len()
            )));
        }
        for (column, value) in self.columns.iter().zip(row) {
            if value.is_null() && !column.is_nullable {
                return Err(MigrateError::Driver(format!(
                    "{}: null value in column \"{}\" violates not-null constraint",
                    table, column.name
                )));
            }
        }
        Ok(())
    }

    /// Append rows, rejecting duplicate primary keys.
    fn append(&mut self, table: &str, rows: Vec<Row>) -> Result<()> {
        let mut keys: HashSet<String> = if self.primary_key.is_empty() {
            HashSet::new()
        } else {
            self.rows.iter().map(|r| self.key(r)).collect()
        };
        for row in &rows {
            self.check_row(table, row)?;
            if !self.primary_key.is_empty() && !keys.insert(self.key(row)) {
                return Err(MigrateError::Driver(format!(
                    "{}: duplicate key value violates primary key ({})",
                    table,
                    self.key(row).replace('\u{1f}', ", ")
                )));
            }
        }
        self.rows.extend(rows);
        Ok(())
    }

    fn sorted_rows(&self, order_by: &[usize]) -> Vec<&Row> {
        let mut rows: Vec<&Row> = self.rows.iter().collect();
        if !order_by.is_empty() {
            rows.sort_by(|a, b| {
                order_by
                    .iter()
                    .map(|&i| compare_values(&a[i], &b[i]))
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }
        rows
    }
}

/// Total order over values, close to what a database `ORDER BY` gives.
fn compare_values(a: &SqlValue, b: &SqlValue) -> Ordering {
    match (a, b) {
        (SqlValue::Null(_), SqlValue::Null(_)) => Ordering::Equal,
        (SqlValue::Null(_), _) => Ordering::Greater,
        (_, SqlValue::Null(_)) => Ordering::Less,
        _ => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => match (a, b) {
                (SqlValue::F64(x), SqlValue::F64(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
                (SqlValue::Decimal(x), SqlValue::Decimal(y)) => x.cmp(y),
                (SqlValue::Date(x), SqlValue::Date(y)) => x.cmp(y),
                (SqlValue::DateTime(x), SqlValue::DateTime(y)) => x.cmp(y),
                (SqlValue::DateTimeOffset(x), SqlValue::DateTimeOffset(y)) => x.cmp(y),
                _ => a.canonical().cmp(&b.canonical()),
            },
        },
    }
}

/// `table.column` references `parent.parent_column`.
#[derive(Debug, Clone)]
struct Reference {
    table: String,
    column: String,
    parent: String,
    parent_column: String,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, MemTable>,
    references: Vec<Reference>,
    failing_reads: HashSet<String>,
    /// Table -> rows a transaction may insert before the next insert fails.
    failing_inserts: HashMap<String, u64>,
}

/// In-memory database implementing [`SourceReader`] and [`TargetWriter`].
///
/// Clones share the same tables.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    name: String,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    /// Create (or replace) an empty table.
    pub fn create_table(&self, name: &str, columns: Vec<ColumnInfo>, primary_key: Vec<&str>) {
        let primary_key = primary_key
            .iter()
            .filter_map(|k| columns.iter().position(|c| c.name == *k))
            .collect();
        self.lock().tables.insert(
            name.to_string(),
            MemTable {
                columns,
                primary_key,
                rows: Vec::new(),
            },
        );
    }

    /// Insert complete rows (values in table column order) outside any transaction.
    pub fn insert_rows(&self, table: &str, rows: Vec<Row>) -> Result<()> {
        let mut inner = self.lock();
        let t = table_mut(&mut inner, table)?;
        t.append(table, rows)
    }

    /// Replace the row whose primary key matches `row`.
    pub fn replace_row(&self, table: &str, row: Row) -> Result<()> {
        let mut inner = self.lock();
        let t = table_mut(&mut inner, table)?;
        t.check_row(table, &row)?;
        let key = t.key(&row);
        let idx = t
            .rows
            .iter()
            .position(|r| t.key(r) == key)
            .ok_or_else(|| MigrateError::Driver(format!("{}: no row with key {}", table, key)))?;
        t.rows[idx] = row;
        Ok(())
    }

    /// Delete the row with primary key `key`.
    pub fn delete_row(&self, table: &str, key: &[SqlValue]) -> Result<()> {
        let mut inner = self.lock();
        let t = table_mut(&mut inner, table)?;
        let wanted = key
            .iter()
            .map(SqlValue::canonical)
            .collect::<Vec<_>>()
            .join("\u{1f}");
        let before = t.rows.len();
        let kept: Vec<Row> = t
            .rows
            .iter()
            .filter(|r| t.key(r) != wanted)
            .cloned()
            .collect();
        if kept.len() == before {
            return Err(MigrateError::Driver(format!("{}: no row with key {}", table, wanted)));
        }
        t.rows = kept;
        Ok(())
    }

    /// All rows of a table, in primary-key order.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let inner = self.lock();
        let t = table_ref(&inner, table)?;
        Ok(t.sorted_rows(&t.primary_key).into_iter().cloned().collect())
    }

    /// Declare a foreign key from `table.column` to `parent.parent_column`.
    pub fn add_reference(&self, table: &str, column: &str, parent: &str, parent_column: &str) {
        self.lock().references.push(Reference {
            table: table.to_string(),
            column: column.to_string(),
            parent: parent.to_string(),
            parent_column: parent_column.to_string(),
        });
    }

    /// Make every read of `table` fail.
    pub fn fail_reads(&self, table: &str) {
        self.lock().failing_reads.insert(table.to_string());
    }

    /// Let transactions on `table` insert `after_rows` rows; the insert that
    /// would go past that fails.
    pub fn fail_inserts(&self, table: &str, after_rows: u64) {
        self.lock()
            .failing_inserts
            .insert(table.to_string(), after_rows);
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        let mut inner = self.lock();
        inner.failing_reads.clear();
        inner.failing_inserts.clear();
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    // A panicking test thread must not wedge the other tables.
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn table_ref<'a>(inner: &'a Inner, table: &str) -> Result<&'a MemTable> {
    inner
        .tables
        .get(table)
        .ok_or_else(|| MigrateError::Driver(format!("relation \"{}\" does not exist", table)))
}

fn table_mut<'a>(inner: &'a mut Inner, table: &str) -> Result<&'a mut MemTable> {
    inner
        .tables
        .get_mut(table)
        .ok_or_else(|| MigrateError::Driver(format!("relation \"{}\" does not exist", table)))
}

/// For each foreign key into `parent`: the referencing table, the referenced
/// column and the values committed rows still point at.
fn referenced_values(inner: &Inner, parent: &str) -> Vec<(String, String, HashSet<String>)> {
    inner
        .references
        .iter()
        .filter(|r| r.parent == parent && r.table != parent)
        .filter_map(|r| {
            let child = inner.tables.get(&r.table)?;
            let pos = child.position(&r.column)?;
            let values = child
                .rows
                .iter()
                .map(|row| &row[pos])
                .filter(|v| !v.is_null())
                .map(SqlValue::canonical)
                .collect();
            Some((r.table.clone(), r.parent_column.clone(), values))
        })
        .collect()
}

fn check_reads(inner: &Inner, table: &str) -> Result<()> {
    if inner.failing_reads.contains(table) {
        return Err(MigrateError::Driver(format!(
            "could not read from relation \"{}\": injected failure",
            table
        )));
    }
    Ok(())
}

#[async_trait]
impl TableReader for MemoryDatabase {
    async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let inner = self.lock();
        Ok(inner
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let inner = self.lock();
        check_reads(&inner, table)?;
        Ok(table_ref(&inner, table)?.rows.len() as i64)
    }

    async fn read_batch(&self, opts: &ReadOptions) -> Result<Vec<Row>> {
        let inner = self.lock();
        check_reads(&inner, &opts.table)?;
        let t = table_ref(&inner, &opts.table)?;

        let positions = |names: &[String]| -> Result<Vec<usize>> {
            names
                .iter()
                .map(|c| {
                    t.position(c).ok_or_else(|| {
                        MigrateError::Driver(format!(
                            "column \"{}\" of relation \"{}\" does not exist",
                            c, opts.table
                        ))
                    })
                })
                .collect()
        };
        let columns = positions(&opts.columns)?;
        let order_by = positions(&opts.order_by)?;

        Ok(t.sorted_rows(&order_by)
            .into_iter()
            .skip(opts.offset as usize)
            .take(opts.limit)
            .map(|row| columns.iter().map(|&i| row[i].clone()).collect())
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {
        debug!("{}: closed", self.name);
    }
}

impl SourceReader for MemoryDatabase {}

#[async_trait]
impl TargetWriter for MemoryDatabase {
    async fn begin(&self, table: &str) -> Result<Box<dyn TableTransaction>> {
        let staged = table_ref(&self.lock(), table)?.clone();
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            table: table.to_string(),
            staged: Some(staged),
            inserted: 0,
        }))
    }
}

/// A transaction over a private copy of one table.
pub struct MemoryTransaction {
    inner: Arc<Mutex<Inner>>,
    table: String,
    /// `None` once committed or rolled back.
    staged: Option<MemTable>,
    inserted: u64,
}

impl MemoryTransaction {
    fn staged(&mut self) -> Result<&mut MemTable> {
        let table = &self.table;
        self.staged.as_mut().ok_or_else(|| {
            MigrateError::Driver(format!("{}: transaction already finished", table))
        })
    }
}

#[async_trait]
impl TableTransaction for MemoryTransaction {
    fn table(&self) -> &str {
        &self.table
    }

    async fn clear(&mut self) -> Result<u64> {
        let references = referenced_values(&lock(&self.inner), &self.table);
        let table = self.table.clone();
        let staged = self.staged()?;
        for (child, parent_column, values) in &references {
            let pos = match staged.position(parent_column) {
                Some(pos) => pos,
                None => continue,
            };
            if staged.rows.iter().any(|row| values.contains(&row[pos].canonical())) {
                return Err(MigrateError::Driver(format!(
                    "update or delete on table \"{}\" violates foreign key constraint: \
                     rows are still referenced from table \"{}\"",
                    table, child
                )));
            }
        }
        let n = staged.rows.len() as u64;
        staged.rows.clear();
        Ok(n)
    }

    async fn insert_batch(&mut self, columns: &[String], rows: &[Row]) -> Result<u64> {
        let limit = lock(&self.inner).failing_inserts.get(&self.table).copied();
        if let Some(limit) = limit {
            if self.inserted + rows.len() as u64 > limit {
                return Err(MigrateError::Driver(format!(
                    "insert into \"{}\" failed after {} rows: injected failure",
                    self.table, self.inserted
                )));
            }
        }

        let table = self.table.clone();
        let staged = self.staged()?;
        let positions = columns
            .iter()
            .map(|c| {
                staged.position(c).ok_or_else(|| {
                    MigrateError::Driver(format!(
                        "column \"{}\" of relation \"{}\" does not exist",
                        c, table
                    ))
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        let full_rows = rows
            .iter()
            .map(|row| {
                let mut full: Row = staged
                    .columns
                    .iter()
                    .map(|_| SqlValue::NULL)
                    .collect();
                for (&pos, value) in positions.iter().zip(row) {
                    full[pos] = value.clone();
                }
                full
            })
            .collect();
        staged.append(&table, full_rows)?;

        self.inserted += rows.len() as u64;
        Ok(rows.len() as u64)
    }

    async fn commit(&mut self) -> Result<()> {
        let staged = self.staged.take().ok_or_else(|| {
            MigrateError::Driver(format!("{}: transaction already finished", self.table))
        })?;
        lock(&self.inner).tables.insert(self.table.clone(), staged);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.staged = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> MemoryDatabase {
        let db = MemoryDatabase::new("memory");
        db.create_table(
            "rooms",
            vec![
                ColumnInfo::new("id", "int4", false),
                ColumnInfo::new("number", "text", false),
                ColumnInfo::new("note", "text", true),
            ],
            vec!["id"],
        );
        db.insert_rows(
            "rooms",
            (1..=12)
                .rev()
                .map(|i| {
                    vec![
                        SqlValue::I32(i),
                        SqlValue::Text(format!("R{}", i)),
                        SqlValue::NULL,
                    ]
                })
                .collect(),
        )
        .unwrap();
        db
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_read_batch_pages_in_key_order() {
        let db = db();
        let mut opts = ReadOptions::new("rooms", cols(&["number"]), cols(&["id"]), 5);
        let first = db.read_batch(&opts).await.unwrap();
        assert_eq!(first.len(), 5);
        assert_eq!(first[0][0], SqlValue::from("R1"));

        opts.advance(5);
        opts.advance(5);
        let last = db.read_batch(&opts).await.unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last[1][0], SqlValue::from("R12"));
    }

    #[tokio::test]
    async fn test_clear_refused_while_referenced() {
        let db = db();
        db.create_table(
            "bookings",
            vec![
                ColumnInfo::new("id", "int4", false),
                ColumnInfo::new("room_id", "int4", true),
            ],
            vec!["id"],
        );
        db.add_reference("bookings", "room_id", "rooms", "id");
        db.insert_rows("bookings", vec![vec![SqlValue::I32(1), SqlValue::I32(4)]])
            .unwrap();

        let mut tx = db.begin("rooms").await.unwrap();
        let err = tx.clear().await.unwrap_err();
        assert!(err.to_string().contains("foreign key"));
        tx.rollback().await.unwrap();

        let mut tx = db.begin("bookings").await.unwrap();
        tx.clear().await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = db.begin("rooms").await.unwrap();
        assert_eq!(tx.clear().await.unwrap(), 12);
        tx.commit().await.unwrap();
        assert_eq!(db.row_count("rooms").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_table_has_no_columns() {
        let db = db();
        assert!(db.table_columns("spa").await.unwrap().is_empty());
        assert!(db.row_count("spa").await.is_err());
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let db = db();
        let mut tx = db.begin("rooms").await.unwrap();
        tx.clear().await.unwrap();
        assert_eq!(db.row_count("rooms").await.unwrap(), 12);
        tx.rollback().await.unwrap();
        assert_eq!(db.row_count("rooms").await.unwrap(), 12);

        let mut tx = db.begin("rooms").await.unwrap();
        tx.clear().await.unwrap();
        tx.insert_batch(
            &cols(&["id", "number"]),
            &[vec![SqlValue::I64(100), SqlValue::from("Suite")]],
        )
        .await
        .unwrap();
        drop(tx);
        assert_eq!(db.row_count("rooms").await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_commit_replaces_table() {
        let db = db();
        let mut tx = db.begin("rooms").await.unwrap();
        tx.clear().await.unwrap();
        tx.insert_batch(
            &cols(&["id", "number"]),
            &[vec![SqlValue::I64(100), SqlValue::from("Suite")]],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let rows = db.rows("rooms").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0][2].is_null());
        assert!(tx.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_constraints() {
        let db = db();
        let mut tx = db.begin("rooms").await.unwrap();
        let dup = tx
            .insert_batch(
                &cols(&["id", "number"]),
                &[vec![SqlValue::I64(3), SqlValue::from("again")]],
            )
            .await;
        assert!(dup.is_err());

        let not_null = tx
            .insert_batch(&cols(&["id"]), &[vec![SqlValue::I64(50)]])
            .await;
        assert!(not_null.unwrap_err().to_string().contains("not-null"));
    }

    #[tokio::test]
    async fn test_injected_insert_failure() {
        let db = db();
        db.fail_inserts("rooms", 1);
        let mut tx = db.begin("rooms").await.unwrap();
        tx.clear().await.unwrap();
        let row = |i: i64| vec![SqlValue::I64(i), SqlValue::from("x")];
        assert_eq!(
            tx.insert_batch(&cols(&["id", "number"]), &[row(1)])
                .await
                .unwrap(),
            1
        );
        assert!(tx
            .insert_batch(&cols(&["id", "number"]), &[row(2)])
            .await
            .is_err());

        db.clear_faults();
        db.fail_reads("rooms");
        assert!(db.row_count("rooms").await.is_err());
    }

    #[test]
    fn test_compare_values_mixed_integer_widths() {
        assert_eq!(
            compare_values(&SqlValue::I32(9), &SqlValue::I64(10)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&SqlValue::NULL, &SqlValue::I64(10)),
            Ordering::Greater
        );
    }
}
