//! Write side of the PostgreSQL driver.
//!
//! Every value is sent as a text parameter and cast server-side to the real
//! column type (`$1::text::"int8"`), so a transformed value only has to be
//! representable in the column, not carry the exact Rust type the column
//! would decode to.

use std::collections::HashMap;

use async_trait::async_trait;
use deadpool_postgres::Object;
use tokio_postgres::types::ToSql;
use tracing::{debug, warn};

use super::PostgresDatabase;
use crate::core::identifier::{quote_pg, quote_pg_list};
use crate::core::traits::{TableReader, TableTransaction, TargetWriter};
use crate::core::value::{Row, SqlValue};
use crate::error::{MigrateError, Result};

/// Bind parameters PostgreSQL accepts per statement.
const MAX_PARAMS: usize = 65_535;

/// Text form of a value as a statement parameter. `None` binds NULL.
pub(crate) fn param_text(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::Null(_) => None,
        SqlValue::DateTimeOffset(v) => Some(v.to_rfc3339()),
        other => Some(other.canonical()),
    }
}

/// `INSERT` for `rows` rows, casting every parameter to its column type.
pub(crate) fn insert_sql(qualified: &str, columns: &[String], types: &[String], rows: usize) -> Result<String> {
    let casts = types
        .iter()
        .map(|t| quote_pg(t))
        .collect::<Result<Vec<_>>>()?;
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ",
        qualified,
        quote_pg_list(columns)?
    );
    let mut param = 1;
    for r in 0..rows {
        if r > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for (c, cast) in casts.iter().enumerate() {
            if c > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("${}::text::{}", param, cast));
            param += 1;
        }
        sql.push(')');
    }
    Ok(sql)
}

#[async_trait]
impl TargetWriter for PostgresDatabase {
    async fn begin(&self, table: &str) -> Result<Box<dyn TableTransaction>> {
        let types: HashMap<String, String> = self
            .table_columns(table)
            .await?
            .into_iter()
            .map(|c| (c.name, c.data_type))
            .collect();
        if types.is_empty() {
            return Err(MigrateError::destination_write(
                table,
                format!("table does not exist in schema {}", self.schema),
            ));
        }

        let client = self.client("opening transaction").await?;
        client.batch_execute("BEGIN").await?;
        debug!("{}: transaction opened", table);

        Ok(Box::new(PostgresTransaction {
            client: Some(client),
            table: table.to_string(),
            qualified: self.qualify(table)?,
            types,
            finished: false,
        }))
    }
}

/// An open transaction holding one pooled connection.
///
/// Dropped unfinished, the connection is detached from the pool and closed,
/// which makes the server abort the transaction.
pub struct PostgresTransaction {
    client: Option<Object>,
    table: String,
    qualified: String,
    types: HashMap<String, String>,
    finished: bool,
}

impl PostgresTransaction {
    fn client(&self) -> Result<&Object> {
        match (&self.client, self.finished) {
            (Some(client), false) => Ok(client),
            _ => Err(MigrateError::destination_write(
                &self.table,
                "transaction already finished",
            )),
        }
    }

    async fn finish(&mut self, statement: &str) -> Result<()> {
        self.client()?.batch_execute(statement).await?;
        self.finished = true;
        debug!("{}: {}", self.table, statement);
        Ok(())
    }
}

#[async_trait]
impl TableTransaction for PostgresTransaction {
    fn table(&self) -> &str {
        &self.table
    }

    async fn clear(&mut self) -> Result<u64> {
        let sql = format!("DELETE FROM {}", self.qualified);
        Ok(self.client()?.execute(sql.as_str(), &[]).await?)
    }

    async fn insert_batch(&mut self, columns: &[String], rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let types = columns
            .iter()
            .map(|c| {
                self.types.get(c).cloned().ok_or_else(|| {
                    MigrateError::destination_write(
                        &self.table,
                        format!("column {} does not exist", c),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let rows_per_statement = (MAX_PARAMS / columns.len().max(1)).max(1);
        let client = self.client()?;
        let mut inserted = 0;
        for chunk in rows.chunks(rows_per_statement) {
            let sql = insert_sql(&self.qualified, columns, &types, chunk.len())?;
            let params: Vec<Option<String>> = chunk
                .iter()
                .flat_map(|row| row.iter().map(param_text))
                .collect();
            let refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            inserted += client.execute(sql.as_str(), &refs).await?;
        }
        Ok(inserted)
    }

    async fn commit(&mut self) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if !self.finished {
                warn!("{}: unfinished transaction dropped, closing its connection", self.table);
                drop(Object::take(client));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    #[test]
    fn test_insert_sql_casts_each_parameter() {
        let sql = insert_sql(
            "\"public\".\"rooms\"",
            &["id".to_string(), "number".to_string()],
            &["int8".to_string(), "varchar".to_string()],
            2,
        )
        .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"rooms\" (\"id\", \"number\") VALUES \
             ($1::text::\"int8\", $2::text::\"varchar\"), ($3::text::\"int8\", $4::text::\"varchar\")"
        );
    }

    #[test]
    fn test_param_text() {
        assert_eq!(param_text(&SqlValue::NULL), None);
        assert_eq!(param_text(&SqlValue::I32(7)).as_deref(), Some("7"));
        assert_eq!(param_text(&SqlValue::Bytes(vec![0xab])).as_deref(), Some("\\xab"));

        let offset = FixedOffset::east_opt(3600).unwrap();
        let ts = offset.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).unwrap();
        assert_eq!(
            param_text(&SqlValue::DateTimeOffset(ts)).as_deref(),
            Some("2024-05-01T14:00:00+01:00")
        );
    }
}
