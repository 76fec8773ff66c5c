//! Read side of the PostgreSQL driver.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::debug;

use super::PostgresDatabase;
use crate::core::identifier::{quote_pg, quote_pg_list};
use crate::core::traits::{ColumnInfo, ReadOptions, SourceReader, TableReader};
use crate::core::value::{Row, SqlNullType, SqlValue};
use crate::error::{MigrateError, Result};

const COLUMNS_QUERY: &str = r#"
    SELECT
        column_name,
        udt_name,
        CASE WHEN is_nullable = 'YES' THEN true ELSE false END
    FROM information_schema.columns
    WHERE table_schema = $1 AND table_name = $2
    ORDER BY ordinal_position
"#;

/// Column types [`convert_pg_row_value`] decodes in binary form. Every other
/// type (enums, `interval`, `inet`, arrays, `money`, `numeric`, ...) is
/// selected as `::text`.
const BINARY_TYPES: &[&str] = &[
    "bool", "int2", "int4", "int8", "float4", "float8", "uuid", "timestamp", "timestamptz",
    "date", "time", "bytea", "json", "jsonb", "text", "varchar", "bpchar", "name",
];

/// Build the page query: ordered so that OFFSET paging is stable. `types`
/// maps column names to udt names; columns missing from it are selected as is.
pub(crate) fn select_page_sql(
    qualified: &str,
    opts: &ReadOptions,
    types: &HashMap<String, String>,
) -> Result<String> {
    let columns = opts
        .columns
        .iter()
        .map(|c| {
            let quoted = quote_pg(c)?;
            Ok(match types.get(c) {
                Some(udt) if !BINARY_TYPES.contains(&udt.as_str()) => {
                    format!("{0}::text AS {0}", quoted)
                }
                _ => quoted,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), qualified);
    if !opts.order_by.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", quote_pg_list(&opts.order_by)?));
    }
    sql.push_str(&format!(" LIMIT {} OFFSET {}", opts.limit, opts.offset));
    Ok(sql)
}

impl PostgresDatabase {
    async fn column_types(&self, table: &str) -> Result<Arc<HashMap<String, String>>> {
        let cached = self.type_cache().get(table).cloned();
        if let Some(types) = cached {
            return Ok(types);
        }

        let types: HashMap<String, String> = self
            .table_columns(table)
            .await?
            .into_iter()
            .map(|c| (c.name, c.data_type))
            .collect();
        let types = Arc::new(types);
        if !types.is_empty() {
            self.type_cache().insert(table.to_string(), types.clone());
        }
        Ok(types)
    }
}

#[async_trait]
impl TableReader for PostgresDatabase {
    async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let client = self.client("loading columns").await?;
        let rows = client.query(COLUMNS_QUERY, &[&self.schema, &table]).await?;
        let columns: Vec<ColumnInfo> = rows
            .iter()
            .map(|row| {
                ColumnInfo::new(
                    row.get::<_, String>(0),
                    row.get::<_, String>(1),
                    row.get::<_, bool>(2),
                )
            })
            .collect();
        debug!("Loaded {} columns for {}.{}", columns.len(), self.schema, table);
        Ok(columns)
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let client = self.client("counting rows").await?;
        let sql = format!("SELECT COUNT(*)::int8 FROM {}", self.qualify(table)?);
        let row = client.query_one(sql.as_str(), &[]).await?;
        Ok(row.get::<_, i64>(0))
    }

    async fn read_batch(&self, opts: &ReadOptions) -> Result<Vec<Row>> {
        let types = self.column_types(&opts.table).await?;
        let sql = select_page_sql(&self.qualify(&opts.table)?, opts, &types)?;
        let declared: Vec<Option<&str>> = opts
            .columns
            .iter()
            .map(|c| types.get(c).map(String::as_str))
            .collect();

        let client = self.client("reading rows").await?;
        let rows = client.query(sql.as_str(), &[]).await?;
        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|idx| convert_pg_row_value(row, idx, declared.get(idx).copied().flatten()))
                    .collect::<Result<Row>>()
            })
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        self.test_connection().await
    }

    fn db_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close();
    }
}

impl SourceReader for PostgresDatabase {}

/// Decode one column of a result row by its PostgreSQL type name.
///
/// `declared` is the column's udt name in the table. A `numeric` column
/// arrives as text and becomes a `Decimal` when it fits, text otherwise
/// (`NaN`, more than 28 significant digits).
fn convert_pg_row_value(
    row: &tokio_postgres::Row,
    idx: usize,
    declared: Option<&str>,
) -> Result<SqlValue> {
    let type_name = row.columns()[idx].type_().name().to_string();
    let column = row.columns()[idx].name().to_string();
    let err = |e: tokio_postgres::Error| {
        MigrateError::Driver(format!("decoding column {} ({}): {}", column, type_name, e))
    };

    if declared == Some("numeric") && type_name == "text" {
        return Ok(match row.try_get::<_, Option<String>>(idx).map_err(err)? {
            Some(text) => text
                .parse::<Decimal>()
                .map(SqlValue::Decimal)
                .unwrap_or(SqlValue::Text(text)),
            None => SqlValue::Null(SqlNullType::Decimal),
        });
    }

    let value = match type_name.as_str() {
        "bool" => row
            .try_get::<_, Option<bool>>(idx)
            .map_err(err)?
            .map(SqlValue::Bool)
            .unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)
            .map_err(err)?
            .map(SqlValue::I16)
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)
            .map_err(err)?
            .map(SqlValue::I32)
            .unwrap_or(SqlValue::Null(SqlNullType::I32)),
        "int8" => row
            .try_get::<_, Option<i64>>(idx)
            .map_err(err)?
            .map(SqlValue::I64)
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)
            .map_err(err)?
            .map(SqlValue::F32)
            .unwrap_or(SqlValue::Null(SqlNullType::F32)),
        "float8" => row
            .try_get::<_, Option<f64>>(idx)
            .map_err(err)?
            .map(SqlValue::F64)
            .unwrap_or(SqlValue::Null(SqlNullType::F64)),
        "uuid" => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .map_err(err)?
            .map(SqlValue::Uuid)
            .unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map_err(err)?
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::FixedOffset>>>(idx)
            .map_err(err)?
            .map(SqlValue::DateTimeOffset)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .map_err(err)?
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        "time" => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)
            .map_err(err)?
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .map_err(err)?
            .map(SqlValue::Bytes)
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        "numeric" => row
            .try_get::<_, Option<Decimal>>(idx)
            .map_err(err)?
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        "json" | "jsonb" => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .map_err(err)?
            .map(|v| SqlValue::Text(v.to_string()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .map_err(err)?
            .map(SqlValue::Text)
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
    };
    Ok(value)
}
