//! Typed table specifications, loaded from the `plan.tables` configuration section.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::traits::ColumnInfo;
use crate::core::value::SqlValue;
use crate::error::PlanError;

use super::transform::{is_usable_format, Transform};

/// A scalar literal written to a destination column that has no source mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Literal {
    /// Convert to the value inserted into the destination.
    pub fn to_value(&self) -> SqlValue {
        match self {
            Literal::Bool(v) => SqlValue::Bool(*v),
            Literal::Int(v) => SqlValue::I64(*v),
            Literal::Float(v) => SqlValue::F64(*v),
            Literal::Text(v) => SqlValue::Text(v.clone()),
        }
    }
}

/// Maps one source column to one destination column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Source column name.
    pub source: String,

    /// Destination column name.
    pub destination: String,

    /// Transforms applied in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<Transform>,

    /// chrono format string for `parse_date` / `parse_timestamp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Lookup table for the `map` transform, keyed by the value's text form.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, Literal>,
}

impl ColumnMapping {
    /// A mapping that copies the value unchanged.
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            transforms: Vec::new(),
            format: None,
            values: BTreeMap::new(),
        }
    }

    /// Append a transform.
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Set the parse format.
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Add an entry to the `map` lookup table.
    pub fn with_value(mut self, from: impl Into<String>, to: Literal) -> Self {
        self.values.insert(from.into(), to);
        self
    }

    /// Run every transform over `value`. The error is the failure reason.
    pub fn apply(&self, value: SqlValue) -> std::result::Result<SqlValue, String> {
        self.transforms
            .iter()
            .try_fold(value, |v, t| t.apply(v, self))
    }

    fn validate(&self, table: &str) -> std::result::Result<(), PlanError> {
        let invalid = |message: String| PlanError::InvalidSpec {
            table: table.to_string(),
            message,
        };

        if self.source.is_empty() || self.destination.is_empty() {
            return Err(invalid("column mapping with an empty column name".into()));
        }
        if self.transforms.contains(&Transform::Map) && self.values.is_empty() {
            return Err(invalid(format!(
                "column {}: map transform requires a values table",
                self.destination
            )));
        }
        if let Some(format) = &self.format {
            if !is_usable_format(format) {
                return Err(invalid(format!(
                    "column {}: invalid format {:?}",
                    self.destination, format
                )));
            }
        }
        Ok(())
    }
}

/// Everything needed to migrate one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Legacy table name.
    pub source: String,

    /// New table name. Identifies the table everywhere else.
    pub destination: String,

    /// Primary-key columns, destination side.
    #[serde(default)]
    pub primary_key: Vec<String>,

    /// Destination tables that must be migrated first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Column mappings, in insert order.
    #[serde(default)]
    pub columns: Vec<ColumnMapping>,

    /// Constant values for destination columns with no source.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<String, Literal>,
}

impl TableSpec {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        primary_key: Vec<&str>,
        columns: Vec<ColumnMapping>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            primary_key: primary_key.into_iter().map(str::to_string).collect(),
            depends_on: Vec::new(),
            columns,
            defaults: BTreeMap::new(),
        }
    }

    pub fn depends_on(mut self, tables: Vec<&str>) -> Self {
        self.depends_on = tables.into_iter().map(str::to_string).collect();
        self
    }

    pub fn with_default(mut self, column: impl Into<String>, value: Literal) -> Self {
        self.defaults.insert(column.into(), value);
        self
    }

    /// Destination table name.
    pub fn name(&self) -> &str {
        &self.destination
    }

    /// Source columns to read, in mapping order.
    pub fn source_columns(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.source.clone()).collect()
    }

    /// Destination columns written: mapped columns, then defaulted columns.
    pub fn destination_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| c.destination.clone())
            .chain(self.defaults.keys().cloned())
            .collect()
    }

    /// Source columns feeding the destination primary key.
    pub fn source_primary_key(&self) -> Vec<String> {
        self.primary_key
            .iter()
            .filter_map(|pk| {
                self.columns
                    .iter()
                    .find(|c| &c.destination == pk)
                    .map(|c| c.source.clone())
            })
            .collect()
    }

    /// Positions of the primary-key columns within [`Self::source_columns`].
    pub fn primary_key_positions(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|pk| self.columns.iter().position(|c| &c.destination == pk))
            .collect()
    }

    /// Structural checks that need no database.
    pub(crate) fn validate(&self) -> std::result::Result<(), PlanError> {
        let table = self.destination.as_str();
        let invalid = |message: String| PlanError::InvalidSpec {
            table: table.to_string(),
            message,
        };

        if self.source.is_empty() || self.destination.is_empty() {
            return Err(invalid("source and destination table names are required".into()));
        }
        if self.columns.is_empty() {
            return Err(invalid("no column mappings".into()));
        }
        if self.primary_key.is_empty() {
            return Err(invalid("primary_key is required".into()));
        }

        let mut seen = HashSet::new();
        for column in self.destination_columns() {
            if !seen.insert(column.clone()) {
                return Err(invalid(format!(
                    "destination column {} is mapped more than once",
                    column
                )));
            }
        }

        for pk in &self.primary_key {
            if !self.columns.iter().any(|c| &c.destination == pk) {
                return Err(invalid(format!(
                    "primary key column {} is not mapped from a source column",
                    pk
                )));
            }
        }

        for mapping in &self.columns {
            mapping.validate(table)?;
        }
        Ok(())
    }

    /// Check the mapping against the live column lists of both tables.
    ///
    /// An empty list means the table does not exist.
    pub fn validate_columns(
        &self,
        source_columns: &[ColumnInfo],
        destination_columns: &[ColumnInfo],
    ) -> std::result::Result<(), PlanError> {
        if source_columns.is_empty() {
            return Err(PlanError::MissingTable {
                table: self.source.clone(),
                side: "source",
            });
        }
        if destination_columns.is_empty() {
            return Err(PlanError::MissingTable {
                table: self.destination.clone(),
                side: "destination",
            });
        }

        for column in self.source_columns() {
            if !source_columns.iter().any(|c| c.name == column) {
                return Err(PlanError::UnknownColumn {
                    table: self.source.clone(),
                    column,
                    side: "source",
                });
            }
        }
        for column in self.destination_columns() {
            if !destination_columns.iter().any(|c| c.name == column) {
                return Err(PlanError::UnknownColumn {
                    table: self.destination.clone(),
                    column,
                    side: "destination",
                });
            }
        }
        Ok(())
    }
}
