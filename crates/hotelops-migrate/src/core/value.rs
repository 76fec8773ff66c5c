//! SQL value types moved between the source and destination schemas.
//!
//! Values are owned: a table is read in pages, transformed, and written inside
//! one destination transaction, so no value outlives the page it came from by
//! borrowing. Values are serde-serializable because snapshot files store rows
//! as JSON lines.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type hint for NULL values so writers can emit a correctly typed NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlNullType {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    /// NULL with type hint.
    Null(SqlNullType),
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(#[serde(with = "float_f32")] f32),
    F64(#[serde(with = "float_f64")] f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Decimal(Decimal),
    /// Timestamp without timezone.
    DateTime(NaiveDateTime),
    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
}

// JSON has no NaN or infinity, so snapshot files spell non-finite floats as
// strings ("NaN", "Infinity", "-Infinity").
macro_rules! float_serde {
    ($module:ident, $ty:ty, $serialize:ident, $expecting:literal) => {
        mod $module {
            use serde::de::{self, Visitor};
            use serde::{Deserializer, Serializer};
            use std::fmt;

            pub fn serialize<S: Serializer>(v: &$ty, s: S) -> Result<S::Ok, S::Error> {
                if v.is_finite() {
                    s.$serialize(*v)
                } else if v.is_nan() {
                    s.serialize_str("NaN")
                } else if v.is_sign_positive() {
                    s.serialize_str("Infinity")
                } else {
                    s.serialize_str("-Infinity")
                }
            }

            struct FloatVisitor;

            impl<'de> Visitor<'de> for FloatVisitor {
                type Value = $ty;

                fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    f.write_str($expecting)
                }

                fn visit_f64<E: de::Error>(self, v: f64) -> Result<$ty, E> {
                    Ok(v as $ty)
                }

                fn visit_i64<E: de::Error>(self, v: i64) -> Result<$ty, E> {
                    Ok(v as $ty)
                }

                fn visit_u64<E: de::Error>(self, v: u64) -> Result<$ty, E> {
                    Ok(v as $ty)
                }

                fn visit_str<E: de::Error>(self, v: &str) -> Result<$ty, E> {
                    match v {
                        "NaN" => Ok(<$ty>::NAN),
                        "Infinity" => Ok(<$ty>::INFINITY),
                        "-Infinity" => Ok(<$ty>::NEG_INFINITY),
                        other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
                    }
                }
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<$ty, D::Error> {
                d.deserialize_any(FloatVisitor)
            }
        }
    };
}

float_serde!(float_f32, f32, serialize_f32, "a 32-bit float, NaN or Infinity");
float_serde!(float_f64, f64, serialize_f64, "a 64-bit float, NaN or Infinity");

/// One row, values ordered like the column list it was read or built with.
pub type Row = Vec<SqlValue>;

/// A page of rows.
pub type Batch = Vec<Row>;

impl SqlValue {
    /// Untyped NULL, used when nothing better is known.
    pub const NULL: SqlValue = SqlValue::Null(SqlNullType::String);

    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Get the SqlNullType for this value (for type-aware NULL encoding).
    #[must_use]
    pub fn null_type(&self) -> SqlNullType {
        match self {
            SqlValue::Null(t) => *t,
            SqlValue::Bool(_) => SqlNullType::Bool,
            SqlValue::I16(_) => SqlNullType::I16,
            SqlValue::I32(_) => SqlNullType::I32,
            SqlValue::I64(_) => SqlNullType::I64,
            SqlValue::F32(_) => SqlNullType::F32,
            SqlValue::F64(_) => SqlNullType::F64,
            SqlValue::Text(_) => SqlNullType::String,
            SqlValue::Bytes(_) => SqlNullType::Bytes,
            SqlValue::Uuid(_) => SqlNullType::Uuid,
            SqlValue::Decimal(_) => SqlNullType::Decimal,
            SqlValue::DateTime(_) => SqlNullType::DateTime,
            SqlValue::DateTimeOffset(_) => SqlNullType::DateTimeOffset,
            SqlValue::Date(_) => SqlNullType::Date,
            SqlValue::Time(_) => SqlNullType::Time,
        }
    }

    /// Short type name, used in transform error messages.
    pub fn type_name(&self) -> &'static str {
        match self.null_type() {
            SqlNullType::Bool => "boolean",
            SqlNullType::I16 => "smallint",
            SqlNullType::I32 => "integer",
            SqlNullType::I64 => "bigint",
            SqlNullType::F32 => "real",
            SqlNullType::F64 => "double",
            SqlNullType::String => "text",
            SqlNullType::Bytes => "bytes",
            SqlNullType::Uuid => "uuid",
            SqlNullType::Decimal => "decimal",
            SqlNullType::DateTime => "timestamp",
            SqlNullType::DateTimeOffset => "timestamptz",
            SqlNullType::Date => "date",
            SqlNullType::Time => "time",
        }
    }

    /// Integer view of the value, if it is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I16(v) => Some(i64::from(*v)),
            SqlValue::I32(v) => Some(i64::from(*v)),
            SqlValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Canonical text form used for checksums and row identifiers.
    ///
    /// The encoding is type-agnostic where the destination may widen or narrow
    /// a type (an `I64` written to an `integer` column reads back as `I32`, a
    /// float written to a `numeric` column reads back as `Decimal`), so both
    /// sides of a lossless migration produce the same text. Offset timestamps
    /// are encoded as their UTC wall-clock time. NULL is encoded as a NUL byte
    /// so it never collides with the text `"NULL"`.
    pub fn canonical(&self) -> String {
        match self {
            SqlValue::Null(_) => "\0".to_string(),
            SqlValue::Bool(v) => (if *v { "true" } else { "false" }).to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) => v.to_string(),
            SqlValue::F64(v) => v.to_string(),
            SqlValue::Text(v) => v.clone(),
            SqlValue::Bytes(v) => format!("\\x{}", hex::encode(v)),
            SqlValue::Uuid(v) => v.hyphenated().to_string(),
            SqlValue::Decimal(v) => v.normalize().to_string(),
            SqlValue::DateTime(v) => v.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            SqlValue::DateTimeOffset(v) => v
                .with_timezone(&Utc)
                .naive_utc()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
            SqlValue::Date(v) => v.format("%Y-%m-%d").to_string(),
            SqlValue::Time(v) => v.format("%H:%M:%S%.6f").to_string(),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null(_) => write!(f, "NULL"),
            other => write!(f, "{}", other.canonical()),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i16> for SqlValue {
    fn from(v: i16) -> Self {
        SqlValue::I16(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::NULL)
    }
}
