//! Column transforms applied between reading a source row and inserting it.
//!
//! The set is closed: an unknown transform name fails configuration parsing.
//! NULL passes through every transform except `not_null`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::format::{Item, StrftimeItems};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core::value::{SqlNullType, SqlValue};

use super::spec::{ColumnMapping, Literal};

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";
const DEFAULT_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// A single value transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Trim,
    Lowercase,
    Uppercase,
    /// Empty or blank text becomes NULL.
    NullIfEmpty,
    /// Fail the row if the value is NULL.
    NotNull,
    ToInteger,
    ToFloat,
    ToDecimal,
    ToText,
    ToBoolean,
    /// Parse text with the mapping's `format` (default `%Y-%m-%d`).
    ParseDate,
    /// Parse text with the mapping's `format` (default ISO 8601 without offset).
    ParseTimestamp,
    /// Look the value up in the mapping's `values` table.
    Map,
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transform::Trim => "trim",
            Transform::Lowercase => "lowercase",
            Transform::Uppercase => "uppercase",
            Transform::NullIfEmpty => "null_if_empty",
            Transform::NotNull => "not_null",
            Transform::ToInteger => "to_integer",
            Transform::ToFloat => "to_float",
            Transform::ToDecimal => "to_decimal",
            Transform::ToText => "to_text",
            Transform::ToBoolean => "to_boolean",
            Transform::ParseDate => "parse_date",
            Transform::ParseTimestamp => "parse_timestamp",
            Transform::Map => "map",
        };
        write!(f, "{}", name)
    }
}

impl Transform {
    /// Apply the transform. The error is the failure reason.
    pub fn apply(&self, value: SqlValue, mapping: &ColumnMapping) -> Result<SqlValue, String> {
        if value.is_null() {
            return match self {
                Transform::NotNull => Err("value is NULL".to_string()),
                _ => Ok(value),
            };
        }

        match self {
            Transform::Trim => Ok(map_text(value, |s| s.trim().to_string())),
            Transform::Lowercase => Ok(map_text(value, |s| s.to_lowercase())),
            Transform::Uppercase => Ok(map_text(value, |s| s.to_uppercase())),
            Transform::NullIfEmpty => match &value {
                SqlValue::Text(s) if s.trim().is_empty() => Ok(SqlValue::Null(SqlNullType::String)),
                _ => Ok(value),
            },
            Transform::NotNull => Ok(value),
            Transform::ToInteger => to_integer(value),
            Transform::ToFloat => to_float(value),
            Transform::ToDecimal => to_decimal(value),
            Transform::ToText => match value {
                SqlValue::Text(_) => Ok(value),
                other => Ok(SqlValue::Text(other.to_string())),
            },
            Transform::ToBoolean => to_boolean(value),
            Transform::ParseDate => parse_date(value, mapping.format.as_deref()),
            Transform::ParseTimestamp => parse_timestamp(value, mapping.format.as_deref()),
            Transform::Map => map_value(value, &mapping.values),
        }
    }
}

/// Whether `format` is a non-empty chrono format string without errors.
pub fn is_usable_format(format: &str) -> bool {
    !format.trim().is_empty() && !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}

fn map_text(value: SqlValue, f: impl FnOnce(&str) -> String) -> SqlValue {
    match value {
        SqlValue::Text(s) => SqlValue::Text(f(&s)),
        other => other,
    }
}

fn unsupported(value: &SqlValue, target: &str) -> String {
    format!("cannot convert {} value to {}", value.type_name(), target)
}

fn to_integer(value: SqlValue) -> Result<SqlValue, String> {
    match value {
        SqlValue::I16(_) | SqlValue::I32(_) | SqlValue::I64(_) => {
            Ok(SqlValue::I64(value.as_i64().unwrap_or_default()))
        }
        SqlValue::Bool(v) => Ok(SqlValue::I64(i64::from(v))),
        SqlValue::F32(v) => float_to_integer(f64::from(v)),
        SqlValue::F64(v) => float_to_integer(v),
        SqlValue::Decimal(d) => {
            if !d.fract().is_zero() {
                return Err(format!("decimal {} has a fractional part", d));
            }
            d.to_i64()
                .map(SqlValue::I64)
                .ok_or_else(|| format!("decimal {} is out of integer range", d))
        }
        SqlValue::Text(s) => s
            .trim()
            .parse::<i64>()
            .map(SqlValue::I64)
            .map_err(|_| format!("cannot parse {:?} as integer", s)),
        other => Err(unsupported(&other, "integer")),
    }
}

fn float_to_integer(v: f64) -> Result<SqlValue, String> {
    // i64::MAX as f64 rounds up to 2^63, which is already out of range.
    if v.is_finite() && v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 {
        Ok(SqlValue::I64(v as i64))
    } else {
        Err(format!("float {} is not an integer", v))
    }
}

fn to_float(value: SqlValue) -> Result<SqlValue, String> {
    match value {
        SqlValue::I16(_) | SqlValue::I32(_) | SqlValue::I64(_) => {
            Ok(SqlValue::F64(value.as_i64().unwrap_or_default() as f64))
        }
        SqlValue::F32(v) => Ok(SqlValue::F64(f64::from(v))),
        SqlValue::F64(_) => Ok(value),
        SqlValue::Decimal(d) => d
            .to_f64()
            .map(SqlValue::F64)
            .ok_or_else(|| format!("decimal {} cannot be represented as float", d)),
        SqlValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map(SqlValue::F64)
            .map_err(|_| format!("cannot parse {:?} as float", s)),
        other => Err(unsupported(&other, "float")),
    }
}

fn to_decimal(value: SqlValue) -> Result<SqlValue, String> {
    match value {
        SqlValue::I16(_) | SqlValue::I32(_) | SqlValue::I64(_) => {
            Ok(SqlValue::Decimal(Decimal::from(value.as_i64().unwrap_or_default())))
        }
        SqlValue::F32(v) => Decimal::from_f32(v)
            .map(SqlValue::Decimal)
            .ok_or_else(|| format!("float {} cannot be represented as decimal", v)),
        SqlValue::F64(v) => Decimal::from_f64(v)
            .map(SqlValue::Decimal)
            .ok_or_else(|| format!("float {} cannot be represented as decimal", v)),
        SqlValue::Decimal(_) => Ok(value),
        SqlValue::Text(s) => Decimal::from_str(s.trim())
            .map(SqlValue::Decimal)
            .map_err(|_| format!("cannot parse {:?} as decimal", s)),
        other => Err(unsupported(&other, "decimal")),
    }
}

fn to_boolean(value: SqlValue) -> Result<SqlValue, String> {
    match value {
        SqlValue::Bool(_) => Ok(value),
        SqlValue::I16(_) | SqlValue::I32(_) | SqlValue::I64(_) => match value.as_i64() {
            Some(0) => Ok(SqlValue::Bool(false)),
            Some(1) => Ok(SqlValue::Bool(true)),
            _ => Err(format!("integer {} is not a boolean", value)),
        },
        SqlValue::Text(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" | "on" => Ok(SqlValue::Bool(true)),
            "false" | "f" | "no" | "n" | "0" | "off" => Ok(SqlValue::Bool(false)),
            _ => Err(format!("cannot parse {:?} as boolean", s)),
        },
        other => Err(unsupported(&other, "boolean")),
    }
}

fn parse_date(value: SqlValue, format: Option<&str>) -> Result<SqlValue, String> {
    match value {
        SqlValue::Date(_) => Ok(value),
        SqlValue::DateTime(v) => Ok(SqlValue::Date(v.date())),
        SqlValue::DateTimeOffset(v) => Ok(SqlValue::Date(v.date_naive())),
        SqlValue::Text(s) => {
            let format = format.unwrap_or(DEFAULT_DATE_FORMAT);
            NaiveDate::parse_from_str(s.trim(), format)
                .map(SqlValue::Date)
                .map_err(|e| format!("cannot parse {:?} as date with format {:?}: {}", s, format, e))
        }
        other => Err(unsupported(&other, "date")),
    }
}

fn parse_timestamp(value: SqlValue, format: Option<&str>) -> Result<SqlValue, String> {
    match value {
        SqlValue::DateTime(_) | SqlValue::DateTimeOffset(_) => Ok(value),
        SqlValue::Date(d) => Ok(SqlValue::DateTime(d.and_time(NaiveTime::MIN))),
        SqlValue::Text(s) => {
            let text = s.trim();
            match format {
                Some(format) => NaiveDateTime::parse_from_str(text, format)
                    .map(SqlValue::DateTime)
                    .map_err(|e| {
                        format!("cannot parse {:?} as timestamp with format {:?}: {}", s, format, e)
                    }),
                None => DEFAULT_TIMESTAMP_FORMATS
                    .iter()
                    .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
                    .map(SqlValue::DateTime)
                    .ok_or_else(|| format!("cannot parse {:?} as timestamp", s)),
            }
        }
        other => Err(unsupported(&other, "timestamp")),
    }
}

fn map_value(value: SqlValue, values: &BTreeMap<String, Literal>) -> Result<SqlValue, String> {
    let key = match &value {
        SqlValue::Text(s) => s.clone(),
        other => other.to_string(),
    };
    values
        .get(&key)
        .map(Literal::to_value)
        .ok_or_else(|| format!("no mapping for value {:?}", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> ColumnMapping {
        ColumnMapping::new("a", "b")
    }

    #[test]
    fn test_text_transforms() {
        let m = plain();
        assert_eq!(
            Transform::Trim.apply(SqlValue::from("  Grand  "), &m).unwrap(),
            SqlValue::from("Grand")
        );
        assert_eq!(
            Transform::Uppercase.apply(SqlValue::from("dbl"), &m).unwrap(),
            SqlValue::from("DBL")
        );
        assert!(Transform::NullIfEmpty.apply(SqlValue::from("   "), &m).unwrap().is_null());
        assert_eq!(Transform::Trim.apply(SqlValue::I32(4), &m).unwrap(), SqlValue::I32(4));
    }

    #[test]
    fn test_null_passes_except_not_null() {
        let m = plain();
        for t in [Transform::Trim, Transform::ToInteger, Transform::ParseDate, Transform::Map] {
            assert!(t.apply(SqlValue::NULL, &m).unwrap().is_null());
        }
        assert_eq!(Transform::NotNull.apply(SqlValue::NULL, &m).unwrap_err(), "value is NULL");
    }

    #[test]
    fn test_to_integer() {
        let m = plain();
        assert_eq!(Transform::ToInteger.apply(SqlValue::from(" 42 "), &m).unwrap(), SqlValue::I64(42));
        assert_eq!(Transform::ToInteger.apply(SqlValue::F64(3.0), &m).unwrap(), SqlValue::I64(3));
        assert!(Transform::ToInteger.apply(SqlValue::F64(3.5), &m).is_err());
        assert!(Transform::ToInteger.apply(SqlValue::from("4a"), &m).is_err());
    }

    #[test]
    fn test_to_integer_float_range() {
        let m = plain();
        let two_pow_63 = 9_223_372_036_854_775_808.0_f64;
        assert!(Transform::ToInteger.apply(SqlValue::F64(two_pow_63), &m).is_err());
        assert_eq!(
            Transform::ToInteger.apply(SqlValue::F64(-two_pow_63), &m).unwrap(),
            SqlValue::I64(i64::MIN)
        );
        assert_eq!(
            Transform::ToInteger.apply(SqlValue::F64(9_007_199_254_740_992.0), &m).unwrap(),
            SqlValue::I64(9_007_199_254_740_992)
        );
        assert!(Transform::ToInteger.apply(SqlValue::F64(f64::NAN), &m).is_err());
    }

    #[test]
    fn test_to_decimal_and_float() {
        let m = plain();
        assert_eq!(
            Transform::ToDecimal.apply(SqlValue::from("129.90"), &m).unwrap(),
            SqlValue::Decimal(Decimal::from_str("129.90").unwrap())
        );
        assert_eq!(Transform::ToFloat.apply(SqlValue::I32(2), &m).unwrap(), SqlValue::F64(2.0));
    }

    #[test]
    fn test_to_boolean() {
        let m = plain();
        assert_eq!(Transform::ToBoolean.apply(SqlValue::from("Y"), &m).unwrap(), SqlValue::Bool(true));
        assert_eq!(Transform::ToBoolean.apply(SqlValue::I16(0), &m).unwrap(), SqlValue::Bool(false));
        assert!(Transform::ToBoolean.apply(SqlValue::I16(2), &m).is_err());
        assert!(Transform::ToBoolean.apply(SqlValue::from("maybe"), &m).is_err());
    }

    #[test]
    fn test_parse_date_with_format() {
        let m = plain().with_format("%d/%m/%Y");
        assert_eq!(
            Transform::ParseDate.apply(SqlValue::from("24/12/2025"), &m).unwrap(),
            SqlValue::Date(NaiveDate::from_ymd_opt(2025, 12, 24).unwrap())
        );
        let err = Transform::ParseDate.apply(SqlValue::from("2025-12-24"), &m).unwrap_err();
        assert!(err.contains("2025-12-24"));
    }

    #[test]
    fn test_parse_timestamp_defaults() {
        let m = plain();
        let expected = NaiveDate::from_ymd_opt(2025, 1, 2)
            .unwrap()
            .and_hms_opt(14, 30, 0)
            .unwrap();
        assert_eq!(
            Transform::ParseTimestamp.apply(SqlValue::from("2025-01-02 14:30:00"), &m).unwrap(),
            SqlValue::DateTime(expected)
        );
        assert_eq!(
            Transform::ParseTimestamp.apply(SqlValue::from("2025-01-02T14:30:00"), &m).unwrap(),
            SqlValue::DateTime(expected)
        );
    }

    #[test]
    fn test_map_lookup() {
        let m = plain()
            .with_value("C", Literal::Text("confirmed".into()))
            .with_value("1", Literal::Bool(true));
        assert_eq!(Transform::Map.apply(SqlValue::from("C"), &m).unwrap(), SqlValue::from("confirmed"));
        assert_eq!(Transform::Map.apply(SqlValue::I32(1), &m).unwrap(), SqlValue::Bool(true));
        assert!(Transform::Map.apply(SqlValue::from("X"), &m).is_err());
    }

    #[test]
    fn test_chained_transforms() {
        let m = plain()
            .with_transform(Transform::Trim)
            .with_transform(Transform::NullIfEmpty)
            .with_transform(Transform::ToInteger);
        assert_eq!(m.apply(SqlValue::from(" 7 ")).unwrap(), SqlValue::I64(7));
        assert!(m.apply(SqlValue::from("  ")).unwrap().is_null());
    }

    #[test]
    fn test_format_usability() {
        assert!(is_usable_format("%Y-%m-%d"));
        assert!(!is_usable_format(""));
        assert!(!is_usable_format("%Q"));
    }

    #[test]
    fn test_transform_names_round_trip_through_yaml() {
        let parsed: Vec<Transform> =
            serde_yaml::from_str("[trim, null_if_empty, parse_timestamp, map]").unwrap();
        assert_eq!(parsed[1], Transform::NullIfEmpty);
        assert_eq!(parsed[2].to_string(), "parse_timestamp");
    }
}
