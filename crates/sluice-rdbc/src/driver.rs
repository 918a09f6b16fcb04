//! Driver-level values and column metadata
//!
//! A vendor backend exchanges rows with the core as [`DriverValue`]s and
//! describes result columns with [`ColumnTypeInfo`]. Scanners turn driver
//! values into portable columns; valuers narrow columns back into the exact
//! driver value a backend binds.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;

/// A value as produced or consumed by a database driver
#[derive(Debug, Clone, PartialEq)]
pub enum DriverValue {
    /// The driver's NULL encoding
    Null,
    /// Boolean
    Bool(bool),
    /// 16-bit integer (SMALLINT)
    Int16(i16),
    /// 32-bit integer (INTEGER)
    Int32(i32),
    /// 64-bit integer (BIGINT)
    Int64(i64),
    /// 32-bit float (REAL)
    Float32(f32),
    /// 64-bit float (DOUBLE PRECISION)
    Float64(f64),
    /// Fixed-point decimal (NUMERIC)
    Decimal(Decimal),
    /// Character data
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Calendar date
    Date(NaiveDate),
    /// Time of day
    Time(NaiveTime),
    /// Timestamp without time zone
    Timestamp(NaiveDateTime),
    /// Timestamp with time zone (normalized to UTC)
    TimestampTz(DateTime<Utc>),
}

impl DriverValue {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short name of the variant, used in decode error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int16(_) => "int16",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Float32(_) => "float32",
            Self::Float64(_) => "float64",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::Timestamp(_) => "timestamp",
            Self::TimestampTz(_) => "timestamptz",
        }
    }
}

impl From<bool> for DriverValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for DriverValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<&str> for DriverValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for DriverValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for DriverValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<DriverValue>> From<Option<T>> for DriverValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// Column metadata reported by a driver for a result set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnTypeInfo {
    /// Column name
    pub name: String,
    /// Database type name, upper case (e.g. `INT4`, `VARCHAR`)
    pub database_type_name: String,
    /// Whether the column is nullable, when the driver knows
    pub nullable: Option<bool>,
    /// Length for variable-length types
    pub length: Option<u32>,
    /// Precision for numeric types
    pub precision: Option<u32>,
    /// Scale for numeric types
    pub scale: Option<u32>,
}

impl ColumnTypeInfo {
    /// Create column metadata with only name and type name known
    pub fn new(name: impl Into<String>, database_type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database_type_name: database_type_name.into().to_uppercase(),
            nullable: None,
            length: None,
            precision: None,
            scale: None,
        }
    }

    /// Set nullability
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    /// Set length
    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    /// Set precision and scale
    pub fn with_precision_scale(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_value_null() {
        assert!(DriverValue::Null.is_null());
        assert!(!DriverValue::Int64(0).is_null());
        assert_eq!(DriverValue::from(None::<i64>), DriverValue::Null);
        assert_eq!(DriverValue::from(Some("a")), DriverValue::Text("a".into()));
    }

    #[test]
    fn test_column_type_info_uppercases() {
        let info = ColumnTypeInfo::new("id", "int4").with_nullable(false);
        assert_eq!(info.database_type_name, "INT4");
        assert_eq!(info.nullable, Some(false));
    }
}
