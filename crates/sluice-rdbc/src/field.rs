//! Field descriptors, scanners and valuers
//!
//! A [`Field`] describes one table column for a dialect: its position, name,
//! quoting and bind placeholder syntax, plus the [`Scanner`] that decodes a
//! driver value into a portable [`Column`] and the [`Valuer`] that narrows a
//! column back into the exact [`DriverValue`] the backend binds.
//!
//! Dialects map their native type names onto a [`DriverKind`], which carries
//! the strict decode/encode rules shared by every backend, and onto a
//! [`SemanticKind`], the canonical category used for validation and split
//! planning.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use num_traits::ToPrimitive;
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::driver::{ColumnTypeInfo, DriverValue};
use crate::element::{Column, ColumnKind, DEFAULT_TIME_LAYOUT};
use crate::error::{Error, Result};

/// Canonical value category of a native column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemanticKind {
    /// Boolean
    Bool,
    /// Integer (fits the arbitrary precision integer domain)
    Int64,
    /// Floating point or fixed-point number
    Float64,
    /// Character data
    String,
    /// Binary data
    Bytes,
    /// Date, time or timestamp
    Time,
    /// Not supported by this dialect
    Unsupported,
}

impl SemanticKind {
    /// Whether columns of this kind can be read and written
    #[inline]
    pub const fn is_supported(self) -> bool {
        !matches!(self, Self::Unsupported)
    }
}

impl fmt::Display for SemanticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int64 => write!(f, "int64"),
            Self::Float64 => write!(f, "float64"),
            Self::String => write!(f, "string"),
            Self::Bytes => write!(f, "bytes"),
            Self::Time => write!(f, "time"),
            Self::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// The exact driver representation of a native column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// BOOLEAN
    Bool,
    /// SMALLINT
    Int16,
    /// INTEGER
    Int32,
    /// BIGINT
    Int64,
    /// REAL
    Float32,
    /// DOUBLE PRECISION
    Float64,
    /// NUMERIC / DECIMAL
    Decimal,
    /// CHAR / VARCHAR / TEXT
    Text,
    /// BYTEA / BLOB
    Bytes,
    /// DATE
    Date,
    /// TIME
    Time,
    /// TIMESTAMP
    Timestamp,
    /// TIMESTAMP WITH TIME ZONE
    TimestampTz,
}

impl DriverKind {
    /// Portable column kind produced when scanning
    pub const fn column_kind(self) -> ColumnKind {
        match self {
            Self::Bool => ColumnKind::Bool,
            Self::Int16 | Self::Int32 | Self::Int64 => ColumnKind::BigInt,
            Self::Float32 | Self::Float64 | Self::Decimal => ColumnKind::Decimal,
            Self::Text => ColumnKind::String,
            Self::Bytes => ColumnKind::Bytes,
            Self::Date | Self::Time | Self::Timestamp | Self::TimestampTz => ColumnKind::Time,
        }
    }

    /// Canonical semantic kind
    pub const fn semantic_kind(self) -> SemanticKind {
        match self {
            Self::Bool => SemanticKind::Bool,
            Self::Int16 | Self::Int32 | Self::Int64 => SemanticKind::Int64,
            Self::Float32 | Self::Float64 | Self::Decimal => SemanticKind::Float64,
            Self::Text => SemanticKind::String,
            Self::Bytes => SemanticKind::Bytes,
            Self::Date | Self::Time | Self::Timestamp | Self::TimestampTz => SemanticKind::Time,
        }
    }

    /// Layout attached to time columns scanned from this kind
    pub const fn default_layout(self) -> &'static str {
        match self {
            Self::Date => "%Y-%m-%d",
            Self::Time => "%H:%M:%S%.f",
            _ => DEFAULT_TIME_LAYOUT,
        }
    }

    /// Decode a driver value into a column.
    ///
    /// `Null` yields the nil variant of [`Self::column_kind`]; any driver
    /// value that does not belong to this kind is an error.
    pub fn decode(self, name: &str, raw: DriverValue) -> Result<Column> {
        let mismatch = |raw: &DriverValue| {
            Error::type_conversion(format!(
                "column {}: unexpected driver value {} for {:?}",
                name,
                raw.type_name(),
                self
            ))
        };

        let column = match (self, raw) {
            (_, DriverValue::Null) => Column::null(name, self.column_kind()),
            (Self::Bool, DriverValue::Bool(b)) => Column::bool(name, b),
            (Self::Int16 | Self::Int32 | Self::Int64, DriverValue::Int16(n)) => {
                Column::bigint(name, n)
            }
            (Self::Int16 | Self::Int32 | Self::Int64, DriverValue::Int32(n)) => {
                Column::bigint(name, n)
            }
            (Self::Int16 | Self::Int32 | Self::Int64, DriverValue::Int64(n)) => {
                Column::bigint(name, n)
            }
            (Self::Float32 | Self::Float64 | Self::Decimal, DriverValue::Float32(f)) => {
                Column::decimal(name, float_to_decimal(name, f)?)
            }
            (Self::Float32 | Self::Float64 | Self::Decimal, DriverValue::Float64(f)) => {
                Column::decimal(name, float_to_decimal(name, f)?)
            }
            (Self::Float32 | Self::Float64 | Self::Decimal, DriverValue::Decimal(d)) => {
                Column::decimal(name, d)
            }
            (Self::Text, DriverValue::Text(s)) => Column::string(name, s),
            (Self::Bytes, DriverValue::Bytes(b)) => Column::bytes(name, b),
            (Self::Date, DriverValue::Date(d)) => {
                Column::time(name, d.and_time(NaiveTime::MIN), self.default_layout())
            }
            (Self::Time, DriverValue::Time(t)) => {
                Column::time(name, NaiveDate::default().and_time(t), self.default_layout())
            }
            (Self::Timestamp | Self::TimestampTz, DriverValue::Timestamp(t)) => {
                Column::time(name, t, self.default_layout())
            }
            (Self::Timestamp | Self::TimestampTz, DriverValue::TimestampTz(t)) => {
                Column::time(name, t.naive_utc(), self.default_layout())
            }
            (_, other) => return Err(mismatch(&other)),
        };
        Ok(column)
    }

    /// Narrow a column into the driver value for this kind.
    ///
    /// Values that do not fit (integer overflow, non-finite floats) are
    /// errors rather than truncations.
    pub fn encode(self, column: &Column) -> Result<DriverValue> {
        if column.is_null() {
            return Ok(DriverValue::Null);
        }
        let overflow = |target: &str| {
            Error::type_conversion(format!(
                "column {}: value {} overflows {}",
                column.name(),
                column,
                target
            ))
        };
        // non-null checked above, so every as_* below returns Some
        let missing = || Error::type_conversion(format!("column {} is nil", column.name()));

        let value = match self {
            Self::Bool => DriverValue::Bool(column.as_bool()?.ok_or_else(missing)?),
            Self::Int16 => {
                let n = column.as_bigint()?.ok_or_else(missing)?;
                DriverValue::Int16(n.to_i16().ok_or_else(|| overflow("int16"))?)
            }
            Self::Int32 => {
                let n = column.as_bigint()?.ok_or_else(missing)?;
                DriverValue::Int32(n.to_i32().ok_or_else(|| overflow("int32"))?)
            }
            Self::Int64 => {
                let n = column.as_bigint()?.ok_or_else(missing)?;
                DriverValue::Int64(n.to_i64().ok_or_else(|| overflow("int64"))?)
            }
            Self::Float32 => {
                let d = column.as_decimal()?.ok_or_else(missing)?;
                let f = d
                    .to_string()
                    .parse::<f32>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .ok_or_else(|| overflow("float32"))?;
                DriverValue::Float32(f)
            }
            Self::Float64 => {
                let d = column.as_decimal()?.ok_or_else(missing)?;
                let f = d
                    .to_string()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .ok_or_else(|| overflow("float64"))?;
                DriverValue::Float64(f)
            }
            Self::Decimal => DriverValue::Decimal(column.as_decimal()?.ok_or_else(missing)?),
            Self::Text => DriverValue::Text(column.as_string()?.ok_or_else(missing)?),
            Self::Bytes => DriverValue::Bytes(column.as_bytes()?.ok_or_else(missing)?),
            Self::Date => DriverValue::Date(column.as_time()?.ok_or_else(missing)?.date()),
            Self::Time => DriverValue::Time(column.as_time()?.ok_or_else(missing)?.time()),
            Self::Timestamp => DriverValue::Timestamp(column.as_time()?.ok_or_else(missing)?),
            Self::TimestampTz => {
                let t: NaiveDateTime = column.as_time()?.ok_or_else(missing)?;
                DriverValue::TimestampTz(DateTime::<Utc>::from_naive_utc_and_offset(t, Utc))
            }
        };
        Ok(value)
    }
}

/// Floats travel as decimals built from their shortest round-trip text.
///
/// `Decimal` rounds past 28 fractional digits, so the result must parse
/// back to the same float or the value is rejected.
fn float_to_decimal<F>(name: &str, f: F) -> Result<Decimal>
where
    F: FromStr + PartialEq + fmt::Display + Copy,
{
    let text = f.to_string();
    match Decimal::from_str(&text) {
        Ok(d) if d.to_string().parse::<F>().ok() == Some(f) => Ok(d),
        _ => Err(Error::type_conversion(format!(
            "column {name}: float {text} is not exactly representable as a decimal"
        ))),
    }
}

/// Dialect type information for a field
pub trait FieldType: Send + Sync + fmt::Debug {
    /// Database type name as reported by the driver (upper case)
    fn database_type_name(&self) -> &str;

    /// Canonical semantic kind; a pure function of the type name
    fn kind(&self) -> SemanticKind;

    /// Whether the column is nullable, when known
    fn nullable(&self) -> Option<bool> {
        None
    }

    /// Whether the dialect supports this type
    fn is_supported(&self) -> bool {
        self.kind().is_supported()
    }
}

/// Decodes driver values into portable columns
pub trait Scanner: Send + Sync {
    /// Decode one driver value; `Null` becomes the nil column variant
    fn scan(&self, raw: DriverValue) -> Result<Column>;
}

/// Encodes portable columns into driver values
pub trait Valuer: Send + Sync {
    /// Narrow a column into exactly what the driver binds
    fn value(&self, column: &Column) -> Result<DriverValue>;
}

/// A table column as seen by a dialect
pub trait Field: Send + Sync + fmt::Debug {
    /// Zero-based position within the table
    fn index(&self) -> usize;

    /// Unquoted column name
    fn name(&self) -> &str;

    /// Column name quoted for SQL text
    fn quoted(&self) -> String;

    /// Bind placeholder for the `i`-th (1-based) argument of a statement
    fn bind_var(&self, i: usize) -> String;

    /// Select-list expression for this column
    fn select(&self) -> String {
        self.quoted()
    }

    /// Dialect type information
    fn field_type(&self) -> &dyn FieldType;

    /// Scanner for values of this column
    fn scanner(&self) -> &dyn Scanner;

    /// Valuer for values of this column
    fn valuer(&self) -> &dyn Valuer;
}

/// Dialect-neutral part of a field: index, name and driver metadata
#[derive(Debug, Clone)]
pub struct BaseField {
    index: usize,
    name: String,
    type_info: Arc<ColumnTypeInfo>,
}

impl BaseField {
    /// Create a base field
    pub fn new(index: usize, name: impl Into<String>, type_info: ColumnTypeInfo) -> Self {
        Self {
            index,
            name: name.into(),
            type_info: Arc::new(type_info),
        }
    }

    /// Zero-based position
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Unquoted name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Driver metadata for this column
    #[inline]
    pub fn type_info(&self) -> &ColumnTypeInfo {
        &self.type_info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_null_is_nil_variant() {
        for kind in [DriverKind::Int32, DriverKind::Text, DriverKind::TimestampTz] {
            let c = kind.decode("c", DriverValue::Null).unwrap();
            assert!(c.is_null());
            assert_eq!(c.kind(), kind.column_kind());
            assert_eq!(kind.encode(&c).unwrap(), DriverValue::Null);
        }
    }

    #[test]
    fn test_decode_rejects_foreign_values() {
        assert!(DriverKind::Int64
            .decode("c", DriverValue::Text("12".into()))
            .is_err());
        assert!(DriverKind::Text
            .decode("c", DriverValue::Bytes(b"ab".to_vec()))
            .is_err());
        assert!(DriverKind::Bool.decode("c", DriverValue::Int64(1)).is_err());
    }

    #[test]
    fn test_encode_overflow_is_error() {
        let c = Column::bigint("c", 70_000);
        assert!(DriverKind::Int16.encode(&c).is_err());
        assert_eq!(DriverKind::Int32.encode(&c).unwrap(), DriverValue::Int32(70_000));
    }

    #[test]
    fn test_float_round_trip() {
        for f in [0.1_f64, -2.5e-7, 12345.678, 1.0e20] {
            let c = DriverKind::Float64.decode("c", DriverValue::Float64(f)).unwrap();
            assert_eq!(DriverKind::Float64.encode(&c).unwrap(), DriverValue::Float64(f));
        }
        let c = DriverKind::Float32
            .decode("c", DriverValue::Float32(3.3))
            .unwrap();
        assert_eq!(DriverKind::Float32.encode(&c).unwrap(), DriverValue::Float32(3.3));
    }

    #[test]
    fn test_float_beyond_decimal_precision_is_rejected() {
        for f in [1e-30_f64, 1.5e-29, 3e-40, 1e300, f64::NAN, f64::INFINITY] {
            let err = DriverKind::Float64
                .decode("c", DriverValue::Float64(f))
                .unwrap_err();
            assert!(matches!(err, Error::TypeConversion { .. }), "{f}");
        }
        assert!(DriverKind::Float32
            .decode("c", DriverValue::Float32(1e-35))
            .is_err());
    }

    #[test]
    fn test_semantic_kinds() {
        assert_eq!(DriverKind::Int16.semantic_kind(), SemanticKind::Int64);
        assert_eq!(DriverKind::Decimal.semantic_kind(), SemanticKind::Float64);
        assert_eq!(DriverKind::Date.semantic_kind(), SemanticKind::Time);
        assert!(!SemanticKind::Unsupported.is_supported());
    }
}
