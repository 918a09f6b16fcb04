//! Portable column values
//!
//! The value model every dialect scans into and every writer reads from:
//! - [`ColumnValue`]: bool, arbitrary precision integer, decimal, string,
//!   bytes or time (with its layout), or the nil variant of one of these kinds
//! - [`Column`]: a named value with its payload size
//! - [`Record`]: an ordered sequence of columns, one per row or write entry
//!
//! Conversions between kinds are explicit and fallible; anything that would
//! lose information is a type conversion error.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Layout used when a time column has no explicit one
pub const DEFAULT_TIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Kind of a column value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    /// Boolean
    Bool,
    /// Arbitrary precision integer
    BigInt,
    /// Fixed-point decimal
    Decimal,
    /// Character data
    String,
    /// Binary data
    Bytes,
    /// Point in time
    Time,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::BigInt => write!(f, "bigInt"),
            Self::Decimal => write!(f, "decimal"),
            Self::String => write!(f, "string"),
            Self::Bytes => write!(f, "bytes"),
            Self::Time => write!(f, "time"),
        }
    }
}

/// A portable column value
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    /// SQL NULL of the given kind
    Null(ColumnKind),
    /// Boolean value
    Bool(bool),
    /// Arbitrary precision integer
    BigInt(BigInt),
    /// Fixed-point decimal
    Decimal(Decimal),
    /// Character data
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Point in time and the layout used to render it
    Time {
        /// Timestamp (UTC for zoned driver values)
        value: NaiveDateTime,
        /// chrono format string
        layout: String,
    },
}

impl ColumnValue {
    /// Kind of this value (nil variants report their kind)
    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::Null(kind) => *kind,
            Self::Bool(_) => ColumnKind::Bool,
            Self::BigInt(_) => ColumnKind::BigInt,
            Self::Decimal(_) => ColumnKind::Decimal,
            Self::String(_) => ColumnKind::String,
            Self::Bytes(_) => ColumnKind::Bytes,
            Self::Time { .. } => ColumnKind::Time,
        }
    }

    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    fn byte_size(&self) -> usize {
        match self {
            Self::Null(_) => 0,
            Self::Bool(_) => 1,
            Self::BigInt(n) => (n.bits() as usize).div_ceil(8).max(1),
            Self::Decimal(_) => 16,
            Self::String(s) => s.len(),
            Self::Bytes(b) => b.len(),
            Self::Time { .. } => 12,
        }
    }
}

/// A named column value
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    value: ColumnValue,
    name: String,
    byte_size: usize,
}

impl Column {
    /// Create a column from a value
    pub fn new(name: impl Into<String>, value: ColumnValue) -> Self {
        let byte_size = value.byte_size();
        Self {
            value,
            name: name.into(),
            byte_size,
        }
    }

    /// Create a nil column of the given kind
    pub fn null(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self::new(name, ColumnValue::Null(kind))
    }

    /// Create a boolean column
    pub fn bool(name: impl Into<String>, v: bool) -> Self {
        Self::new(name, ColumnValue::Bool(v))
    }

    /// Create an integer column
    pub fn bigint(name: impl Into<String>, v: impl Into<BigInt>) -> Self {
        Self::new(name, ColumnValue::BigInt(v.into()))
    }

    /// Create a decimal column
    pub fn decimal(name: impl Into<String>, v: Decimal) -> Self {
        Self::new(name, ColumnValue::Decimal(v))
    }

    /// Create a string column
    pub fn string(name: impl Into<String>, v: impl Into<String>) -> Self {
        Self::new(name, ColumnValue::String(v.into()))
    }

    /// Create a bytes column
    pub fn bytes(name: impl Into<String>, v: impl Into<Vec<u8>>) -> Self {
        Self::new(name, ColumnValue::Bytes(v.into()))
    }

    /// Create a time column rendered with `layout`
    pub fn time(name: impl Into<String>, v: NaiveDateTime, layout: impl Into<String>) -> Self {
        Self::new(
            name,
            ColumnValue::Time {
                value: v,
                layout: layout.into(),
            },
        )
    }

    /// Column name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column value
    #[inline]
    pub fn value(&self) -> &ColumnValue {
        &self.value
    }

    /// Kind of the value
    #[inline]
    pub fn kind(&self) -> ColumnKind {
        self.value.kind()
    }

    /// Payload size in bytes
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Check if the column is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    fn conversion_error(&self, target: &str) -> Error {
        Error::type_conversion(format!(
            "column {} of kind {} cannot be converted to {}",
            self.name,
            self.kind(),
            target
        ))
    }

    /// Read as bool
    pub fn as_bool(&self) -> Result<Option<bool>> {
        match &self.value {
            ColumnValue::Null(_) => Ok(None),
            ColumnValue::Bool(b) => Ok(Some(*b)),
            ColumnValue::BigInt(n) => Ok(Some(!n.is_zero())),
            ColumnValue::Decimal(d) => Ok(Some(!d.is_zero())),
            ColumnValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Some(true)),
                "false" | "f" | "0" => Ok(Some(false)),
                _ => Err(self.conversion_error("bool")),
            },
            _ => Err(self.conversion_error("bool")),
        }
    }

    /// Read as arbitrary precision integer
    pub fn as_bigint(&self) -> Result<Option<BigInt>> {
        match &self.value {
            ColumnValue::Null(_) => Ok(None),
            ColumnValue::Bool(b) => Ok(Some(BigInt::from(u8::from(*b)))),
            ColumnValue::BigInt(n) => Ok(Some(n.clone())),
            ColumnValue::Decimal(d) => {
                if !d.fract().is_zero() {
                    return Err(self.conversion_error("bigInt (fractional value)"));
                }
                BigInt::from_str(&d.trunc().to_string())
                    .map(Some)
                    .map_err(|_| self.conversion_error("bigInt"))
            }
            ColumnValue::String(s) => BigInt::from_str(s.trim())
                .map(Some)
                .map_err(|_| self.conversion_error("bigInt")),
            _ => Err(self.conversion_error("bigInt")),
        }
    }

    /// Read as i64, failing on overflow
    pub fn as_i64(&self) -> Result<Option<i64>> {
        match self.as_bigint()? {
            None => Ok(None),
            Some(n) => n
                .to_i64()
                .map(Some)
                .ok_or_else(|| self.conversion_error("int64 (overflow)")),
        }
    }

    /// Read as decimal
    pub fn as_decimal(&self) -> Result<Option<Decimal>> {
        match &self.value {
            ColumnValue::Null(_) => Ok(None),
            ColumnValue::Bool(b) => Ok(Some(Decimal::from(u8::from(*b)))),
            ColumnValue::BigInt(n) => Decimal::from_str(&n.to_string())
                .map(Some)
                .map_err(|_| self.conversion_error("decimal (overflow)")),
            ColumnValue::Decimal(d) => Ok(Some(*d)),
            ColumnValue::String(s) => Decimal::from_str(s.trim())
                .map(Some)
                .map_err(|_| self.conversion_error("decimal")),
            _ => Err(self.conversion_error("decimal")),
        }
    }

    /// Read as string
    pub fn as_string(&self) -> Result<Option<String>> {
        match &self.value {
            ColumnValue::Null(_) => Ok(None),
            ColumnValue::Bool(b) => Ok(Some(b.to_string())),
            ColumnValue::BigInt(n) => Ok(Some(n.to_string())),
            ColumnValue::Decimal(d) => Ok(Some(d.to_string())),
            ColumnValue::String(s) => Ok(Some(s.clone())),
            ColumnValue::Bytes(b) => String::from_utf8(b.clone())
                .map(Some)
                .map_err(|_| self.conversion_error("string (invalid utf-8)")),
            ColumnValue::Time { value, layout } => Ok(Some(format_time(value, layout))),
        }
    }

    /// Read as bytes
    pub fn as_bytes(&self) -> Result<Option<Vec<u8>>> {
        match &self.value {
            ColumnValue::Bytes(b) => Ok(Some(b.clone())),
            _ => Ok(self.as_string()?.map(String::into_bytes)),
        }
    }

    /// Read as time
    pub fn as_time(&self) -> Result<Option<NaiveDateTime>> {
        match &self.value {
            ColumnValue::Null(_) => Ok(None),
            ColumnValue::Time { value, .. } => Ok(Some(*value)),
            ColumnValue::String(s) => parse_time(s, DEFAULT_TIME_LAYOUT)
                .map(Some)
                .map_err(|_| self.conversion_error("time")),
            _ => Err(self.conversion_error("time")),
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            ColumnValue::Null(_) => write!(f, "<nil>"),
            ColumnValue::Bool(b) => write!(f, "{b}"),
            ColumnValue::BigInt(n) => write!(f, "{n}"),
            ColumnValue::Decimal(d) => write!(f, "{d}"),
            ColumnValue::String(s) => write!(f, "{s}"),
            ColumnValue::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            ColumnValue::Time { value, layout } => write!(f, "{}", format_time(value, layout)),
        }
    }
}

/// Render a timestamp with a chrono layout
///
/// Layouts that need an offset (`%z`) cannot render a naive timestamp; those
/// fall back to [`DEFAULT_TIME_LAYOUT`].
pub fn format_time(value: &NaiveDateTime, layout: &str) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    if write!(out, "{}", value.format(layout)).is_err() {
        out.clear();
        let _ = write!(out, "{}", value.format(DEFAULT_TIME_LAYOUT));
    }
    out
}

/// Parse text with a chrono layout; date-only layouts yield midnight
pub fn parse_time(text: &str, layout: &str) -> Result<NaiveDateTime> {
    if let Ok(t) = NaiveDateTime::parse_from_str(text, layout) {
        return Ok(t);
    }
    NaiveDate::parse_from_str(text, layout)
        .map(|d| d.and_time(NaiveTime::MIN))
        .map_err(|e| {
            Error::type_conversion(format!(
                "cannot parse {text:?} with layout {layout:?}: {e}"
            ))
        })
}

/// An ordered collection of columns representing one logical row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    columns: Vec<Column>,
}

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty record with room for `capacity` columns
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            columns: Vec::with_capacity(capacity),
        }
    }

    /// Append a column; names must be unique within a record
    pub fn add(&mut self, column: Column) -> Result<()> {
        if self.position(column.name()).is_some() {
            return Err(Error::schema(format!(
                "column {} already exists in record",
                column.name()
            )));
        }
        self.columns.push(column);
        Ok(())
    }

    /// Replace the column with the same name
    pub fn put(&mut self, column: Column) -> Result<()> {
        match self.position(column.name()) {
            Some(idx) => {
                self.columns[idx] = column;
                Ok(())
            }
            None => Err(Error::schema(format!(
                "column {} not found in record",
                column.name()
            ))),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name().eq_ignore_ascii_case(name))
    }

    /// Get column by index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Column> {
        self.columns.get(idx)
    }

    /// Get column by name (case-insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<&Column> {
        self.position(name).and_then(|idx| self.columns.get(idx))
    }

    /// Column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if record has no columns
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// All columns in order
    #[inline]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Sum of column payload sizes
    pub fn byte_size(&self) -> usize {
        self.columns.iter().map(Column::byte_size).sum()
    }
}

impl FromIterator<Column> for Record {
    fn from_iter<I: IntoIterator<Item = Column>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}
