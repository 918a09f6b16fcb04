//! Range-split partitioner
//!
//! Splits the `[min, max]` domain of a split key into at most `N` contiguous
//! ranges so independent readers can extract one table concurrently. Every
//! supported key type is embedded into arbitrary precision integers first:
//!
//! - `bigInt`: the integer itself
//! - `string`: the ASCII bytes read as a bijective base-127 numeral
//! - `time`: whole units (day .. ns) elapsed since the minimum
//!
//! The integer gap is divided evenly, the first `gap % N` ranges taking one
//! extra unit, and the bounds are rendered back into the key's domain. A
//! domain with fewer points than `N` gets one range per point. All
//! ranges use `key >= left and key < right` except the last, which closes
//! with `<=`. Nothing here touches the database.

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::element::{format_time, parse_time, Column, ColumnValue, DEFAULT_TIME_LAYOUT};
use crate::error::{Error, Result};
use crate::field::{Field, SemanticKind};

/// Value domain of a split key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SplitType {
    /// Integer keys
    BigInt,
    /// ASCII string keys
    String,
    /// Date/time keys
    Time,
}

impl SplitType {
    /// Split type for a field's semantic kind
    pub fn for_kind(kind: SemanticKind) -> Result<Self> {
        match kind {
            SemanticKind::Int64 => Ok(Self::BigInt),
            SemanticKind::String => Ok(Self::String),
            SemanticKind::Time => Ok(Self::Time),
            other => Err(Error::partition(format!("cannot split on {other} column"))),
        }
    }
}

impl fmt::Display for SplitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BigInt => write!(f, "bigInt"),
            Self::String => write!(f, "string"),
            Self::Time => write!(f, "time"),
        }
    }
}

/// Granularity of time split coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeAccuracy {
    /// Days
    #[serde(rename = "day")]
    Day,
    /// Minutes
    #[serde(rename = "min")]
    Minute,
    /// Seconds
    #[serde(rename = "s")]
    Second,
    /// Milliseconds
    #[serde(rename = "ms")]
    Millisecond,
    /// Microseconds
    #[serde(rename = "us")]
    Microsecond,
    /// Nanoseconds
    #[serde(rename = "ns")]
    Nanosecond,
}

impl TimeAccuracy {
    /// Infer the unit from how long `layout` renders.
    ///
    /// `2006-01-02` (10) is days, `2006-01-02 15:04` (16) minutes, then
    /// seconds (19), milliseconds (23), microseconds (26), nanoseconds (29).
    pub fn from_layout(layout: &str) -> Result<Self> {
        let reference = NaiveDate::from_ymd_opt(2006, 1, 2)
            .and_then(|d| d.and_hms_nano_opt(15, 4, 5, 123_456_789))
            .ok_or_else(|| Error::partition("invalid reference time"))?;
        match format_time(&reference, layout).len() {
            10 => Ok(Self::Day),
            16 => Ok(Self::Minute),
            19 => Ok(Self::Second),
            23 => Ok(Self::Millisecond),
            26 => Ok(Self::Microsecond),
            29 => Ok(Self::Nanosecond),
            n => Err(Error::partition(format!(
                "cannot infer time accuracy from layout {layout:?} ({n} chars), set timeAccuracy"
            ))),
        }
    }

    fn delta(self, base: NaiveDateTime, t: NaiveDateTime) -> Option<i64> {
        let d = t.signed_duration_since(base);
        match self {
            Self::Day => Some(d.num_days()),
            Self::Minute => Some(d.num_minutes()),
            Self::Second => Some(d.num_seconds()),
            Self::Millisecond => Some(d.num_milliseconds()),
            Self::Microsecond => d.num_microseconds(),
            Self::Nanosecond => d.num_nanoseconds(),
        }
    }

    fn span(self, n: i64) -> Option<TimeDelta> {
        match self {
            Self::Day => TimeDelta::try_days(n),
            Self::Minute => TimeDelta::try_minutes(n),
            Self::Second => TimeDelta::try_seconds(n),
            Self::Millisecond => TimeDelta::try_milliseconds(n),
            Self::Microsecond => Some(TimeDelta::microseconds(n)),
            Self::Nanosecond => Some(TimeDelta::nanoseconds(n)),
        }
    }
}

/// Explicit split range from the job config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SplitConfigRange {
    /// Key domain; inferred from the key field when absent
    #[serde(rename = "type")]
    pub split_type: Option<SplitType>,
    /// chrono layout for time bounds
    pub layout: String,
    /// Lower bound text; empty means "query the table"
    pub left: String,
    /// Upper bound text; empty means "query the table"
    pub right: String,
}

/// Split-key request of a read job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SplitConfig {
    /// Split-key column name
    pub key: String,
    /// Granularity for time keys
    pub time_accuracy: Option<TimeAccuracy>,
    /// Optional explicit range
    pub range: SplitConfigRange,
}

impl SplitConfig {
    /// Parse from JSON
    pub fn from_json(config: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(config.clone())
            .map_err(|e| Error::config(format!("invalid split config: {e}")))
    }

    /// Resolve and validate the split type against the key field
    pub fn check_type(&self, field: &dyn Field) -> Result<SplitType> {
        let kind = field.field_type().kind();
        let inferred = SplitType::for_kind(kind)?;
        match self.range.split_type {
            Some(declared) if declared != inferred => Err(Error::partition(format!(
                "split key {} is {}, configured range type is {}",
                field.name(),
                kind,
                declared
            ))),
            _ => Ok(inferred),
        }
    }

    /// Layout for time bounds, falling back to the default layout
    pub fn layout(&self) -> &str {
        if self.range.layout.is_empty() {
            DEFAULT_TIME_LAYOUT
        } else {
            &self.range.layout
        }
    }

    /// Bounds given in the config, if both are set
    pub fn bound_columns(&self, field: &dyn Field) -> Result<Option<(Column, Column)>> {
        if self.range.left.is_empty() || self.range.right.is_empty() {
            return Ok(None);
        }
        let split_type = self.check_type(field)?;
        let name = field.name();
        let layout = self.layout();
        Ok(Some((
            parse_bound(split_type, layout, name, &self.range.left)?,
            parse_bound(split_type, layout, name, &self.range.right)?,
        )))
    }

    /// Split `[min, max]` of `field` into at most `num` ranges
    pub fn split(
        &self,
        field: &dyn Field,
        min: &Column,
        max: &Column,
        num: usize,
    ) -> Result<Vec<SplitRange>> {
        let split_type = self.check_type(field)?;
        let layout = if self.range.layout.is_empty() {
            time_layout(min).unwrap_or(DEFAULT_TIME_LAYOUT)
        } else {
            &self.range.layout
        };
        split(
            split_type,
            layout,
            self.time_accuracy,
            field,
            min,
            max,
            num,
        )
    }
}

fn time_layout(column: &Column) -> Option<&str> {
    match column.value() {
        ColumnValue::Time { layout, .. } => Some(layout),
        _ => None,
    }
}

fn parse_bound(split_type: SplitType, layout: &str, name: &str, text: &str) -> Result<Column> {
    Ok(match split_type {
        SplitType::BigInt => {
            let n = BigInt::from_str(text.trim())
                .map_err(|e| Error::partition(format!("bound {text:?} is not an integer: {e}")))?;
            Column::bigint(name, n)
        }
        SplitType::String => Column::string(name, text),
        SplitType::Time => Column::time(name, parse_time(text, layout)?, layout),
    })
}

/// One partition of a split key's domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitRange {
    split_type: SplitType,
    layout: String,
    left: String,
    right: String,
    where_clause: String,
}

impl SplitRange {
    /// Key domain
    pub fn split_type(&self) -> SplitType {
        self.split_type
    }

    /// Layout of time bounds
    pub fn layout(&self) -> &str {
        &self.layout
    }

    /// Inclusive lower bound text
    pub fn left(&self) -> &str {
        &self.left
    }

    /// Upper bound text; exclusive except for the last range
    pub fn right(&self) -> &str {
        &self.right
    }

    /// WHERE fragment binding left as argument 1 and right as argument 2
    pub fn where_clause(&self) -> &str {
        &self.where_clause
    }

    /// Lower bound as a column named `name`
    pub fn left_column(&self, name: &str) -> Result<Column> {
        parse_bound(self.split_type, &self.layout, name, &self.left)
    }

    /// Upper bound as a column named `name`
    pub fn right_column(&self, name: &str) -> Result<Column> {
        parse_bound(self.split_type, &self.layout, name, &self.right)
    }
}

/// Maps a key domain onto integers and back
trait Convertor {
    fn to_bigint(&self, column: &Column) -> Result<BigInt>;
    fn from_bigint(&self, n: &BigInt) -> Result<String>;
    fn render(&self, column: &Column) -> Result<String>;
}

fn nil_bound(column: &Column) -> Error {
    Error::partition(format!("split bound {} is nil", column.name()))
}

struct BigIntConvertor;

impl Convertor for BigIntConvertor {
    fn to_bigint(&self, column: &Column) -> Result<BigInt> {
        column.as_bigint()?.ok_or_else(|| nil_bound(column))
    }

    fn from_bigint(&self, n: &BigInt) -> Result<String> {
        Ok(n.to_string())
    }

    fn render(&self, column: &Column) -> Result<String> {
        Ok(self.to_bigint(column)?.to_string())
    }
}

struct StringConvertor;

const STRING_RADIX: u8 = 127;

/// Read an ASCII string as a bijective base-127 numeral with digits
/// `1..=127` (the bytes themselves).
///
/// Every integer `>= 0` has exactly one such numeral and none contains NUL,
/// so rendered bounds stay inside the domain. The order is shortlex.
pub fn string_to_bigint(s: &str) -> Result<BigInt> {
    let mut n = BigInt::zero();
    for b in s.bytes() {
        if b == 0 || !b.is_ascii() {
            return Err(Error::partition(format!(
                "split string {s:?} contains byte {b:#04x} outside 1..=127"
            )));
        }
        n = n * STRING_RADIX + b;
    }
    Ok(n)
}

/// Render a non-negative integer as its bijective base-127 string
pub fn bigint_to_string(n: &BigInt) -> Result<String> {
    if n.sign() == num_bigint::Sign::Minus {
        return Err(Error::partition(format!(
            "negative coordinate {n} has no string form"
        )));
    }
    let radix = BigInt::from(STRING_RADIX);
    let mut rest = n.clone();
    let mut bytes = Vec::new();
    while !rest.is_zero() {
        let mut digit = (&rest % &radix).to_u8().unwrap_or(0);
        rest /= &radix;
        if digit == 0 {
            digit = STRING_RADIX;
            rest -= 1;
        }
        bytes.push(digit);
    }
    // digits are 1..=127, so each byte is a valid single-byte char
    Ok(bytes.into_iter().rev().map(char::from).collect())
}

impl Convertor for StringConvertor {
    fn to_bigint(&self, column: &Column) -> Result<BigInt> {
        string_to_bigint(&column.as_string()?.ok_or_else(|| nil_bound(column))?)
    }

    fn from_bigint(&self, n: &BigInt) -> Result<String> {
        bigint_to_string(n)
    }

    fn render(&self, column: &Column) -> Result<String> {
        column.as_string()?.ok_or_else(|| nil_bound(column))
    }
}

struct TimeConvertor {
    base: NaiveDateTime,
    unit: TimeAccuracy,
    layout: String,
}

impl TimeConvertor {
    fn time(column: &Column) -> Result<NaiveDateTime> {
        column.as_time()?.ok_or_else(|| nil_bound(column))
    }
}

impl Convertor for TimeConvertor {
    fn to_bigint(&self, column: &Column) -> Result<BigInt> {
        let t = Self::time(column)?;
        self.unit
            .delta(self.base, t)
            .map(BigInt::from)
            .ok_or_else(|| {
                Error::partition(format!(
                    "time span {} .. {} overflows {:?}",
                    self.base, t, self.unit
                ))
            })
    }

    fn from_bigint(&self, n: &BigInt) -> Result<String> {
        let t = n
            .to_i64()
            .and_then(|n| self.unit.span(n))
            .and_then(|d| self.base.checked_add_signed(d))
            .ok_or_else(|| {
                Error::partition(format!("{} {:?} after {} is out of range", n, self.unit, self.base))
            })?;
        Ok(format_time(&t, &self.layout))
    }

    fn render(&self, column: &Column) -> Result<String> {
        Ok(format_time(&Self::time(column)?, &self.layout))
    }
}

/// Split `[min, max]` into at most `num` contiguous ranges.
///
/// `min > max` is swapped; `min == max` (in split coordinates) yields one
/// closed range. For time keys the unit comes from `accuracy`, or from the
/// rendered length of `layout` when unset.
pub fn split(
    split_type: SplitType,
    layout: &str,
    accuracy: Option<TimeAccuracy>,
    field: &dyn Field,
    min: &Column,
    max: &Column,
    num: usize,
) -> Result<Vec<SplitRange>> {
    if num < 1 {
        return Err(Error::partition(format!("split count must be >= 1, got {num}")));
    }
    if min.is_null() {
        return Err(nil_bound(min));
    }
    if max.is_null() {
        return Err(nil_bound(max));
    }

    let convertor: Box<dyn Convertor> = match split_type {
        SplitType::BigInt => Box::new(BigIntConvertor),
        SplitType::String => Box::new(StringConvertor),
        SplitType::Time => {
            let unit = match accuracy {
                Some(unit) => unit,
                None => TimeAccuracy::from_layout(layout)?,
            };
            Box::new(TimeConvertor {
                base: TimeConvertor::time(min)?,
                unit,
                layout: layout.to_owned(),
            })
        }
    };

    let mut lo = convertor.to_bigint(min)?;
    let mut hi = convertor.to_bigint(max)?;
    let mut lo_text = convertor.render(min)?;
    let mut hi_text = convertor.render(max)?;
    if lo > hi {
        std::mem::swap(&mut lo, &mut hi);
        std::mem::swap(&mut lo_text, &mut hi_text);
    }

    let quoted = field.quoted();
    let clause = |last: bool| {
        format!(
            "{} >= {} and {} {} {}",
            quoted,
            field.bind_var(1),
            quoted,
            if last { "<=" } else { "<" },
            field.bind_var(2)
        )
    };
    let range = |left: String, right: String, last: bool| SplitRange {
        split_type,
        layout: layout.to_owned(),
        left,
        right,
        where_clause: clause(last),
    };

    if lo == hi {
        return Ok(vec![range(lo_text, hi_text, true)]);
    }

    let bounds = partition_bounds(&lo, &hi, num);
    let count = bounds.len() - 1;
    let mut ranges = Vec::with_capacity(count);
    let mut left_text = lo_text;
    for (i, right) in bounds.iter().enumerate().skip(1) {
        let last = i == count;
        let right_text = if last {
            hi_text.clone()
        } else {
            convertor.from_bigint(right)?
        };
        ranges.push(range(left_text, right_text.clone(), last));
        left_text = right_text;
    }
    Ok(ranges)
}

/// Integer boundaries `b0 = lo, .., bk = hi` of `k = min(num, hi - lo + 1)`
/// ranges.
///
/// Boundaries strictly increase, except that when the domain has fewer
/// points than `num` every point gets its own range and the last one is
/// `[hi, hi]`. Requires `lo <= hi` and `num >= 1`.
pub fn partition_bounds(lo: &BigInt, hi: &BigInt, num: usize) -> Vec<BigInt> {
    let n = BigInt::from(num);
    let gap = hi - lo;

    if gap < n {
        // gap < num, so it fits
        let points = gap.to_usize().unwrap_or(0) + 1;
        let mut bounds: Vec<BigInt> = (0..points).map(|i| lo + BigInt::from(i)).collect();
        bounds.push(hi.clone());
        return bounds;
    }

    let step = &gap / &n;
    let rem = (&gap % &n).to_usize().unwrap_or(0);
    let mut bounds = Vec::with_capacity(num + 1);
    let mut cur = lo.clone();
    bounds.push(cur.clone());
    for i in 0..num {
        cur = if i < rem { &cur + &step + 1 } else { &cur + &step };
        bounds.push(cur.clone());
    }
    bounds
}
