//! Runtime values shared by every storage backend.
//!
//! `Value` is the portable representation of a field value. Calendar types
//! are stored as integer days/microseconds so that every backend round-trips
//! exactly what the model stores; anything finer than a microsecond is
//! truncated at conversion time.

use std::cmp::Ordering;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// Semantic kind of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// Null marker.
    Null,
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// Arbitrary-precision integer.
    BigInt,
    /// 64-bit floating point.
    Float,
    /// Fixed-point decimal.
    Decimal,
    /// UTF-8 text.
    Str,
    /// Raw bytes.
    Bytes,
    /// Calendar date (days since the Unix epoch).
    Date,
    /// Time of day (microseconds since midnight).
    Time,
    /// Calendar timestamp (microseconds since the Unix epoch).
    DateTime,
    /// Elapsed time (microseconds).
    Duration,
    /// Ordered list of values.
    List,
    /// Unordered set of values (canonicalized on construction).
    Set,
    /// String-keyed mapping.
    Map,
    /// Opaquely serialized payload for unrecognized types.
    Opaque,
}

impl ValueKind {
    /// Check if this kind is numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ValueKind::Int | ValueKind::BigInt | ValueKind::Float | ValueKind::Decimal
        )
    }

    /// Check if this kind is string-like.
    pub fn is_string_like(&self) -> bool {
        matches!(self, ValueKind::Str | ValueKind::Bytes)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::BigInt => "bigint",
            ValueKind::Float => "float",
            ValueKind::Decimal => "decimal",
            ValueKind::Str => "str",
            ValueKind::Bytes => "bytes",
            ValueKind::Date => "date",
            ValueKind::Time => "time",
            ValueKind::DateTime => "datetime",
            ValueKind::Duration => "duration",
            ValueKind::List => "list",
            ValueKind::Set => "set",
            ValueKind::Map => "map",
            ValueKind::Opaque => "opaque",
        };
        f.write_str(name)
    }
}

/// Sign-and-magnitude integer of unbounded width.
///
/// The magnitude is big-endian with no leading zero bytes; zero is the empty
/// magnitude with `negative == false`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BigInt {
    negative: bool,
    magnitude: Vec<u8>,
}

impl BigInt {
    /// Build from a sign and raw big-endian magnitude bytes.
    pub fn new(negative: bool, magnitude: Vec<u8>) -> Self {
        let mut big = Self {
            negative,
            magnitude,
        };
        big.normalize();
        big
    }

    /// Build from an `i128`.
    pub fn from_i128(v: i128) -> Self {
        let negative = v < 0;
        let mag = v.unsigned_abs();
        Self::new(negative, mag.to_be_bytes().to_vec())
    }

    /// Build from an `i64`.
    pub fn from_i64(v: i64) -> Self {
        Self::from_i128(v as i128)
    }

    /// Whether the value is negative.
    pub fn is_negative(&self) -> bool {
        self.negative
    }

    /// Big-endian magnitude bytes (no leading zeros).
    pub fn magnitude(&self) -> &[u8] {
        &self.magnitude
    }

    /// Convert to `i128` if it fits.
    pub fn to_i128(&self) -> Option<i128> {
        if self.magnitude.len() > 16 {
            return None;
        }
        let mut buf = [0u8; 16];
        buf[16 - self.magnitude.len()..].copy_from_slice(&self.magnitude);
        let mag = u128::from_be_bytes(buf);
        if self.negative {
            if mag > i128::MAX as u128 + 1 {
                None
            } else if mag == i128::MAX as u128 + 1 {
                Some(i128::MIN)
            } else {
                Some(-(mag as i128))
            }
        } else if mag > i128::MAX as u128 {
            None
        } else {
            Some(mag as i128)
        }
    }

    /// Lossy conversion to `f64` for cross-type numeric comparison.
    pub fn to_f64(&self) -> f64 {
        let mut acc = 0.0f64;
        for byte in &self.magnitude {
            acc = acc * 256.0 + f64::from(*byte);
        }
        if self.negative {
            -acc
        } else {
            acc
        }
    }

    fn normalize(&mut self) {
        let first = self.magnitude.iter().position(|b| *b != 0);
        match first {
            Some(0) => {}
            Some(n) => {
                self.magnitude.drain(..n);
            }
            None => {
                self.magnitude.clear();
                self.negative = false;
            }
        }
    }
}

impl PartialOrd for BigInt {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BigInt {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.negative, other.negative) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (neg, _) => {
                let mag = self
                    .magnitude
                    .len()
                    .cmp(&other.magnitude.len())
                    .then_with(|| self.magnitude.cmp(&other.magnitude));
                if neg {
                    mag.reverse()
                } else {
                    mag
                }
            }
        }
    }
}

/// Fixed-point decimal: `unscaled * 10^-scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Decimal {
    /// Unscaled integer value.
    pub unscaled: i64,
    /// Number of digits after the decimal point.
    pub scale: u8,
}

impl Decimal {
    /// Build a decimal from its unscaled value and scale.
    pub fn new(unscaled: i64, scale: u8) -> Self {
        Self { unscaled, scale }
    }

    /// Lossy conversion to `f64`.
    pub fn to_f64(&self) -> f64 {
        self.unscaled as f64 / 10f64.powi(i32::from(self.scale))
    }

    /// Unscaled value rescaled to `scale` digits, in `i128` arithmetic.
    fn rescaled(&self, scale: u8) -> i128 {
        i128::from(self.unscaled) * 10i128.pow(u32::from(scale - self.scale))
    }

    fn cmp_decimal(&self, other: &Decimal) -> Ordering {
        let scale = self.scale.max(other.scale);
        self.rescaled(scale).cmp(&other.rescaled(scale))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.unscaled);
        }
        let divisor = 10i64.pow(u32::from(self.scale));
        let sign = if self.unscaled < 0 { "-" } else { "" };
        let abs = self.unscaled.unsigned_abs();
        let whole = abs / divisor.unsigned_abs();
        let frac = abs % divisor.unsigned_abs();
        write!(
            f,
            "{sign}{whole}.{frac:0width$}",
            width = usize::from(self.scale)
        )
    }
}

/// A runtime field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// Arbitrary-precision integer.
    BigInt(BigInt),
    /// 64-bit floating point.
    Float(f64),
    /// Fixed-point decimal.
    Decimal(Decimal),
    /// UTF-8 text.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Days since the Unix epoch.
    Date(i32),
    /// Microseconds since midnight.
    Time(i64),
    /// Microseconds since the Unix epoch.
    DateTime(i64),
    /// Elapsed microseconds.
    Duration(i64),
    /// Ordered list of values.
    List(Vec<Value>),
    /// Unordered set, canonicalized by encoded form.
    Set(Vec<Value>),
    /// String-keyed mapping, in insertion order.
    Map(Vec<(String, Value)>),
    /// Opaquely serialized payload.
    Opaque(Vec<u8>),
}

impl Value {
    /// The semantic kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::BigInt(_) => ValueKind::BigInt,
            Value::Float(_) => ValueKind::Float,
            Value::Decimal(_) => ValueKind::Decimal,
            Value::Str(_) => ValueKind::Str,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Date(_) => ValueKind::Date,
            Value::Time(_) => ValueKind::Time,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::Duration(_) => ValueKind::Duration,
            Value::List(_) => ValueKind::List,
            Value::Set(_) => ValueKind::Set,
            Value::Map(_) => ValueKind::Map,
            Value::Opaque(_) => ValueKind::Opaque,
        }
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Build a canonical set: elements sorted and deduplicated by their
    /// encoded form.
    pub fn set(items: impl IntoIterator<Item = Value>) -> Value {
        let mut encoded: Vec<(Vec<u8>, Value)> = items
            .into_iter()
            .map(|v| (crate::codec::encode_single(&v), v))
            .collect();
        encoded.sort_by(|a, b| a.0.cmp(&b.0));
        encoded.dedup_by(|a, b| a.0 == b.0);
        Value::Set(encoded.into_iter().map(|(_, v)| v).collect())
    }

    /// Coerce a narrower numeric value to `kind`.
    ///
    /// Returns `None` when no lossless widening exists. Null coerces to
    /// every kind.
    pub fn coerce_to(self, kind: ValueKind) -> Option<Value> {
        if self.kind() == kind || self.is_null() {
            return Some(self);
        }
        match (self, kind) {
            (Value::Int(i), ValueKind::Float) => Some(Value::Float(i as f64)),
            (Value::Int(i), ValueKind::BigInt) => Some(Value::BigInt(BigInt::from_i64(i))),
            (Value::Int(i), ValueKind::Decimal) => Some(Value::Decimal(Decimal::new(i, 0))),
            (Value::List(items), ValueKind::Set) => Some(Value::set(items)),
            _ => None,
        }
    }

    /// Equality with numeric widening across Int/BigInt/Float/Decimal.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (a, b) if a.kind() == b.kind() => a == b,
            _ => match self.compare(other) {
                Some(ord) => ord == Ordering::Equal,
                None => false,
            },
        }
    }

    /// Total-order comparison where one is defined.
    ///
    /// Numeric kinds compare across widths; strings, bytes, and calendar
    /// kinds compare within their own kind. Returns `None` for incompatible
    /// or unordered kinds.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::BigInt(a), Value::BigInt(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp_decimal(b)),
            (Value::Int(a), Value::BigInt(b)) => Some(BigInt::from_i64(*a).cmp(b)),
            (Value::BigInt(a), Value::Int(b)) => Some(a.cmp(&BigInt::from_i64(*b))),
            (Value::Int(a), Value::Decimal(b)) => Some(Decimal::new(*a, 0).cmp_decimal(b)),
            (Value::Decimal(a), Value::Int(b)) => Some(a.cmp_decimal(&Decimal::new(*b, 0))),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Decimal(b)) => a.partial_cmp(&b.to_f64()),
            (Value::Decimal(a), Value::Float(b)) => a.to_f64().partial_cmp(b),
            (Value::BigInt(a), Value::Float(b)) => a.to_f64().partial_cmp(b),
            (Value::Float(a), Value::BigInt(b)) => a.partial_cmp(&b.to_f64()),
            (Value::BigInt(a), Value::Decimal(b)) => a.to_f64().partial_cmp(&b.to_f64()),
            (Value::Decimal(a), Value::BigInt(b)) => a.to_f64().partial_cmp(&b.to_f64()),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Duration(a), Value::Duration(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Try to get as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as i64, widening from nothing.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to get as f64, widening from Int, BigInt, and Decimal.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::BigInt(b) => Some(b.to_f64()),
            Value::Decimal(d) => Some(d.to_f64()),
            _ => None,
        }
    }

    /// Try to get as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as raw bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Build from a calendar date.
    pub fn from_date(date: NaiveDate) -> Value {
        let days = date.signed_duration_since(NaiveDate::default()).num_days();
        Value::Date(days as i32)
    }

    /// Interpret as a calendar date.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(days) => {
                NaiveDate::default().checked_add_signed(chrono::Duration::days(i64::from(*days)))
            }
            _ => None,
        }
    }

    /// Build from a time of day. Sub-microsecond precision is truncated.
    pub fn from_time(time: NaiveTime) -> Value {
        let micros = i64::from(time.num_seconds_from_midnight()) * 1_000_000
            + i64::from(time.nanosecond() / 1_000) % 1_000_000;
        Value::Time(micros)
    }

    /// Interpret as a time of day.
    pub fn as_time(&self) -> Option<NaiveTime> {
        match self {
            Value::Time(micros) => NaiveTime::from_num_seconds_from_midnight_opt(
                (*micros / 1_000_000) as u32,
                ((*micros % 1_000_000) * 1_000) as u32,
            ),
            _ => None,
        }
    }

    /// Build from a timestamp. Sub-microsecond precision is truncated.
    pub fn from_datetime(dt: NaiveDateTime) -> Value {
        Value::DateTime(dt.and_utc().timestamp_micros())
    }

    /// Interpret as a timestamp.
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::DateTime(micros) => {
                chrono::DateTime::from_timestamp_micros(*micros).map(|dt| dt.naive_utc())
            }
            _ => None,
        }
    }

    /// Build from an elapsed duration, saturating at the microsecond range
    /// boundary.
    pub fn from_duration(duration: chrono::Duration) -> Value {
        Value::Duration(duration.num_microseconds().unwrap_or(i64::MAX))
    }

    /// Interpret as an elapsed duration.
    pub fn as_duration(&self) -> Option<chrono::Duration> {
        match self {
            Value::Duration(micros) => Some(chrono::Duration::microseconds(*micros)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::BigInt(b) => match b.to_i128() {
                Some(i) => write!(f, "{i}"),
                None => write!(f, "bigint({} bytes)", b.magnitude().len()),
            },
            Value::Float(x) => write!(f, "{x}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "bytes({})", b.len()),
            Value::Date(_) => match self.as_date() {
                Some(d) => write!(f, "{d}"),
                None => f.write_str("date(?)"),
            },
            Value::Time(_) => match self.as_time() {
                Some(t) => write!(f, "{t}"),
                None => f.write_str("time(?)"),
            },
            Value::DateTime(_) => match self.as_datetime() {
                Some(dt) => write!(f, "{dt}"),
                None => f.write_str("datetime(?)"),
            },
            Value::Duration(micros) => write!(f, "{micros}us"),
            Value::List(items) => write!(f, "list[{}]", items.len()),
            Value::Set(items) => write!(f, "set[{}]", items.len()),
            Value::Map(entries) => write!(f, "map[{}]", entries.len()),
            Value::Opaque(b) => write!(f, "opaque({})", b.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::from_date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Value::from_time(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::from_datetime(v)
    }
}

impl From<chrono::Duration> for Value {
    fn from(v: chrono::Duration) -> Self {
        Value::from_duration(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self {
        Value::BigInt(v)
    }
}
