//! Dynamic SQL values.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;

/// A database value without a static type.
///
/// Values travel in both directions: as compiled statement parameters
/// (after a [`Variable`](crate::Variable) converted them to their wire form)
/// and as row cells returned by a driver. Temporal variants are stored as
/// integer offsets from the Unix epoch so they compare and hash cheaply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    /// Decimal text, validated by the decimal variable kind.
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    /// Days since 1970-01-01.
    Date(i32),
    /// Microseconds since midnight.
    Time(i64),
    /// Microseconds since the epoch, no zone.
    Timestamp(i64),
    /// Microseconds since the epoch, normalized to UTC.
    TimestampTz(i64),
    /// Microseconds.
    Interval(i64),
    Uuid([u8; 16]),
    Json(serde_json::Value),
    /// Items of a list column.
    Array(Vec<Value>),
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// SQL spelling of the variant, used in type errors.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::TinyInt(_) => "TINYINT",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Float(_) => "REAL",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Time(_) => "TIME",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::TimestampTz(_) => "TIMESTAMPTZ",
            Value::Interval(_) => "INTERVAL",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
            Value::Array(_) => "ARRAY",
        }
    }

    /// Booleans count as numbers, as most drivers store them as integers.
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Bool(_)
                | Value::TinyInt(_)
                | Value::SmallInt(_)
                | Value::Int(_)
                | Value::BigInt(_)
                | Value::Float(_)
                | Value::Double(_)
                | Value::Decimal(_)
        )
    }

    /// Truthiness of numeric values.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Float(_) | Value::Double(_) => self.as_f64().map(|f| f != 0.0),
            other => other.as_i64().map(|n| n != 0),
        }
    }

    /// Integer variants widened to `i64`; floats are not truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Bool(b) => Some(i64::from(b)),
            Value::TinyInt(n) => Some(i64::from(n)),
            Value::SmallInt(n) => Some(i64::from(n)),
            Value::Int(n) => Some(i64::from(n)),
            Value::BigInt(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(f64::from(*f)),
            Value::Double(f) => Some(*f),
            Value::BigInt(n) => Some(*n as f64),
            Value::Decimal(text) => text.parse().ok(),
            other => other.as_i64().map(|n| n as f64),
        }
    }

    /// Text and decimal payloads.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) | Value::Decimal(text) => Some(text),
            _ => None,
        }
    }

    /// Build a timestamp value from a naive date/time.
    pub fn timestamp(dt: NaiveDateTime) -> Self {
        Value::Timestamp(dt.and_utc().timestamp_micros())
    }

    /// Build a timezone-aware timestamp value.
    pub fn timestamp_tz<Tz: chrono::TimeZone>(dt: &DateTime<Tz>) -> Self {
        Value::TimestampTz(dt.timestamp_micros())
    }

    /// Build a date value.
    pub fn date(d: NaiveDate) -> Self {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
        let days = d.signed_duration_since(epoch).num_days();
        Value::Date(i32::try_from(days).unwrap_or(i32::MAX))
    }

    /// Build a time-of-day value.
    pub fn time(t: NaiveTime) -> Self {
        let secs = i64::from(t.num_seconds_from_midnight());
        let micros = i64::from(t.nanosecond() / 1_000);
        Value::Time(secs * MICROS_PER_SECOND + micros)
    }

    /// Build an interval value.
    pub fn interval(delta: TimeDelta) -> Self {
        Value::Interval(delta.num_microseconds().unwrap_or(i64::MAX))
    }

    /// Interpret a timestamp value as a naive date/time.
    pub fn as_naive_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(us) | Value::TimestampTz(us) => {
                DateTime::<Utc>::from_timestamp_micros(*us).map(|dt| dt.naive_utc())
            }
            _ => None,
        }
    }

    /// Interpret a date value.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(days) => {
                let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
                epoch.checked_add_signed(TimeDelta::days(i64::from(*days)))
            }
            _ => None,
        }
    }

    /// Interpret a time-of-day value.
    pub fn as_time(&self) -> Option<NaiveTime> {
        match self {
            Value::Time(us) => {
                let us = us.rem_euclid(MICROS_PER_DAY);
                let secs = u32::try_from(us / MICROS_PER_SECOND).ok()?;
                let nanos = u32::try_from((us % MICROS_PER_SECOND) * 1_000).ok()?;
                NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
            }
            _ => None,
        }
    }

    /// Interpret an interval value.
    pub fn as_interval(&self) -> Option<TimeDelta> {
        match self {
            Value::Interval(us) => Some(TimeDelta::microseconds(*us)),
            _ => None,
        }
    }

    /// Numeric value as `f64`; large integers may lose precision.
    pub fn to_f64_lossy(&self) -> crate::Result<f64> {
        self.as_f64()
            .ok_or_else(|| Error::type_mismatch("numeric value", self.type_name(), None))
    }

    /// Feed this value into a hasher.
    ///
    /// Each variant hashes a distinct tag byte first so `Int(1)` and
    /// `Text("1")` never collide structurally.
    pub fn hash_into<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::TinyInt(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::SmallInt(i) => {
                3u8.hash(state);
                i.hash(state);
            }
            Value::Int(i) => {
                4u8.hash(state);
                i.hash(state);
            }
            Value::BigInt(i) => {
                5u8.hash(state);
                i.hash(state);
            }
            Value::Float(f) => {
                6u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::Double(f) => {
                7u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::Decimal(s) => {
                8u8.hash(state);
                s.hash(state);
            }
            Value::Text(s) => {
                9u8.hash(state);
                s.hash(state);
            }
            Value::Bytes(b) => {
                10u8.hash(state);
                b.hash(state);
            }
            Value::Date(d) => {
                11u8.hash(state);
                d.hash(state);
            }
            Value::Time(t) => {
                12u8.hash(state);
                t.hash(state);
            }
            Value::Timestamp(ts) => {
                13u8.hash(state);
                ts.hash(state);
            }
            Value::TimestampTz(ts) => {
                14u8.hash(state);
                ts.hash(state);
            }
            Value::Interval(us) => {
                15u8.hash(state);
                us.hash(state);
            }
            Value::Uuid(u) => {
                16u8.hash(state);
                u.hash(state);
            }
            Value::Json(j) => {
                17u8.hash(state);
                j.to_string().hash(state);
            }
            Value::Array(items) => {
                18u8.hash(state);
                items.len().hash(state);
                for item in items {
                    item.hash_into(state);
                }
            }
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from!(
    bool => Bool,
    i8 => TinyInt,
    i16 => SmallInt,
    i32 => Int,
    i64 => BigInt,
    f32 => Float,
    f64 => Double,
    String => Text,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
    Vec<Value> => Array,
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl From<uuid::Uuid> for Value {
    fn from(v: uuid::Uuid) -> Self {
        Value::Uuid(v.into_bytes())
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::timestamp(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Value::time(v)
    }
}

impl From<TimeDelta> for Value {
    fn from(v: TimeDelta) -> Self {
        Value::interval(v)
    }
}

fn mismatch(expected: &'static str, value: &Value) -> Error {
    Error::type_mismatch(expected, value.type_name(), None)
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Error> {
        value.as_bool().ok_or_else(|| mismatch("BOOLEAN", &value))
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Error> {
        value.as_i64().ok_or_else(|| mismatch("BIGINT", &value))
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Error> {
        value.as_f64().ok_or_else(|| mismatch("DOUBLE", &value))
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Error> {
        match value {
            Value::Text(text) | Value::Decimal(text) => Ok(text),
            other => Err(mismatch("TEXT", &other)),
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Error> {
        match value {
            Value::Bytes(bytes) => Ok(bytes),
            Value::Text(text) => Ok(text.into_bytes()),
            other => Err(mismatch("BLOB", &other)),
        }
    }
}

impl TryFrom<Value> for uuid::Uuid {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Error> {
        match value {
            Value::Uuid(bytes) => Ok(uuid::Uuid::from_bytes(bytes)),
            Value::Text(text) => uuid::Uuid::parse_str(&text)
                .map_err(|e| Error::type_mismatch("UUID", e.to_string(), None)),
            other => Err(mismatch("UUID", &other)),
        }
    }
}

/// NULL maps to `None`; anything else must convert to `T`.
impl<T> TryFrom<Value> for Option<T>
where
    T: TryFrom<Value, Error = Error>,
{
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Error> {
        if value.is_null() {
            Ok(None)
        } else {
            T::try_from(value).map(Some)
        }
    }
}
