//! Per-type conversion rules between host values and wire values.
//!
//! A [`VariableKind`] decides which host values a variable accepts, how
//! database values are parsed into the internal representation, and how the
//! internal representation is rendered back for the host or the database.

use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc,
};
use regex::Regex;

use crate::Result;
use crate::error::Error;
use crate::value::Value;

/// Compiled patterns are cached for the lifetime of the program.
fn decimal_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-+]?(\d+(\.\d*)?|\.\d+)([eE][-+]?\d+)?$").ok())
        .as_ref()
}

fn interval_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[\s,]*([-+]?(?:\d\d?:\d\d?(?::\d\d?)?(?:\.\d+)?|\d+(?:\.\d+)?))[\s,]*").ok()
    })
    .as_ref()
}

/// Bidirectional mapping between host values and database values for
/// enumerated columns.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumMap {
    pairs: Vec<(Value, Value)>,
}

impl EnumMap {
    /// Build a map from `(host, db)` pairs.
    pub fn new(pairs: impl IntoIterator<Item = (Value, Value)>) -> Self {
        Self {
            pairs: pairs.into_iter().collect(),
        }
    }

    fn to_db(&self, host: &Value) -> Option<&Value> {
        self.pairs.iter().find(|(h, _)| h == host).map(|(_, d)| d)
    }

    fn to_host(&self, db: &Value) -> Option<&Value> {
        self.pairs.iter().find(|(_, d)| d == db).map(|(h, _)| h)
    }
}

/// The typed behavior of a [`Variable`](crate::Variable).
#[derive(Debug, Clone, PartialEq)]
pub enum VariableKind {
    /// Accepts anything unchanged.
    Any,
    Bool,
    Int,
    Float,
    /// Arbitrary precision number carried as its decimal string.
    Decimal,
    /// Raw bytes.
    RawStr,
    /// Text.
    Unicode,
    /// Timestamp, optionally normalized into a fixed timezone.
    DateTime { tz: Option<FixedOffset> },
    Date,
    Time,
    TimeDelta,
    Uuid,
    Enum(Arc<EnumMap>),
    /// Mutable JSON document.
    Json,
    /// Mutable list whose items follow the inner kind.
    List(Arc<VariableKind>),
}

impl VariableKind {
    /// A short name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            VariableKind::Any => "any",
            VariableKind::Bool => "bool",
            VariableKind::Int => "int",
            VariableKind::Float => "float",
            VariableKind::Decimal => "decimal",
            VariableKind::RawStr => "bytes",
            VariableKind::Unicode => "text",
            VariableKind::DateTime { .. } => "datetime",
            VariableKind::Date => "date",
            VariableKind::Time => "time",
            VariableKind::TimeDelta => "timedelta",
            VariableKind::Uuid => "uuid",
            VariableKind::Enum(_) => "enum",
            VariableKind::Json => "json",
            VariableKind::List(_) => "list",
        }
    }

    /// Does this kind hold content that can be mutated in place?
    pub fn is_mutable(&self) -> bool {
        matches!(self, VariableKind::Json | VariableKind::List(_))
    }

    /// Convert an external value (host or database) to the internal form.
    ///
    /// NULL never reaches this method; nullability is checked by the
    /// variable before parsing.
    pub fn parse_set(&self, value: Value, from_db: bool, column: Option<&str>) -> Result<Value> {
        let mismatch = |value: &Value| {
            Err(Error::type_mismatch(
                self.name(),
                value.type_name(),
                column,
            ))
        };
        match self {
            VariableKind::Any => Ok(value),
            VariableKind::Bool => match value.as_bool() {
                Some(b) if value.is_numeric() => Ok(Value::Bool(b)),
                _ => mismatch(&value),
            },
            VariableKind::Int => {
                if let Some(n) = value.as_i64() {
                    return Ok(Value::BigInt(n));
                }
                match value {
                    Value::Float(_) | Value::Double(_) | Value::Decimal(_) => {
                        #[allow(clippy::cast_possible_truncation)]
                        let truncated = value.as_f64().map(|f| f.trunc() as i64);
                        truncated.map_or_else(|| mismatch(&value), |n| Ok(Value::BigInt(n)))
                    }
                    _ => mismatch(&value),
                }
            }
            VariableKind::Float => match value.as_f64() {
                Some(f) if value.is_numeric() => Ok(Value::Double(f)),
                _ => mismatch(&value),
            },
            VariableKind::Decimal => match value {
                Value::Decimal(s) => parse_decimal(&s, column),
                Value::Text(s) if from_db => parse_decimal(&s, column),
                Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
                    Ok(Value::Decimal(value.as_i64().unwrap_or_default().to_string()))
                }
                other => mismatch(&other),
            },
            VariableKind::RawStr => match value {
                Value::Bytes(b) => Ok(Value::Bytes(b)),
                Value::Text(s) if from_db => Ok(Value::Bytes(s.into_bytes())),
                other => mismatch(&other),
            },
            VariableKind::Unicode => match value {
                Value::Text(s) => Ok(Value::Text(s)),
                other => mismatch(&other),
            },
            VariableKind::DateTime { tz } => parse_datetime(value, from_db, *tz, column),
            VariableKind::Date => match value {
                Value::Date(d) => Ok(Value::Date(d)),
                Value::Text(s) if from_db => {
                    let date_part = s.split(' ').next().unwrap_or_default();
                    Ok(Value::date(parse_date(date_part, column)?))
                }
                Value::Timestamp(_) | Value::TimestampTz(_) if !from_db => value
                    .as_naive_datetime()
                    .map(|dt| Value::date(dt.date()))
                    .ok_or_else(|| Error::type_mismatch("date", "out of range timestamp", column)),
                other => mismatch(&other),
            },
            VariableKind::Time => match value {
                Value::Time(t) => Ok(Value::Time(t)),
                Value::Text(s) if from_db => {
                    let time_part = s.rsplit(' ').next().unwrap_or_default();
                    Ok(Value::time(parse_time(time_part, column)?))
                }
                Value::Timestamp(_) | Value::TimestampTz(_) if !from_db => value
                    .as_naive_datetime()
                    .map(|dt| Value::time(dt.time()))
                    .ok_or_else(|| Error::type_mismatch("time", "out of range timestamp", column)),
                other => mismatch(&other),
            },
            VariableKind::TimeDelta => match value {
                Value::Interval(us) => Ok(Value::Interval(us)),
                Value::Text(s) if from_db => Ok(Value::interval(parse_interval(&s, column)?)),
                other => mismatch(&other),
            },
            VariableKind::Uuid => match value {
                Value::Uuid(bytes) => Ok(Value::Uuid(bytes)),
                Value::Text(s) if from_db => uuid::Uuid::parse_str(&s)
                    .map(Value::from)
                    .map_err(|e| Error::type_mismatch("uuid", e.to_string(), column)),
                other => mismatch(&other),
            },
            VariableKind::Enum(map) => {
                if from_db {
                    return Ok(value);
                }
                map.to_db(&value).cloned().ok_or_else(|| {
                    Error::type_mismatch("enum member", format!("invalid enum value {value:?}"), column)
                })
            }
            VariableKind::Json => match value {
                Value::Text(s) if from_db => Ok(Value::Json(serde_json::from_str(&s)?)),
                Value::Bytes(b) if from_db => Ok(Value::Json(serde_json::from_slice(&b)?)),
                Value::Json(j) => Ok(Value::Json(j)),
                other if from_db => mismatch(&other),
                other => Ok(Value::Json(host_to_json(other))),
            },
            VariableKind::List(item) => match value {
                Value::Array(items) => {
                    if !from_db {
                        return Ok(Value::Array(items));
                    }
                    let mut parsed = Vec::with_capacity(items.len());
                    for v in items {
                        if v.is_null() {
                            parsed.push(Value::Null);
                        } else {
                            let internal = item.parse_set(v, true, column)?;
                            parsed.push(item.parse_get(&internal, false)?);
                        }
                    }
                    Ok(Value::Array(parsed))
                }
                other => mismatch(&other),
            },
        }
    }

    /// Convert an internal value to its host form, or its wire form when
    /// `to_db` is set.
    pub fn parse_get(&self, value: &Value, to_db: bool) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            VariableKind::Decimal if to_db => match value {
                Value::Decimal(s) => Ok(Value::Text(s.clone())),
                other => Ok(other.clone()),
            },
            VariableKind::Uuid if to_db => match value {
                Value::Uuid(bytes) => Ok(Value::Text(uuid::Uuid::from_bytes(*bytes).hyphenated().to_string())),
                other => Ok(other.clone()),
            },
            VariableKind::Enum(map) if !to_db => map.to_host(value).cloned().ok_or_else(|| {
                Error::type_mismatch("enum member", format!("invalid enum value {value:?}"), None)
            }),
            VariableKind::Json if to_db => match value {
                Value::Json(j) => Ok(Value::Text(serde_json::to_string(j)?)),
                other => Ok(other.clone()),
            },
            VariableKind::List(item) if to_db => match value {
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for v in items {
                        if v.is_null() {
                            out.push(Value::Null);
                        } else {
                            let internal = item.parse_set(v.clone(), false, None)?;
                            out.push(item.parse_get(&internal, true)?);
                        }
                    }
                    Ok(Value::Array(out))
                }
                other => Ok(other.clone()),
            },
            _ => Ok(value.clone()),
        }
    }

    /// The serialized snapshot used to detect in-place mutation.
    pub(crate) fn serialize_state(&self, value: &Value) -> Option<String> {
        if self.is_mutable() {
            serde_json::to_string(value).ok()
        } else {
            None
        }
    }
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn host_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Text(s) | Value::Decimal(s) => serde_json::Value::String(s),
        Value::Json(j) => j,
        Value::Array(items) => serde_json::Value::Array(items.into_iter().map(host_to_json).collect()),
        other => match other.as_i64() {
            Some(n) => serde_json::Value::from(n),
            None => other
                .as_f64()
                .map_or(serde_json::Value::Null, serde_json::Value::from),
        },
    }
}

fn parse_decimal(s: &str, column: Option<&str>) -> Result<Value> {
    let trimmed = s.trim();
    if decimal_re().is_some_and(|re| re.is_match(trimmed)) {
        Ok(Value::Decimal(trimmed.to_string()))
    } else {
        Err(Error::type_mismatch("decimal", format!("{trimmed:?}"), column))
    }
}

fn parse_int_component(part: &str, what: &'static str, column: Option<&str>) -> Result<u32> {
    part.trim()
        .parse::<u32>()
        .map_err(|_| Error::type_mismatch(what, format!("{part:?}"), column))
}

/// Parse `YYYY-MM-DD`.
pub(crate) fn parse_date(s: &str, column: Option<&str>) -> Result<NaiveDate> {
    let mut parts = s.split('-');
    let (Some(y), Some(m), Some(d), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::type_mismatch("date string", format!("unknown date format {s:?}"), column));
    };
    let year = y
        .trim()
        .parse::<i32>()
        .map_err(|_| Error::type_mismatch("date string", format!("{s:?}"), column))?;
    let month = parse_int_component(m, "date string", column)?;
    let day = parse_int_component(d, "date string", column)?;
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| Error::type_mismatch("date string", format!("invalid date {s:?}"), column))
}

/// Parse `HH:MM[:SS[.ffffff]]`. Fractions shorter than six digits are scaled.
pub(crate) fn parse_time(s: &str, column: Option<&str>) -> Result<NaiveTime> {
    let (h, m, s_part) = split_time(s, column)?;
    let hour = parse_int_component(h, "time string", column)?;
    let minute = parse_int_component(m, "time string", column)?;
    let (second, micro) = parse_seconds(s_part, column)?;
    NaiveTime::from_hms_micro_opt(hour, minute, second, micro)
        .ok_or_else(|| Error::type_mismatch("time string", format!("invalid time {s:?}"), column))
}

fn split_time<'a>(s: &'a str, column: Option<&str>) -> Result<(&'a str, &'a str, &'a str)> {
    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        [h, m] => Ok((*h, *m, "0")),
        [h, m, sec] => Ok((*h, *m, *sec)),
        _ => Err(Error::type_mismatch(
            "time string",
            format!("unknown time format {s:?}"),
            column,
        )),
    }
}

fn parse_seconds(s: &str, column: Option<&str>) -> Result<(u32, u32)> {
    match s.split_once('.') {
        Some((sec, frac)) => {
            let second = parse_int_component(sec, "time string", column)?;
            let digits: String = frac.chars().take(6).collect();
            let mut micro = parse_int_component(&digits, "time string", column)?;
            for _ in digits.len()..6 {
                micro *= 10;
            }
            Ok((second, micro))
        }
        None => Ok((parse_int_component(s, "time string", column)?, 0)),
    }
}

fn parse_datetime(
    value: Value,
    from_db: bool,
    tz: Option<FixedOffset>,
    column: Option<&str>,
) -> Result<Value> {
    let mismatch = |v: &Value| Error::type_mismatch("datetime", v.type_name(), column);
    if from_db {
        let naive_or_utc = match value {
            Value::Timestamp(us) => Stamp::Naive(us),
            Value::TimestampTz(us) => Stamp::Utc(us),
            Value::Text(s) => {
                let Some((date_str, time_str)) = s.split_once(' ') else {
                    return Err(Error::type_mismatch(
                        "date/time string",
                        format!("unknown date/time format {s:?}"),
                        column,
                    ));
                };
                let dt = NaiveDateTime::new(parse_date(date_str, column)?, parse_time(time_str, column)?);
                Stamp::Naive(dt.and_utc().timestamp_micros())
            }
            other => return Err(mismatch(&other)),
        };
        return Ok(match (tz, naive_or_utc) {
            (None, Stamp::Naive(us)) => Value::Timestamp(us),
            (None, Stamp::Utc(us)) => Value::TimestampTz(us),
            (Some(offset), Stamp::Naive(us)) => Value::TimestampTz(localize(us, offset, column)?),
            (Some(_), Stamp::Utc(us)) => Value::TimestampTz(us),
        });
    }

    let stamp = match value {
        Value::Timestamp(us) => Stamp::Naive(us),
        Value::TimestampTz(us) => Stamp::Utc(us),
        ref v if v.is_numeric() && !matches!(v, Value::Bool(_) | Value::Decimal(_)) => {
            let secs = v.as_f64().unwrap_or_default();
            #[allow(clippy::cast_possible_truncation)]
            let micros = (secs * 1_000_000.0).round() as i64;
            Stamp::Naive(micros)
        }
        other => return Err(mismatch(&other)),
    };
    Ok(match (tz, stamp) {
        (None, Stamp::Naive(us)) => Value::Timestamp(us),
        (None | Some(_), Stamp::Utc(us)) | (Some(_), Stamp::Naive(us)) => Value::TimestampTz(us),
    })
}

enum Stamp {
    Naive(i64),
    Utc(i64),
}

/// Interpret naive wall-clock microseconds as local time in `offset`.
fn localize(naive_us: i64, offset: FixedOffset, column: Option<&str>) -> Result<i64> {
    let naive = DateTime::<Utc>::from_timestamp_micros(naive_us)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| Error::type_mismatch("datetime", "out of range timestamp", column))?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp_micros())
        .ok_or_else(|| Error::type_mismatch("datetime", "ambiguous local time", column))
}

fn interval_unit(unit: &str, amount: f64) -> Option<TimeDelta> {
    let micros = match unit {
        "d" | "day" | "days" => amount * 86_400_000_000.0,
        "h" | "hour" | "hours" => amount * 3_600_000_000.0,
        "m" | "min" | "minute" | "minutes" => amount * 60_000_000.0,
        "s" | "sec" | "second" | "seconds" => amount * 1_000_000.0,
        "ms" | "millisecond" | "milliseconds" => amount * 1_000.0,
        "microsecond" | "microseconds" => amount,
        _ => return None,
    };
    #[allow(clippy::cast_possible_truncation)]
    Some(TimeDelta::microseconds(micros.round() as i64))
}

/// Split the way a capturing `re.split` would: gaps and captures interleaved.
fn interval_tokens(s: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut last = 0;
    let Some(re) = interval_re() else {
        tokens.push(s);
        return tokens;
    };
    for caps in re.captures_iter(s) {
        let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        tokens.push(&s[last..whole.start()]);
        tokens.push(number.as_str());
        last = whole.end();
    }
    tokens.push(&s[last..]);
    tokens
}

/// Parse an interval such as `1 day, 02:30:00` or `3 hours 15 min`.
///
/// A trailing number without a unit counts as seconds; a bare number
/// directly followed by a clock token counts as days.
pub(crate) fn parse_interval(s: &str, column: Option<&str>) -> Result<TimeDelta> {
    let mut result = TimeDelta::zero();
    let mut pending: Option<f64> = None;
    for token in interval_tokens(s) {
        if token.is_empty() {
            continue;
        }
        if token.contains(':') {
            if let Some(days) = pending.take() {
                result += interval_unit("days", days).unwrap_or_else(TimeDelta::zero);
            }
            let negative = token.starts_with('-');
            let clock = token.trim_start_matches(['-', '+']);
            let (h, m, sec) = split_time(clock, column)?;
            let hours = parse_int_component(h, "interval", column)?;
            let minutes = parse_int_component(m, "interval", column)?;
            let (seconds, micros) = parse_seconds(sec, column)?;
            let delta = TimeDelta::hours(i64::from(hours))
                + TimeDelta::minutes(i64::from(minutes))
                + TimeDelta::seconds(i64::from(seconds))
                + TimeDelta::microseconds(i64::from(micros));
            result += if negative { -delta } else { delta };
        } else if let Some(amount) = pending {
            let unit = interval_unit(token, amount).ok_or_else(|| {
                Error::type_mismatch(
                    "interval",
                    format!("unsupported interval unit {token:?} in interval {s:?}"),
                    column,
                )
            })?;
            result += unit;
            pending = None;
        } else {
            let amount = token.parse::<f64>().map_err(|_| {
                Error::type_mismatch(
                    "interval",
                    format!("expected an interval value rather than {token:?} in interval {s:?}"),
                    column,
                )
            })?;
            pending = Some(amount);
        }
    }
    if let Some(seconds) = pending {
        result += interval_unit("seconds", seconds).unwrap_or_else(TimeDelta::zero);
    }
    Ok(result)
}
