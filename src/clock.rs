//! Time encoding and small codec helpers.
//!
//! Timestamps are persisted as integer microseconds since the Unix epoch.
//! Some platforms report nanoseconds and the store only keeps doubles, so
//! every time value is truncated to microseconds before it is compared or
//! written.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{StatusError, StatusResult};

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current time, truncated to microseconds.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }
}

/// Deterministic clock that advances by a fixed step on every read.
///
/// Useful when the relative order of recorded timestamps matters, e.g. in
/// tests that query by time range.
#[derive(Debug)]
pub struct ManualClock {
    next_usec: AtomicI64,
    step_usec: i64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>, step: chrono::Duration) -> Self {
        Self {
            next_usec: AtomicI64::new(start.timestamp_micros()),
            step_usec: step.num_microseconds().unwrap_or(0),
        }
    }

    /// A clock frozen at `start`.
    pub fn frozen(start: DateTime<Utc>) -> Self {
        Self::new(start, chrono::Duration::zero())
    }

    /// Move the clock forward without reading it.
    pub fn advance(&self, by: chrono::Duration) {
        self.next_usec
            .fetch_add(by.num_microseconds().unwrap_or(0), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let usec = self.next_usec.fetch_add(self.step_usec, Ordering::SeqCst);
        from_usec(usec)
    }
}

/// Anything that can be turned into a microsecond timestamp.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeInput {
    Time(DateTime<Utc>),
    /// Seconds since the epoch.
    Seconds(f64),
    /// Microseconds since the epoch.
    Micros(i64),
    /// Integer microseconds or an RFC 3339 timestamp.
    Text(String),
}

impl TimeInput {
    /// Interpret a JSON value as a time bound. `null` yields `None`.
    ///
    /// Integers are microseconds, floats are seconds and strings are either
    /// integer microseconds or RFC 3339.
    pub fn from_json(value: &Value) -> StatusResult<Option<Self>> {
        match value {
            Value::Null => Ok(None),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Some(Self::Micros(i)))
                } else if let Some(f) = n.as_f64() {
                    Ok(Some(Self::Seconds(f)))
                } else {
                    Err(StatusError::invalid(format!("{n} is not a valid time")))
                }
            }
            Value::String(s) => Ok(Some(Self::Text(s.clone()))),
            other => Err(StatusError::invalid(format!("{other} is not a valid time"))),
        }
    }
}

impl From<DateTime<Utc>> for TimeInput {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Time(t)
    }
}

impl From<f64> for TimeInput {
    fn from(secs: f64) -> Self {
        Self::Seconds(secs)
    }
}

impl From<i64> for TimeInput {
    fn from(usec: i64) -> Self {
        Self::Micros(usec)
    }
}

impl From<&str> for TimeInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for TimeInput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Encode a time as integer microseconds since the epoch.
pub fn to_usec(time: impl Into<TimeInput>) -> StatusResult<i64> {
    match time.into() {
        TimeInput::Time(t) => Ok(t.timestamp_micros()),
        TimeInput::Seconds(secs) => {
            if !secs.is_finite() {
                return Err(StatusError::invalid(format!("{secs} is not a valid time")));
            }
            // Go through six-decimal text so 1451327553.0 does not become
            // 1451327552999999.
            format!("{secs:.6}")
                .replace('.', "")
                .parse()
                .map_err(|_| StatusError::invalid(format!("{secs} is out of range")))
        }
        TimeInput::Micros(usec) => Ok(usec),
        TimeInput::Text(text) => {
            let trimmed = text.trim();
            if let Ok(usec) = trimmed.parse::<i64>() {
                return Ok(usec);
            }
            DateTime::parse_from_rfc3339(trimmed)
                .map(|t| t.with_timezone(&Utc).timestamp_micros())
                .map_err(|_| StatusError::invalid(format!("'{text}' is not a valid time")))
        }
    }
}

/// Decode integer microseconds since the epoch.
pub fn from_usec(usec: i64) -> DateTime<Utc> {
    let secs = usec.div_euclid(1_000_000);
    let nanos = (usec.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Random lowercase hex string (32 characters).
pub fn random_hex() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The size of an ordered sequence of `total` items after skipping `offset`
/// and keeping at most `limit`.
pub fn limited_count(total: usize, offset: Option<usize>, limit: Option<usize>) -> usize {
    let first = offset.unwrap_or(0);
    let end = first.saturating_add(limit.unwrap_or(total)).min(total);
    end.saturating_sub(first)
}
