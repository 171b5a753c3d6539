//! Fixed-point notification timestamps.
//!
//! Every timestamp the pipeline stores is an integer count of microseconds
//! since the UNIX epoch, so equality checks across processes are exact.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const MICROS_PER_SECOND: i64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized timestamp '{0}'")]
pub struct TimeParseError(pub String);

/// The wire formats accepted for notification timestamps, in match order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFormat {
    IsoZulu,
    IsoZuluMicros,
    IsoMicros,
    Iso,
    SpaceMicros,
    Space,
}

impl TimeFormat {
    pub const ALL: [TimeFormat; 6] = [
        TimeFormat::IsoZulu,
        TimeFormat::IsoZuluMicros,
        TimeFormat::IsoMicros,
        TimeFormat::Iso,
        TimeFormat::SpaceMicros,
        TimeFormat::Space,
    ];

    fn parse_pattern(self) -> &'static str {
        match self {
            TimeFormat::IsoZulu => "%Y-%m-%dT%H:%M:%SZ",
            TimeFormat::IsoZuluMicros => "%Y-%m-%dT%H:%M:%S%.fZ",
            TimeFormat::IsoMicros => "%Y-%m-%dT%H:%M:%S%.f",
            TimeFormat::Iso => "%Y-%m-%dT%H:%M:%S",
            TimeFormat::SpaceMicros => "%Y-%m-%d %H:%M:%S%.f",
            TimeFormat::Space => "%Y-%m-%d %H:%M:%S",
        }
    }

    fn render_pattern(self) -> &'static str {
        match self {
            TimeFormat::IsoZulu => "%Y-%m-%dT%H:%M:%SZ",
            TimeFormat::IsoZuluMicros => "%Y-%m-%dT%H:%M:%S%.6fZ",
            TimeFormat::IsoMicros => "%Y-%m-%dT%H:%M:%S%.6f",
            TimeFormat::Iso => "%Y-%m-%dT%H:%M:%S",
            TimeFormat::SpaceMicros => "%Y-%m-%d %H:%M:%S%.6f",
            TimeFormat::Space => "%Y-%m-%d %H:%M:%S",
        }
    }

    pub fn carries_micros(self) -> bool {
        matches!(
            self,
            TimeFormat::IsoZuluMicros | TimeFormat::IsoMicros | TimeFormat::SpaceMicros
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn from_seconds(seconds: i64) -> Self {
        Self(seconds * MICROS_PER_SECOND)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub fn from_datetime(value: DateTime<Utc>) -> Self {
        Self(value.timestamp_micros())
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_micros(self.0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Parses a wire timestamp, trying each [`TimeFormat`] in order and
    /// falling back to RFC 3339 for offset-qualified values.
    pub fn parse(raw: &str) -> Result<Self, TimeParseError> {
        let value = raw.trim();
        for format in TimeFormat::ALL {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format.parse_pattern()) {
                return Ok(Self::from_datetime(parsed.and_utc()));
            }
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
            return Ok(Self::from_datetime(parsed.with_timezone(&Utc)));
        }
        Err(TimeParseError(raw.to_string()))
    }

    /// Like [`Timestamp::parse`], but empty or unparseable input is absent.
    pub fn parse_optional(raw: Option<&str>) -> Option<Self> {
        let raw = raw?.trim();
        if raw.is_empty() {
            return None;
        }
        Self::parse(raw).ok()
    }

    pub fn format(self, format: TimeFormat) -> String {
        self.to_datetime()
            .format(format.render_pattern())
            .to_string()
    }

    pub fn whole_seconds(self) -> i64 {
        self.0.div_euclid(MICROS_PER_SECOND)
    }

    pub fn floor_second(self) -> Self {
        Self::from_seconds(self.whole_seconds())
    }

    pub fn same_second(self, other: Timestamp) -> bool {
        self.whole_seconds() == other.whole_seconds()
    }

    /// Inclusive bounds of the integral second containing this timestamp.
    pub fn second_window(self) -> (Timestamp, Timestamp) {
        let start = self.floor_second();
        (start, Self(start.0 + MICROS_PER_SECOND - 1))
    }

    pub fn micros_since(self, earlier: Timestamp) -> i64 {
        self.0 - earlier.0
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(micros))
    }

    /// Decimal seconds with six fractional digits, e.g. `1371749517.939614`.
    pub fn to_decimal_string(self) -> String {
        format!(
            "{}.{:06}",
            self.whole_seconds(),
            self.0.rem_euclid(MICROS_PER_SECOND)
        )
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_decimal_string())
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self::from_datetime(value)
    }
}

/// Renders a microsecond difference as decimal seconds.
pub fn micros_to_decimal(micros: i64) -> String {
    Timestamp::from_micros(micros).to_decimal_string()
}
