//! Half-open time ranges over UTC instants
//!
//! Every range in the billing pipeline is `[lo, hi)`. An absent upper bound
//! stands for `+infinity` (a resource that is still running, or a reference
//! version with no successor yet).

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Half-open `[lo, hi)` range; `hi == None` is unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub lo: DateTime<Utc>,
    pub hi: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// Bounded range
    pub fn new(lo: DateTime<Utc>, hi: DateTime<Utc>) -> Self {
        Self { lo, hi: Some(hi) }
    }

    /// Range open at the upper end
    pub fn open(lo: DateTime<Utc>) -> Self {
        Self { lo, hi: None }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.hi, Some(hi) if hi <= self.lo)
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.intersect(other).is_some()
    }

    /// Intersection, or `None` when the ranges share no instant
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let lo = self.lo.max(other.lo);
        let hi = min_upper(self.hi, other.hi);
        let range = TimeRange { lo, hi };
        if range.is_empty() {
            None
        } else {
            Some(range)
        }
    }

    /// Closes an unbounded range at `ceiling`
    pub fn close_at(&self, ceiling: DateTime<Utc>) -> TimeRange {
        TimeRange {
            lo: self.lo,
            hi: Some(self.hi.unwrap_or(ceiling)),
        }
    }

    /// Exact length in seconds (microsecond precision), `None` when unbounded
    pub fn seconds(&self) -> Option<Decimal> {
        let hi = self.hi?;
        let micros = hi.timestamp_micros() - self.lo.timestamp_micros();
        Some(Decimal::new(micros.max(0), 6))
    }
}

/// Smaller of two upper bounds where `None` is `+infinity`
pub fn min_upper(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// Parses `epoch`, `YYYY-MM-DD`, RFC 3339, or a naive `YYYY-MM-DDTHH:MM[:SS]` (read as UTC)
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("epoch") {
        return Some(epoch());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    // "2000-01-01T00:00Z" style values appear in hand-written configuration
    if let Some(stripped) = value.strip_suffix('Z') {
        if let Ok(dt) = NaiveDateTime::parse_from_str(stripped, "%Y-%m-%dT%H:%M") {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    None
}

/// 1970-01-01T00:00:00Z
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// First instant of the month containing `t`
pub fn month_start(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(t)
}

/// First instant of the month after the one containing `t`
pub fn next_month_start(t: DateTime<Utc>) -> DateTime<Utc> {
    let start = month_start(t);
    start.checked_add_months(Months::new(1)).unwrap_or(start)
}

pub fn is_month_start(t: DateTime<Utc>) -> bool {
    t.day() == 1 && is_day_start(t)
}

pub fn is_day_start(t: DateTime<Utc>) -> bool {
    t.hour() == 0 && t.minute() == 0 && t.second() == 0 && t.nanosecond() == 0
}

/// Microseconds since the Unix epoch, the storage representation of instants
pub fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Renders an instant as `2001-01-01T00:00:00+00:00`
pub fn format_instant(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

/// Renders a date-only value as `2001-01-01`
pub fn format_date(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d").to_string()
}

/// Serde adapter writing instants with an explicit `+00:00` offset
pub mod instant_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(t: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_instant(t))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        super::parse_instant(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid instant: {value}")))
    }
}
