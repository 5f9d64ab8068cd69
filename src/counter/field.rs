//! Counter fields and their time buckets.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// One of the rolling windows a counter accumulates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterField {
    /// Per-second bucket
    #[serde(alias = "sec")]
    Second,
    /// Per-minute bucket
    #[serde(alias = "min")]
    Minute,
    /// Per-hour bucket
    #[serde(alias = "hr")]
    Hour,
    /// Per-day bucket (UTC days)
    Day,
    /// Per-calendar-month bucket (UTC)
    Month,
}

impl CounterField {
    /// Every field, finest granularity first.
    pub const ALL: [CounterField; 5] = [
        CounterField::Second,
        CounterField::Minute,
        CounterField::Hour,
        CounterField::Day,
        CounterField::Month,
    ];

    /// Fixed bucket width in seconds, or `None` for the calendar month.
    pub fn bucket_secs(&self) -> Option<i64> {
        match self {
            CounterField::Second => Some(1),
            CounterField::Minute => Some(60),
            CounterField::Hour => Some(3_600),
            CounterField::Day => Some(86_400),
            CounterField::Month => None,
        }
    }

    /// Whether `a` and `b` fall into the same bucket for this field.
    pub fn same_bucket(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        match self.bucket_secs() {
            Some(width) => {
                a.timestamp().div_euclid(width) == b.timestamp().div_euclid(width)
            }
            None => a.year() == b.year() && a.month() == b.month(),
        }
    }

    /// Short lowercase name, as used in configuration and replay scripts.
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterField::Second => "second",
            CounterField::Minute => "minute",
            CounterField::Hour => "hour",
            CounterField::Day => "day",
            CounterField::Month => "month",
        }
    }
}

impl fmt::Display for CounterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CounterField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "second" | "sec" => Ok(CounterField::Second),
            "minute" | "min" => Ok(CounterField::Minute),
            "hour" | "hr" => Ok(CounterField::Hour),
            "day" => Ok(CounterField::Day),
            "month" => Ok(CounterField::Month),
            other => Err(format!("unknown counter field: {other}")),
        }
    }
}

/// The five per-field values of a counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldCounts {
    pub second: i64,
    pub minute: i64,
    pub hour: i64,
    pub day: i64,
    pub month: i64,
}

impl FieldCounts {
    /// Read one field.
    pub fn get(&self, field: CounterField) -> i64 {
        match field {
            CounterField::Second => self.second,
            CounterField::Minute => self.minute,
            CounterField::Hour => self.hour,
            CounterField::Day => self.day,
            CounterField::Month => self.month,
        }
    }

    pub(crate) fn get_mut(&mut self, field: CounterField) -> &mut i64 {
        match field {
            CounterField::Second => &mut self.second,
            CounterField::Minute => &mut self.minute,
            CounterField::Hour => &mut self.hour,
            CounterField::Day => &mut self.day,
            CounterField::Month => &mut self.month,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_bucket_widths() {
        assert_eq!(CounterField::Second.bucket_secs(), Some(1));
        assert_eq!(CounterField::Minute.bucket_secs(), Some(60));
        assert_eq!(CounterField::Hour.bucket_secs(), Some(3600));
        assert_eq!(CounterField::Day.bucket_secs(), Some(86400));
        assert_eq!(CounterField::Month.bucket_secs(), None);
    }

    #[test]
    fn test_same_second_ignores_millis() {
        let a = at(2024, 3, 10, 12, 0, 5);
        let b = a + chrono::Duration::milliseconds(999);
        assert!(CounterField::Second.same_bucket(a, b));
        assert!(!CounterField::Second.same_bucket(a, b + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn test_minute_boundary() {
        let a = at(2024, 3, 10, 12, 0, 59);
        let b = at(2024, 3, 10, 12, 1, 0);
        assert!(!CounterField::Minute.same_bucket(a, b));
        assert!(CounterField::Hour.same_bucket(a, b));
    }

    #[test]
    fn test_same_minute_different_hour_is_not_same_bucket() {
        // Equal minute-of-hour an hour apart must still roll over.
        let a = at(2024, 3, 10, 12, 30, 0);
        let b = at(2024, 3, 10, 13, 30, 0);
        assert!(!CounterField::Minute.same_bucket(a, b));
        assert!(!CounterField::Hour.same_bucket(a, b));
        assert!(CounterField::Day.same_bucket(a, b));
    }

    #[test]
    fn test_month_uses_calendar() {
        let a = at(2024, 1, 1, 0, 0, 0);
        let b = at(2024, 1, 31, 23, 59, 59);
        let c = at(2024, 2, 1, 0, 0, 0);
        let d = at(2025, 1, 15, 0, 0, 0);
        assert!(CounterField::Month.same_bucket(a, b));
        assert!(!CounterField::Month.same_bucket(b, c));
        assert!(!CounterField::Month.same_bucket(a, d));
    }

    #[test]
    fn test_pre_epoch_buckets_floor() {
        let a = Utc.timestamp_opt(-1, 0).unwrap();
        let b = Utc.timestamp_opt(0, 0).unwrap();
        assert!(!CounterField::Second.same_bucket(a, b));
        assert!(!CounterField::Minute.same_bucket(a, b));
    }

    #[test]
    fn test_field_parsing() {
        assert_eq!("sec".parse::<CounterField>().unwrap(), CounterField::Second);
        assert_eq!("MONTH".parse::<CounterField>().unwrap(), CounterField::Month);
        assert!("week".parse::<CounterField>().is_err());
    }

    #[test]
    fn test_field_counts_accessors() {
        let mut counts = FieldCounts::default();
        *counts.get_mut(CounterField::Hour) = 7;
        assert_eq!(counts.get(CounterField::Hour), 7);
        assert_eq!(counts.hour, 7);
        assert_eq!(counts.get(CounterField::Day), 0);
    }
}
