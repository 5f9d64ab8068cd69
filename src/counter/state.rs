//! Per-name counter state: bucket rollover and overflow-safe accumulation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::field::{CounterField, FieldCounts};
use super::store::CounterError;

/// The mutable state behind one named counter.
///
/// Only a store mutates a `CounterState`; callers receive [`CounterSnapshot`]
/// copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    name: String,
    last_update_time: DateTime<Utc>,
    counts: FieldCounts,
}

impl CounterState {
    /// A zeroed counter stamped at the Unix epoch.
    pub fn new(name: impl Into<String>) -> Self {
        Self::zeroed_at(name, DateTime::<Utc>::UNIX_EPOCH)
    }

    /// A zeroed counter stamped at `at`.
    pub fn zeroed_at(name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            last_update_time: at,
            counts: FieldCounts::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_update_time(&self) -> DateTime<Utc> {
        self.last_update_time
    }

    /// Current value of `field`. No rollover is applied.
    pub fn get(&self, field: CounterField) -> i64 {
        self.counts.get(field)
    }

    pub fn counts(&self) -> FieldCounts {
        self.counts
    }

    /// The field values as they would read after rolling over to `timestamp`.
    pub fn counts_at(&self, timestamp: DateTime<Utc>) -> FieldCounts {
        let mut counts = self.counts;
        for field in CounterField::ALL {
            if !field.same_bucket(self.last_update_time, timestamp) {
                *counts.get_mut(field) = 0;
            }
        }
        counts
    }

    /// Add `delta` to every field, rolling stale buckets over first.
    pub fn apply_update(&mut self, timestamp: DateTime<Utc>, delta: i64) {
        self.roll_over(timestamp);
        self.accumulate(timestamp, delta);
    }

    /// Like [`apply_update`](Self::apply_update), but rejects the whole update
    /// when `field` would end up above `limit`.
    ///
    /// Rollover resets are kept on rejection; nothing else changes.
    pub fn apply_update_with_limit(
        &mut self,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
        limit: i64,
    ) -> Result<(), CounterError> {
        self.roll_over(timestamp);

        if exceeds(self.counts.get(field), delta, limit) {
            return Err(CounterError::LimitExceeded {
                name: self.name.clone(),
            });
        }

        self.accumulate(timestamp, delta);
        Ok(())
    }

    /// Immutable copy for callers.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            name: self.name.clone(),
            counts: self.counts,
            last_update_time: self.last_update_time,
        }
    }

    pub(crate) fn from_parts(
        name: impl Into<String>,
        counts: FieldCounts,
        last_update_time: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            last_update_time,
            counts,
        }
    }

    pub(crate) fn roll_over(&mut self, timestamp: DateTime<Utc>) {
        self.counts = self.counts_at(timestamp);
    }

    fn accumulate(&mut self, timestamp: DateTime<Utc>, delta: i64) {
        for field in CounterField::ALL {
            let value = self.counts.get_mut(field);
            match value.checked_add(delta) {
                Some(next) => *value = next,
                None => {
                    warn!(
                        counter = %self.name,
                        field = %field,
                        value = *value,
                        delta = delta,
                        "Counter field overflow, value left unchanged"
                    );
                }
            }
        }
        self.last_update_time = timestamp;
    }
}

/// Limit value that disables the check in limit-aware operations.
pub const NO_LIMIT: i64 = -1;

/// Whether `value + delta` is strictly greater than `limit`, without overflow.
/// [`NO_LIMIT`] is never exceeded.
pub(crate) fn exceeds(value: i64, delta: i64, limit: i64) -> bool {
    if limit == NO_LIMIT {
        return false;
    }
    i128::from(value) + i128::from(delta) > i128::from(limit)
}

/// An immutable copy of a counter, as handed out by stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    name: String,
    counts: FieldCounts,
    last_update_time: DateTime<Utc>,
}

impl CounterSnapshot {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, field: CounterField) -> i64 {
        self.counts.get(field)
    }

    pub fn counts(&self) -> FieldCounts {
        self.counts
    }

    pub fn last_update_time(&self) -> DateTime<Utc> {
        self.last_update_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 14, 10, 20, 30).unwrap()
    }

    #[test]
    fn test_new_state_is_zeroed() {
        let state = CounterState::new("fresh");
        assert_eq!(state.name(), "fresh");
        assert_eq!(state.counts(), FieldCounts::default());
        assert_eq!(state.last_update_time(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_updates_within_bucket_accumulate() {
        let mut state = CounterState::new("loginAttempts");
        let start = t0();
        for ms in [0, 200, 400] {
            state.apply_update(start + Duration::milliseconds(ms), 1);
        }
        assert_eq!(state.get(CounterField::Second), 3);
        assert_eq!(state.get(CounterField::Minute), 3);
        assert_eq!(state.get(CounterField::Hour), 3);
    }

    #[test]
    fn test_rollover_is_per_field() {
        let mut state = CounterState::new("loginAttempts");
        let start = t0();
        for _ in 0..3 {
            state.apply_update(start, 1);
        }
        state.apply_update(start + Duration::seconds(61), 1);

        assert_eq!(state.get(CounterField::Second), 1);
        assert_eq!(state.get(CounterField::Minute), 1);
        assert_eq!(state.get(CounterField::Hour), 4);
        assert_eq!(state.get(CounterField::Day), 4);
        assert_eq!(state.get(CounterField::Month), 4);
        assert_eq!(state.last_update_time(), start + Duration::seconds(61));
    }

    #[test]
    fn test_month_rollover_clears_everything() {
        let mut state = CounterState::new("monthly");
        state.apply_update(Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap(), 5);
        state.apply_update(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(), 2);
        for field in CounterField::ALL {
            assert_eq!(state.get(field), 2, "{field} should have rolled over");
        }
    }

    #[test]
    fn test_limit_rejection_leaves_fields_untouched() {
        let mut state = CounterState::new("quota");
        state.apply_update(t0(), 2);

        let result = state.apply_update_with_limit(CounterField::Minute, t0(), 5, 4);
        assert!(matches!(result, Err(CounterError::LimitExceeded { ref name }) if name == "quota"));
        assert_eq!(state.get(CounterField::Minute), 2);
        assert_eq!(state.get(CounterField::Second), 2);
        assert_eq!(state.last_update_time(), t0());

        state
            .apply_update_with_limit(CounterField::Minute, t0(), 2, 4)
            .unwrap();
        for field in CounterField::ALL {
            assert_eq!(state.get(field), 4);
        }
    }

    #[test]
    fn test_limit_rejection_keeps_rollover_resets() {
        let mut state = CounterState::new("quota");
        state.apply_update(t0(), 3);

        let later = t0() + Duration::seconds(2);
        let result = state.apply_update_with_limit(CounterField::Hour, later, 2, 4);
        assert!(result.is_err());

        // Second rolled over and stays cleared, the hour bucket is intact.
        assert_eq!(state.get(CounterField::Second), 0);
        assert_eq!(state.get(CounterField::Hour), 3);
        assert_eq!(state.last_update_time(), t0());
    }

    #[test]
    fn test_limit_is_inclusive() {
        let mut state = CounterState::new("quota");
        assert!(state
            .apply_update_with_limit(CounterField::Second, t0(), 4, 4)
            .is_ok());
        assert!(state
            .apply_update_with_limit(CounterField::Second, t0(), 1, 4)
            .is_err());
    }

    #[test]
    fn test_overflow_leaves_value_unchanged() {
        let mut state = CounterState::new("big");
        state.apply_update(t0(), i64::MAX - 1);
        state.apply_update(t0(), 5);
        assert_eq!(state.get(CounterField::Second), i64::MAX - 1);

        state.apply_update(t0(), 1);
        assert_eq!(state.get(CounterField::Second), i64::MAX);
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_overflow_emits_warning() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let mut state = CounterState::new("big");
        tracing::subscriber::with_default(subscriber, || {
            state.apply_update(t0(), i64::MAX);
            state.apply_update(t0(), 1);
        });

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("WARN"), "missing warning in {output:?}");
        assert!(output.contains("Counter field overflow"));
        assert!(output.contains("counter=big"));
        assert_eq!(output.matches("Counter field overflow").count(), 5);
    }

    #[test]
    fn test_no_overflow_no_warning() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let mut state = CounterState::new("small");
        tracing::subscriber::with_default(subscriber, || state.apply_update(t0(), 1));
        assert!(logs.0.lock().is_empty());
    }

    #[test]
    fn test_no_limit_sentinel_is_never_exceeded() {
        let mut state = CounterState::new("open");
        state.apply_update(t0(), 100);
        assert!(state
            .apply_update_with_limit(CounterField::Second, t0(), 1, NO_LIMIT)
            .is_ok());
        assert_eq!(state.get(CounterField::Second), 101);

        // Other negative limits still reject.
        assert!(state
            .apply_update_with_limit(CounterField::Second, t0(), 1, -2)
            .is_err());
    }

    #[test]
    fn test_underflow_leaves_value_unchanged() {
        let mut state = CounterState::new("small");
        state.apply_update(t0(), i64::MIN);
        state.apply_update(t0(), -1);
        assert_eq!(state.get(CounterField::Day), i64::MIN);
    }

    #[test]
    fn test_limit_check_does_not_overflow() {
        let mut state = CounterState::new("big");
        state.apply_update(t0(), i64::MAX);
        let result = state.apply_update_with_limit(CounterField::Second, t0(), 1, i64::MAX);
        assert!(result.is_err());
        assert!(!exceeds(i64::MIN, -1, 0));
    }

    #[test]
    fn test_out_of_order_timestamp_is_accepted() {
        let mut state = CounterState::new("skewed");
        state.apply_update(t0(), 1);
        let earlier = t0() - Duration::seconds(5);
        state.apply_update(earlier, 1);
        assert_eq!(state.last_update_time(), earlier);
        assert_eq!(state.get(CounterField::Second), 1);
        assert_eq!(state.get(CounterField::Minute), 2);
    }

    #[test]
    fn test_counts_at_does_not_mutate() {
        let mut state = CounterState::new("peek");
        state.apply_update(t0(), 3);
        let rolled = state.counts_at(t0() + Duration::hours(1));
        assert_eq!(rolled.hour, 0);
        assert_eq!(rolled.day, 3);
        assert_eq!(state.get(CounterField::Hour), 3);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut state = CounterState::new("copy");
        state.apply_update(t0(), 1);
        let snapshot = state.snapshot();
        state.apply_update(t0(), 1);
        assert_eq!(snapshot.get(CounterField::Second), 1);
        assert_eq!(snapshot.name(), "copy");
        assert_eq!(snapshot.last_update_time(), t0());
    }
}
