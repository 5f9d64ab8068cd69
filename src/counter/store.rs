//! The counter store contract shared by local and cluster-backed stores.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::field::CounterField;
use super::state::CounterSnapshot;

/// Errors returned by counter store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CounterError {
    /// The update would have pushed the field of interest past its limit.
    #[error("Counter limit exceeded for {name}")]
    LimitExceeded { name: String },

    /// The backing store cannot serve the request (shut down, or its replica
    /// view is too stale to trust).
    #[error("Counter store unavailable for {name}: {reason}")]
    Unavailable { name: String, reason: String },
}

impl CounterError {
    /// Whether this is a limit rejection rather than a backend failure.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, CounterError::LimitExceeded { .. })
    }
}

/// Result type alias for counter store operations.
pub type CounterResult<T> = std::result::Result<T, CounterError>;

/// A name-keyed registry of counters with atomic per-name operations.
///
/// Operations on the same name are linearizable. Operations on different
/// names never block each other. Reads never roll buckets over, so a
/// snapshot can show a stale bucket until the next update to that name.
pub trait CounterStore: Send + Sync {
    /// Read a counter without creating it.
    fn query(&self, name: &str) -> CounterResult<Option<CounterSnapshot>>;

    /// Read a counter, creating a zeroed one if absent.
    fn get(&self, name: &str) -> CounterResult<CounterSnapshot>;

    /// Read one field of a counter, creating a zeroed one if absent.
    fn get_field(&self, name: &str, field: CounterField) -> CounterResult<i64>;

    /// Add `delta` to every field of `name` at `timestamp`.
    ///
    /// `field` is the field of interest; all five fields accumulate.
    fn update(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
    ) -> CounterResult<()>;

    /// Add `delta` unless `field` would end up above `limit`.
    fn update_with_limit(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
        limit: i64,
    ) -> CounterResult<()>;

    /// Update and return the value of `field` just before the update.
    fn get_and_update(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
    ) -> CounterResult<i64>;

    /// Limit-checked [`get_and_update`](Self::get_and_update).
    fn get_and_update_with_limit(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
        limit: i64,
    ) -> CounterResult<i64>;

    /// Update and return the value of `field` just after the update.
    fn update_and_get(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
    ) -> CounterResult<i64>;

    /// Limit-checked [`update_and_get`](Self::update_and_get).
    fn update_and_get_with_limit(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
        limit: i64,
    ) -> CounterResult<i64>;

    /// Replace `name` with a zeroed counter stamped at `at`.
    fn reset(&self, name: &str, at: DateTime<Utc>) -> CounterResult<()>;
}
