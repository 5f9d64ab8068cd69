//! Single-node, in-memory counter store.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::field::CounterField;
use super::state::{CounterSnapshot, CounterState};
use super::store::{CounterResult, CounterStore};

/// In-memory [`CounterStore`].
///
/// Counters live in a sharded concurrent map; each operation runs under the
/// lock of the shard holding its name, so updates to one name are serialized
/// while other names proceed independently.
#[derive(Debug, Default)]
pub struct LocalCounterStore {
    /// Store name, used for logging
    name: String,
    /// Counter state indexed by counter name
    counters: DashMap<String, CounterState>,
}

impl LocalCounterStore {
    /// Create an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counters: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of counters materialized so far.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Run `f` against the state for `counter`, creating it first if absent.
    ///
    /// This is the only path that mutates state.
    fn with_counter<R>(&self, counter: &str, f: impl FnOnce(&mut CounterState) -> R) -> R {
        if let Some(mut state) = self.counters.get_mut(counter) {
            return f(&mut *state);
        }

        let mut state = self.counters.entry(counter.to_string()).or_insert_with(|| {
            debug!(store = %self.name, counter = %counter, "Creating counter");
            CounterState::new(counter)
        });
        f(&mut *state)
    }
}

impl CounterStore for LocalCounterStore {
    fn query(&self, name: &str) -> CounterResult<Option<CounterSnapshot>> {
        Ok(self.counters.get(name).map(|state| state.snapshot()))
    }

    fn get(&self, name: &str) -> CounterResult<CounterSnapshot> {
        Ok(self.with_counter(name, |state| state.snapshot()))
    }

    fn get_field(&self, name: &str, field: CounterField) -> CounterResult<i64> {
        Ok(self.with_counter(name, |state| state.get(field)))
    }

    fn update(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
    ) -> CounterResult<()> {
        trace!(store = %self.name, counter = %name, field = %field, delta = delta, "Updating counter");
        self.with_counter(name, |state| state.apply_update(timestamp, delta));
        Ok(())
    }

    fn update_with_limit(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
        limit: i64,
    ) -> CounterResult<()> {
        self.with_counter(name, |state| {
            state.apply_update_with_limit(field, timestamp, delta, limit)
        })
        .inspect_err(|_| {
            debug!(store = %self.name, counter = %name, field = %field, limit = limit, "Counter limit exceeded");
        })
    }

    fn get_and_update(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
    ) -> CounterResult<i64> {
        Ok(self.with_counter(name, |state| {
            let before = state.get(field);
            state.apply_update(timestamp, delta);
            before
        }))
    }

    fn get_and_update_with_limit(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
        limit: i64,
    ) -> CounterResult<i64> {
        self.with_counter(name, |state| {
            let before = state.get(field);
            state
                .apply_update_with_limit(field, timestamp, delta, limit)
                .map(|()| before)
        })
    }

    fn update_and_get(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
    ) -> CounterResult<i64> {
        Ok(self.with_counter(name, |state| {
            state.apply_update(timestamp, delta);
            state.get(field)
        }))
    }

    fn update_and_get_with_limit(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
        limit: i64,
    ) -> CounterResult<i64> {
        self.with_counter(name, |state| {
            state
                .apply_update_with_limit(field, timestamp, delta, limit)
                .map(|()| state.get(field))
        })
    }

    fn reset(&self, name: &str, at: DateTime<Utc>) -> CounterResult<()> {
        debug!(store = %self.name, counter = %name, at = %at, "Resetting counter");
        self.counters
            .insert(name.to_string(), CounterState::zeroed_at(name, at));
        Ok(())
    }
}
