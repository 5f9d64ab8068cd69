//! Time-windowed counters and the store contract.

mod cluster;
mod field;
mod local;
mod state;
mod store;

pub use cluster::{ClusterCounterStore, Contribution, PeerCounter, PeerView};
pub use field::{CounterField, FieldCounts};
pub use local::LocalCounterStore;
pub use state::{CounterSnapshot, CounterState, NO_LIMIT};
pub use store::{CounterError, CounterResult, CounterStore};
