//! Cluster-replicated counter store.
//!
//! Every node owns its contribution to each counter and mutates it exactly
//! like the local store does. The value callers observe is the merge of
//! this node's contribution with the last gossiped contributions of its
//! peers. Limit checks run against that merged view, so two nodes racing on
//! the same counter can jointly overshoot a limit by up to one gossip
//! round.
//!
//! Resets are ordered by generation, not by timestamp. A reset bumps the
//! counter's generation; a node that sees a newer generation from a peer
//! zeroes its own contribution and joins it. Only contributions of the
//! newest known generation are merged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::field::{CounterField, FieldCounts};
use super::state::{exceeds, CounterSnapshot, CounterState};
use super::store::{CounterError, CounterResult, CounterStore};

/// One node's share of a counter, as gossiped between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    /// Number of resets this contribution has seen
    pub generation: u64,
    pub state: CounterState,
}

impl Contribution {
    fn new(name: &str) -> Self {
        Self {
            generation: 0,
            state: CounterState::new(name),
        }
    }

    /// Zero this contribution and move it to `generation` if that is newer.
    fn adopt(&mut self, generation: u64) -> bool {
        if generation <= self.generation {
            return false;
        }
        self.state = CounterState::zeroed_at(self.state.name(), self.state.last_update_time());
        self.generation = generation;
        true
    }
}

/// Peer contributions for one counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerCounter {
    /// One contribution per peer node
    pub contributions: Vec<Contribution>,
}

impl PeerCounter {
    /// Newest generation any peer has announced.
    pub fn generation(&self) -> u64 {
        self.contributions
            .iter()
            .map(|c| c.generation)
            .max()
            .unwrap_or(0)
    }
}

/// Everything this node currently knows about its peers, per counter name.
pub type PeerView = HashMap<String, PeerCounter>;

/// A [`CounterStore`] whose counters are shared with peer nodes.
///
/// The store itself never touches the network; a provider drains its
/// [`publications`](Self::drain_publications) and feeds it peer state with
/// [`install_peer_view`](Self::install_peer_view).
#[derive(Debug)]
pub struct ClusterCounterStore {
    /// Store name
    name: String,
    /// This node's contributions
    own: DashMap<String, Contribution>,
    /// Counters whose contribution changed since the last publication
    dirty: DashSet<String>,
    /// Last known peer contributions
    peers: DashMap<String, PeerCounter>,
    /// Reference point for `last_sync_ms`
    created: Instant,
    /// When peer state was last installed, in milliseconds since `created`
    last_sync_ms: AtomicU64,
    /// Maximum age of the peer view before operations fail
    staleness_threshold: Duration,
    closed: AtomicBool,
}

impl ClusterCounterStore {
    /// Create an empty store with no peer state.
    pub fn new(name: impl Into<String>, staleness_threshold: Duration) -> Self {
        Self {
            name: name.into(),
            own: DashMap::new(),
            dirty: DashSet::new(),
            peers: DashMap::new(),
            created: Instant::now(),
            last_sync_ms: AtomicU64::new(0),
            staleness_threshold,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Refuse every further operation with [`CounterError::Unavailable`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Take every contribution changed since the last call.
    pub fn drain_publications(&self) -> Vec<Contribution> {
        let names: Vec<String> = self.dirty.iter().map(|name| name.key().clone()).collect();
        let mut publications = Vec::with_capacity(names.len());

        for name in names {
            self.dirty.remove(&name);
            if let Some(own) = self.own.get(&name) {
                publications.push(own.clone());
            }
        }

        publications
    }

    /// Mark every contribution for republication, e.g. after a failed sync.
    pub fn mark_all_dirty(&self) {
        for entry in self.own.iter() {
            self.dirty.insert(entry.key().clone());
        }
    }

    /// Replace the peer view counter by counter and join any newer reset
    /// generation announced by peers.
    pub fn install_peer_view(&self, view: PeerView) {
        self.peers.retain(|name, _| view.contains_key(name));

        for (name, peer) in view {
            let generation = peer.generation();
            self.peers.insert(name.clone(), peer);

            let adopted = match self.own.get_mut(&name) {
                Some(mut own) => own.adopt(generation),
                None => false,
            };
            if adopted {
                debug!(store = %self.name, counter = %name, generation, "Adopting peer reset");
                self.dirty.insert(name);
            }
        }

        self.last_sync_ms.store(self.elapsed_ms(), Ordering::SeqCst);
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn ensure_available(&self, counter: &str) -> CounterResult<()> {
        if self.is_closed() {
            return Err(CounterError::Unavailable {
                name: counter.to_string(),
                reason: "store has been shut down".to_string(),
            });
        }

        let age_ms = self
            .elapsed_ms()
            .saturating_sub(self.last_sync_ms.load(Ordering::SeqCst));
        if u128::from(age_ms) > self.staleness_threshold.as_millis() {
            return Err(CounterError::Unavailable {
                name: counter.to_string(),
                reason: format!("replica view is {}ms old", age_ms),
            });
        }

        Ok(())
    }

    /// Run `f` against this node's contribution to `counter` together with the
    /// peers' contributions, creating the local one first if absent.
    ///
    /// The local contribution is brought up to the newest peer generation
    /// before `f` runs, so it always belongs to the merged set.
    fn with_counter<R>(
        &self,
        counter: &str,
        f: impl FnOnce(&mut Contribution, Option<&PeerCounter>) -> R,
    ) -> CounterResult<R> {
        self.ensure_available(counter)?;

        let mut own = self
            .own
            .entry(counter.to_string())
            .or_insert_with(|| {
                debug!(store = %self.name, counter = %counter, "Creating counter");
                Contribution::new(counter)
            });
        let peer_entry = self.peers.get(counter);
        let peer = peer_entry.as_deref();

        if own.adopt(peer.map_or(0, PeerCounter::generation)) {
            self.dirty.insert(counter.to_string());
        }
        Ok(f(&mut *own, peer))
    }
}

/// Contributions of the newest generation known for a counter.
fn live_contributions<'a>(
    own: Option<&'a Contribution>,
    peer: Option<&'a PeerCounter>,
) -> Vec<&'a CounterState> {
    let generation = own
        .map(|c| c.generation)
        .max(peer.map(PeerCounter::generation))
        .unwrap_or(0);

    own.into_iter()
        .chain(peer.into_iter().flat_map(|p| p.contributions.iter()))
        .filter(|c| c.generation == generation)
        .map(|c| &c.state)
        .collect()
}

/// Sum each field over the contributions whose bucket matches `reference`.
fn merge_at(contributions: &[&CounterState], reference: DateTime<Utc>) -> FieldCounts {
    let mut merged = FieldCounts::default();
    for field in CounterField::ALL {
        let total = merged.get_mut(field);
        for state in contributions {
            if field.same_bucket(state.last_update_time(), reference) {
                *total = total.saturating_add(state.get(field));
            }
        }
    }
    merged
}

/// The merged view as a reader sees it: anchored at the newest contribution.
fn merged_state(name: &str, own: Option<&Contribution>, peer: Option<&PeerCounter>) -> CounterState {
    let contributions = live_contributions(own, peer);
    let reference = contributions
        .iter()
        .map(|state| state.last_update_time())
        .max()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    CounterState::from_parts(name, merge_at(&contributions, reference), reference)
}

/// Sum of `field` over current-generation peer contributions that fall into
/// `timestamp`'s bucket.
fn peer_total_at(
    own: &Contribution,
    peer: Option<&PeerCounter>,
    field: CounterField,
    timestamp: DateTime<Utc>,
) -> i64 {
    peer.into_iter()
        .flat_map(|p| p.contributions.iter())
        .filter(|c| c.generation == own.generation)
        .filter(|c| field.same_bucket(c.state.last_update_time(), timestamp))
        .fold(0i64, |total, c| total.saturating_add(c.state.get(field)))
}

fn apply_limited(
    own: &mut Contribution,
    peer: Option<&PeerCounter>,
    field: CounterField,
    timestamp: DateTime<Utc>,
    delta: i64,
    limit: i64,
) -> CounterResult<()> {
    own.state.roll_over(timestamp);
    let current = own
        .state
        .get(field)
        .saturating_add(peer_total_at(own, peer, field, timestamp));

    if exceeds(current, delta, limit) {
        return Err(CounterError::LimitExceeded {
            name: own.state.name().to_string(),
        });
    }

    own.state.apply_update(timestamp, delta);
    Ok(())
}

fn merged_field_at(own: &Contribution, peer: Option<&PeerCounter>, field: CounterField, timestamp: DateTime<Utc>) -> i64 {
    let contributions = live_contributions(Some(own), peer);
    merge_at(&contributions, timestamp).get(field)
}

impl CounterStore for ClusterCounterStore {
    fn query(&self, name: &str) -> CounterResult<Option<CounterSnapshot>> {
        self.ensure_available(name)?;

        let own = self.own.get(name);
        let peer = self.peers.get(name);
        if own.is_none() && peer.is_none() {
            return Ok(None);
        }

        Ok(Some(merged_state(name, own.as_deref(), peer.as_deref()).snapshot()))
    }

    fn get(&self, name: &str) -> CounterResult<CounterSnapshot> {
        self.with_counter(name, |own, peer| {
            merged_state(name, Some(own), peer).snapshot()
        })
    }

    fn get_field(&self, name: &str, field: CounterField) -> CounterResult<i64> {
        self.with_counter(name, |own, peer| merged_state(name, Some(own), peer).get(field))
    }

    fn update(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
    ) -> CounterResult<()> {
        trace!(store = %self.name, counter = %name, field = %field, delta = delta, "Updating replicated counter");
        self.with_counter(name, |own, _| own.state.apply_update(timestamp, delta))?;
        self.dirty.insert(name.to_string());
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
        let result = self.with_counter(name, |own, peer| {
            apply_limited(own, peer, field, timestamp, delta, limit)
        })?;
        self.dirty.insert(name.to_string());
        result.inspect_err(|_| {
            debug!(store = %self.name, counter = %name, field = %field, limit = limit, "Replicated counter limit exceeded");
        })
    }

    fn get_and_update(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
    ) -> CounterResult<i64> {
        let before = self.with_counter(name, |own, peer| {
            let before = merged_state(name, Some(own), peer).get(field);
            own.state.apply_update(timestamp, delta);
            before
        })?;
        self.dirty.insert(name.to_string());
        Ok(before)
    }

    fn get_and_update_with_limit(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
        limit: i64,
    ) -> CounterResult<i64> {
        let result = self.with_counter(name, |own, peer| {
            let before = merged_state(name, Some(own), peer).get(field);
            apply_limited(own, peer, field, timestamp, delta, limit).map(|()| before)
        })?;
        self.dirty.insert(name.to_string());
        result
    }

    fn update_and_get(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
    ) -> CounterResult<i64> {
        let after = self.with_counter(name, |own, peer| {
            own.state.apply_update(timestamp, delta);
            merged_field_at(own, peer, field, timestamp)
        })?;
        self.dirty.insert(name.to_string());
        Ok(after)
    }

    fn update_and_get_with_limit(
        &self,
        name: &str,
        field: CounterField,
        timestamp: DateTime<Utc>,
        delta: i64,
        limit: i64,
    ) -> CounterResult<i64> {
        let result = self.with_counter(name, |own, peer| {
            apply_limited(own, peer, field, timestamp, delta, limit)
                .map(|()| merged_field_at(own, peer, field, timestamp))
        })?;
        self.dirty.insert(name.to_string());
        result
    }

    fn reset(&self, name: &str, at: DateTime<Utc>) -> CounterResult<()> {
        let generation = self.with_counter(name, |own, _| {
            own.state = CounterState::zeroed_at(name, at);
            own.generation += 1;
            own.generation
        })?;
        debug!(store = %self.name, counter = %name, at = %at, generation, "Resetting replicated counter");
        self.dirty.insert(name.to_string());
        Ok(())
    }
}
