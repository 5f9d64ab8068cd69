//! Peer mesh networking module using Chitchat.
//!
//! This module implements the peer-to-peer mesh used to replicate counter
//! state between gateway nodes. It uses the chitchat library for
//! gossip-based cluster membership and key/value dissemination.

mod cluster;

pub use cluster::{
    Cluster, ClusterConfig, ClusterError, CounterKey, PeerEntry, KEY_PREFIX,
};
