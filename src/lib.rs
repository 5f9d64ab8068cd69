//! Tally - Time-Windowed Counter and Quota Engine
//!
//! This crate keeps named counters that accumulate per second, minute, hour,
//! day and calendar month, resetting each window when it rolls over. Counters
//! live in stores handed out by swappable providers: an in-process provider
//! and a cluster provider that shares counters between nodes over gossip.
//! Every timestamp is supplied by the caller, so results are reproducible.

pub mod config;
pub mod counter;
pub mod error;
pub mod mesh;
pub mod provider;
pub mod replay;
