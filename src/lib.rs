//! Cluster monitor for the Shoal distributed object store.
//!
//! Each monitor is one peer in a small, statically configured cluster. The
//! peers discover each other by probing, elect a leader, and replicate a set
//! of per-service logs through a Paxos ring layered over an ordered key/value
//! store. A peer that has fallen too far behind is brought back by bulk state
//! transfer rather than log replay.

pub mod clock;
pub mod config;
pub mod elector;
pub mod encoding;
pub mod error;
pub mod messages;
pub mod monitor;
pub mod monmap;
pub mod network;
pub mod paxos;
pub mod service;
pub mod session;
pub mod store;
pub mod sync;
pub mod timer;

pub use crate::error::{Error, Result};
pub use crate::monmap::Rank;

/// Per-service sequence number of a committed log entry.
pub type Version = u64;
