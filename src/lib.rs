#![forbid(unsafe_code)]

//! kvmesh: an eventually-consistent, gossip-style key-value store for
//! routing control planes. Each node hosts independent areas; every area
//! replica converges with its peers through a bootstrap three-way
//! full-sync and incremental flooded updates afterwards.

mod area;
pub mod config;
pub mod core;
pub mod counters;
mod error;
mod flood;
mod kvstore;
pub mod net;
mod peer;
mod queue;
pub mod store;
pub mod telemetry;

pub use crate::area::AreaSummary;
pub use crate::config::{BackoffConfig, Config, ConfigError, PeerSpec};
pub use crate::core::{
    identity_ordering, merge, merge_winner, AreaId, MergeOutcome, NodeId, Ttl, ValueHash,
    VersionedValue,
};
pub use crate::error::StoreError;
pub use crate::kvstore::{KvStore, StartError};
pub use crate::peer::{next_state, Backoff, PeerEvent, PeerState, PeerStatus};
pub use crate::queue::{Publication, PublicationQueue, RecvError, StoreUpdate, UpdateReader};
pub use crate::store::KeyDumpFilter;
