//! Keys this node authored: refresh scheduling and version adoption.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::core::{NodeId, Ttl, VersionedValue};

const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct SelfKey {
    /// Version this node last authored for the key.
    authored_version: u64,
    ttl: Ttl,
    next_refresh: Option<Instant>,
    /// Highest version observed from another originator. A restarted node
    /// learns through sync that its old advertisements are still out
    /// there; the next authoring must climb above them.
    observed_version: u64,
}

/// Registry of self-originated keys for one area.
pub struct SelfOriginatedManager {
    node_id: NodeId,
    keys: BTreeMap<String, SelfKey>,
}

impl SelfOriginatedManager {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            keys: BTreeMap::new(),
        }
    }

    /// Record a locally-set key. Only records authored by this node are
    /// tracked; everything else is a passthrough.
    pub fn note_local_set(&mut self, key: &str, record: &VersionedValue, now: Instant) {
        if record.originator != self.node_id {
            return;
        }
        let next_refresh = refresh_deadline(now, record.ttl);
        let entry = self.keys.entry(key.to_string()).or_insert(SelfKey {
            authored_version: record.version,
            ttl: record.ttl,
            next_refresh,
            observed_version: 0,
        });
        entry.authored_version = entry.authored_version.max(record.version);
        entry.ttl = record.ttl;
        entry.next_refresh = next_refresh;
    }

    /// Record that a peer advertised `version` for one of our keys under a
    /// foreign originator (or a stale copy of us).
    pub fn note_foreign_version(&mut self, key: &str, version: u64) {
        if let Some(entry) = self.keys.get_mut(key) {
            entry.observed_version = entry.observed_version.max(version);
        }
    }

    /// The version the next local authoring of `key` must carry to stay
    /// strictly above everything already circulating.
    pub fn next_author_version(&self, key: &str, requested: u64) -> u64 {
        match self.keys.get(key) {
            Some(entry) => requested.max(entry.observed_version.saturating_add(1)),
            None => requested,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) {
        self.keys.remove(key);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Keys whose refresh deadline has passed.
    pub fn due_refreshes(&self, now: Instant) -> Vec<String> {
        self.keys
            .iter()
            .filter(|(_, entry)| entry.next_refresh.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn on_refreshed(&mut self, key: &str, now: Instant) {
        if let Some(entry) = self.keys.get_mut(key) {
            entry.next_refresh = refresh_deadline(now, entry.ttl);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.keys
            .values()
            .filter_map(|entry| entry.next_refresh)
            .min()
    }
}

/// Refresh at a quarter of the TTL, but never more often than once a
/// second; infinite TTLs need no keep-alive.
fn refresh_deadline(now: Instant, ttl: Ttl) -> Option<Instant> {
    match ttl {
        Ttl::Infinite => None,
        Ttl::Finite(0) => None,
        Ttl::Finite(ms) => {
            let interval = Duration::from_millis(ms / 4).max(MIN_REFRESH_INTERVAL);
            Some(now + interval)
        }
    }
}
