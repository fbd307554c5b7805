//! Per-area key map: merge application, dumps, sync diffs, TTL expiry.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use crate::core::{merge, sync_ordering, AreaId, MergeOutcome, NodeId, Ttl, VersionedValue};

/// Filter for `dump`: empty prefix set and empty originator set match
/// everything. `keys` is accepted as a hint and ignored whenever
/// `prefixes` is present. When `key_val_hashes` is supplied the dump
/// becomes a sync diff and the other filters do not apply.
#[derive(Clone, Debug, Default)]
pub struct KeyDumpFilter {
    pub prefixes: Vec<String>,
    pub originators: BTreeSet<NodeId>,
    pub keys: Vec<String>,
    pub key_val_hashes: Option<BTreeMap<String, VersionedValue>>,
}

impl KeyDumpFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefixes: vec![prefix.into()],
            ..Self::default()
        }
    }

    fn matches(&self, key: &str, record: &VersionedValue) -> bool {
        if !self.prefixes.is_empty() && !self.prefixes.iter().any(|p| key.starts_with(p.as_str()))
        {
            return false;
        }
        if !self.originators.is_empty() && !self.originators.contains(&record.originator) {
            return false;
        }
        true
    }
}

/// What applying a batch of records changed.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Adopted records plus metadata-only TTL refreshes, keyed for
    /// flooding and local publication.
    pub delta: BTreeMap<String, VersionedValue>,
    /// Keys removed because a winning record carried `ttl = 0`.
    pub deleted: Vec<String>,
    /// Merges that changed nothing (already-known records).
    pub redundant: u64,
}

impl ApplyOutcome {
    pub fn is_noop(&self) -> bool {
        self.delta.is_empty() && self.deleted.is_empty()
    }
}

struct KeyEntry {
    value: VersionedValue,
    expires_at: Option<Instant>,
}

/// The replica of one area's key space. Owned exclusively by that area's
/// event loop; no internal locking.
pub struct AreaStore {
    area: AreaId,
    entries: BTreeMap<String, KeyEntry>,
}

impl AreaStore {
    pub fn new(area: AreaId) -> Self {
        Self {
            area,
            entries: BTreeMap::new(),
        }
    }

    pub fn area(&self) -> &AreaId {
        &self.area
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn value_bytes(&self) -> usize {
        self.entries
            .values()
            .map(|entry| entry.value.value_len())
            .sum()
    }

    /// Merge a batch of incoming records into the map.
    pub fn apply_key_vals(
        &mut self,
        key_vals: &BTreeMap<String, VersionedValue>,
        now: Instant,
    ) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();

        for (key, incoming) in key_vals {
            let existing = self.entries.get(key).map(|entry| &entry.value);
            match merge(existing, incoming) {
                MergeOutcome::Adopted => {
                    if incoming.ttl.is_expired_immediately() {
                        if self.entries.remove(key).is_some() {
                            outcome.deleted.push(key.clone());
                        }
                        outcome.delta.insert(key.clone(), incoming.clone());
                        continue;
                    }
                    self.entries.insert(
                        key.clone(),
                        KeyEntry {
                            value: incoming.clone(),
                            expires_at: expiry_after(now, incoming.ttl),
                        },
                    );
                    outcome.delta.insert(key.clone(), incoming.clone());
                }
                MergeOutcome::TtlRefreshed => {
                    let entry = self.entries.get_mut(key).expect("refresh of known key");
                    entry.value.ttl = incoming.ttl;
                    entry.value.ttl_version = incoming.ttl_version;
                    entry.expires_at = expiry_after(now, incoming.ttl);
                    outcome
                        .delta
                        .insert(key.clone(), entry.value.metadata_only());
                }
                MergeOutcome::Unchanged => {
                    outcome.redundant += 1;
                }
            }
        }

        outcome
    }

    /// Bump `ttl_version` on a key this node keeps alive; returns the
    /// metadata-only delta to republish.
    pub fn refresh_ttl(&mut self, key: &str, now: Instant) -> Option<VersionedValue> {
        let entry = self.entries.get_mut(key)?;
        entry.value.ttl_version += 1;
        entry.expires_at = expiry_after(now, entry.value.ttl);
        Some(entry.value.metadata_only())
    }

    pub fn get(&self, key: &str) -> Option<&VersionedValue> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn get_key_vals(&self, keys: &[String]) -> BTreeMap<String, VersionedValue> {
        keys.iter()
            .filter_map(|key| {
                self.entries
                    .get(key)
                    .map(|entry| (key.clone(), entry.value.clone()))
            })
            .collect()
    }

    pub fn dump(&self, filter: &KeyDumpFilter) -> BTreeMap<String, VersionedValue> {
        if let Some(hashes) = &filter.key_val_hashes {
            return self.sync_diff(hashes);
        }
        self.entries
            .iter()
            .filter(|(key, entry)| filter.matches(key, &entry.value))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    pub fn dump_hashes(&self, prefix: &str) -> BTreeMap<String, VersionedValue> {
        self.entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.metadata_only()))
            .collect()
    }

    /// The full map with values stripped: phase one of a full-sync.
    pub fn hash_snapshot(&self) -> BTreeMap<String, VersionedValue> {
        self.dump_hashes("")
    }

    /// Responder side of a full-sync: given the initiator's hash map,
    /// return full records where this store dominates (or holds a key the
    /// initiator lacks) and metadata-only markers where the initiator
    /// dominates. Identical entries are omitted.
    pub fn sync_diff(
        &self,
        remote: &BTreeMap<String, VersionedValue>,
    ) -> BTreeMap<String, VersionedValue> {
        let mut out = BTreeMap::new();

        for (key, entry) in &self.entries {
            match remote.get(key) {
                None => {
                    out.insert(key.clone(), entry.value.clone());
                }
                Some(theirs) => match sync_ordering(&entry.value, theirs) {
                    Ordering::Greater => {
                        out.insert(key.clone(), entry.value.clone());
                    }
                    Ordering::Less => {
                        out.insert(key.clone(), theirs.metadata_only());
                    }
                    Ordering::Equal => {}
                },
            }
        }

        for (key, theirs) in remote {
            if !self.entries.contains_key(key) {
                out.insert(key.clone(), theirs.metadata_only());
            }
        }

        out
    }

    /// Initiator side, after merging a sync response: collect the full
    /// records to push back for every marker the responder sent, unless a
    /// concurrent update already replaced ours with something older than
    /// the marker.
    pub fn finalize_diff(
        &self,
        response: &BTreeMap<String, VersionedValue>,
    ) -> BTreeMap<String, VersionedValue> {
        let mut out = BTreeMap::new();
        for (key, incoming) in response {
            if incoming.has_value() {
                continue;
            }
            if let Some(entry) = self.entries.get(key) {
                if sync_ordering(&entry.value, incoming) != Ordering::Less {
                    out.insert(key.clone(), entry.value.clone());
                }
            }
        }
        out
    }

    /// Drop records whose TTL has elapsed; returns the expired keys.
    pub fn expire_tick(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|entry| entry.expires_at)
            .min()
    }
}

fn expiry_after(now: Instant, ttl: Ttl) -> Option<Instant> {
    ttl.as_millis().map(|ms| now + Duration::from_millis(ms))
}
