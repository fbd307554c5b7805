//! Versioned value records and the deterministic two-record merge.
//!
//! Every replica applies the same total order to records, so any two
//! replicas that have seen the same multiset of updates converge on the
//! same winner per key without coordination.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::ids::NodeId;

/// Time-to-live for a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ttl {
    /// Never expires.
    Infinite,
    /// Expires this many milliseconds after the last refresh.
    Finite(u64),
}

impl Ttl {
    pub fn as_millis(&self) -> Option<u64> {
        match self {
            Ttl::Infinite => None,
            Ttl::Finite(ms) => Some(*ms),
        }
    }

    pub fn is_expired_immediately(&self) -> bool {
        matches!(self, Ttl::Finite(0))
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::Infinite => write!(f, "inf"),
            Ttl::Finite(ms) => write!(f, "{ms}ms"),
        }
    }
}

/// SHA-256 digest over `(version, originator, value)`.
///
/// Carried on the wire so that hash-only sync exchanges agree across nodes
/// without shipping values. Byte-lexicographic order is the final merge
/// tie-breaker.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueHash(pub [u8; 32]);

impl ValueHash {
    pub fn compute(version: u64, originator: &NodeId, value: Option<&Bytes>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(version.to_be_bytes());
        let origin = originator.as_str().as_bytes();
        hasher.update((origin.len() as u64).to_be_bytes());
        hasher.update(origin);
        match value {
            Some(bytes) => {
                hasher.update([1u8]);
                hasher.update((bytes.len() as u64).to_be_bytes());
                hasher.update(bytes);
            }
            None => hasher.update([0u8]),
        }
        Self(hasher.finalize().into())
    }
}

impl fmt::Debug for ValueHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueHash({self})")
    }
}

impl fmt::Display for ValueHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// One versioned record within an area.
///
/// `value` may be absent: metadata-only records travel in hash exchanges
/// and TTL refreshes, where the receiver either already holds the value or
/// is being asked to supply it.
#[derive(Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub version: u64,
    pub originator: NodeId,
    pub value: Option<Bytes>,
    pub ttl: Ttl,
    pub ttl_version: u64,
    pub hash: ValueHash,
}

impl VersionedValue {
    /// Build a record, computing its hash from the identity fields.
    pub fn new(
        version: u64,
        originator: NodeId,
        value: Option<Bytes>,
        ttl: Ttl,
        ttl_version: u64,
    ) -> Self {
        let hash = ValueHash::compute(version, &originator, value.as_ref());
        Self {
            version,
            originator,
            value,
            ttl,
            ttl_version,
            hash,
        }
    }

    /// Rebuild a record decoded from the wire, trusting the carried hash.
    ///
    /// Metadata-only records cannot recompute the hash locally; the carried
    /// digest is the identity the peers agreed on.
    pub fn from_wire(
        version: u64,
        originator: NodeId,
        value: Option<Bytes>,
        ttl: Ttl,
        ttl_version: u64,
        hash: ValueHash,
    ) -> Self {
        Self {
            version,
            originator,
            value,
            ttl,
            ttl_version,
            hash,
        }
    }

    /// Copy of this record with the value stripped, hash retained.
    pub fn metadata_only(&self) -> Self {
        Self {
            value: None,
            ..self.clone()
        }
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn value_len(&self) -> usize {
        self.value.as_ref().map(Bytes::len).unwrap_or(0)
    }
}

impl fmt::Debug for VersionedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedValue")
            .field("version", &self.version)
            .field("originator", &self.originator)
            .field("value_len", &self.value_len())
            .field("has_value", &self.has_value())
            .field("ttl", &self.ttl)
            .field("ttl_version", &self.ttl_version)
            .field("hash", &format_args!("{}", self.hash))
            .finish()
    }
}

/// Total, deterministic order over record identities.
///
/// First difference decides: version, then originator (lexicographic),
/// then hash (byte-lexicographic). Shared by every node, so replicas
/// applying the same updates pick the same winners.
pub fn identity_ordering(a: &VersionedValue, b: &VersionedValue) -> Ordering {
    a.version
        .cmp(&b.version)
        .then_with(|| a.originator.cmp(&b.originator))
        .then_with(|| a.hash.cmp(&b.hash))
}

/// Identity order extended by `ttl_version`, used by sync exchanges to
/// decide which side must push a pure TTL refresh.
pub fn sync_ordering(a: &VersionedValue, b: &VersionedValue) -> Ordering {
    identity_ordering(a, b).then_with(|| a.ttl_version.cmp(&b.ttl_version))
}

/// Result of applying an incoming record against the local one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Incoming record won and replaces (or creates) the local one.
    Adopted,
    /// Same identity, strictly larger `ttl_version`: keep the local value,
    /// adopt the refreshed TTL schedule.
    TtlRefreshed,
    /// Local store unchanged.
    Unchanged,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, MergeOutcome::Unchanged)
    }
}

/// Decide what an incoming record does to the local store.
///
/// Pure and total. A dominating incoming record without a value is never
/// adopted (there is nothing to store); the sync engine interprets such
/// records as markers instead. A record with a lower version never touches
/// the local TTL regardless of its `ttl_version`.
pub fn merge(existing: Option<&VersionedValue>, incoming: &VersionedValue) -> MergeOutcome {
    let Some(current) = existing else {
        return if incoming.has_value() {
            MergeOutcome::Adopted
        } else {
            MergeOutcome::Unchanged
        };
    };

    match identity_ordering(incoming, current) {
        Ordering::Greater => {
            if incoming.has_value() {
                MergeOutcome::Adopted
            } else {
                MergeOutcome::Unchanged
            }
        }
        Ordering::Less => MergeOutcome::Unchanged,
        Ordering::Equal => {
            if incoming.ttl_version > current.ttl_version {
                MergeOutcome::TtlRefreshed
            } else {
                MergeOutcome::Unchanged
            }
        }
    }
}

/// The record that survives a merge of two full records.
///
/// Exposed for property tests: selection is a total order, so it is
/// commutative in identity and associative.
pub fn merge_winner<'a>(a: &'a VersionedValue, b: &'a VersionedValue) -> &'a VersionedValue {
    match identity_ordering(a, b) {
        Ordering::Less => b,
        Ordering::Greater => a,
        Ordering::Equal => {
            if b.ttl_version > a.ttl_version {
                b
            } else {
                a
            }
        }
    }
}
