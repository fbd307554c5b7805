//! Test harness: spawn a store with an ephemeral mesh port and poll it
//! like a peer daemon would.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use kvmesh::{
    AreaId, Config, KeyDumpFilter, KvStore, NodeId, PeerSpec, PeerState, Publication, RecvError,
    StoreUpdate, Ttl, VersionedValue,
};

pub const TEST_AREA: &str = "test-area";
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestStore {
    pub store: KvStore,
    pub area: AreaId,
}

impl TestStore {
    pub fn spawn(name: &str) -> Self {
        Self::spawn_with(Self::config(name))
    }

    pub fn spawn_with(config: Config) -> Self {
        let store = KvStore::start(config).expect("store starts");
        Self {
            store,
            area: AreaId::parse(TEST_AREA).unwrap(),
        }
    }

    pub fn config(name: &str) -> Config {
        Config::new(name, [TEST_AREA.to_string()])
    }

    pub fn node_name(&self) -> String {
        self.store.node_id().to_string()
    }

    pub fn peer_spec(&self) -> PeerSpec {
        self.store.peer_spec().expect("server running")
    }

    pub fn set_key(&self, key: &str, record: VersionedValue) -> bool {
        self.store
            .set_key_vals(
                &self.area,
                BTreeMap::from([(key.to_string(), record)]),
                None,
            )
            .is_ok()
    }

    pub fn get_key(&self, key: &str) -> Option<VersionedValue> {
        self.store.get_key(&self.area, key).expect("get_key")
    }

    pub fn dump_all(&self) -> BTreeMap<String, VersionedValue> {
        self.store
            .dump(&self.area, KeyDumpFilter::all())
            .expect("dump")
    }

    pub fn add_peer(&self, name: &str, spec: PeerSpec) -> bool {
        self.store
            .add_update_peers(&self.area, BTreeMap::from([(name.to_string(), spec)]))
            .is_ok()
    }

    pub fn del_peer(&self, name: &str) -> bool {
        self.store
            .del_peers(&self.area, vec![name.to_string()])
            .is_ok()
    }

    pub fn peer_state(&self, name: &str) -> Option<PeerState> {
        self.store
            .get_peer_state(&self.area, name)
            .expect("get_peer_state")
    }

    pub fn peers(&self) -> BTreeMap<String, kvmesh::PeerStatus> {
        self.store.get_peers(&self.area).expect("get_peers")
    }

    /// Poll until `key` holds exactly `expected`.
    pub fn wait_for_key(&self, key: &str, expected: &VersionedValue, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.get_key(key).as_ref() == Some(expected) {
                return true;
            }
            std::thread::yield_now();
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Poll until the peer reports `expected` state.
    pub fn wait_for_peer_state(
        &self,
        name: &str,
        expected: PeerState,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.peer_state(name) == Some(expected) {
                return true;
            }
            std::thread::yield_now();
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Drain the update stream until the synced marker for the test area
    /// arrives.
    pub fn recv_synced_signal(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.store.updates().recv_timeout(deadline - now) {
                Ok(StoreUpdate::Initialized(area)) if area == self.area => return true,
                Ok(_) => continue,
                Err(RecvError::Timeout) | Err(RecvError::Closed) => return false,
            }
        }
    }

    /// Next publication (skipping init markers), if one arrives in time.
    pub fn recv_publication(&self, timeout: Duration) -> Option<Publication> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            match self.store.updates().recv_timeout(deadline - now) {
                Ok(StoreUpdate::Publication(publication)) => return Some(publication),
                Ok(StoreUpdate::Initialized(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

pub fn value(version: u64, originator: &str, payload: &str) -> VersionedValue {
    VersionedValue::new(
        version,
        NodeId::parse(originator).unwrap(),
        Some(Bytes::copy_from_slice(payload.as_bytes())),
        Ttl::Infinite,
        0,
    )
}

pub fn value_with_ttl(version: u64, originator: &str, payload: &str, ttl_ms: u64) -> VersionedValue {
    VersionedValue::new(
        version,
        NodeId::parse(originator).unwrap(),
        Some(Bytes::copy_from_slice(payload.as_bytes())),
        Ttl::Finite(ttl_ms),
        0,
    )
}
