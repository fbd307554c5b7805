//! Convergence signaling, unreachable peers, and shutdown behavior.

mod common;

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::time::Duration;

use common::{value, TestStore, POLL_TIMEOUT, TEST_AREA};
use kvmesh::{PeerSpec, PeerState, StoreError};

/// A port nothing is listening on.
fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);
    addr
}

// Peers pointing at dead ports never initialize and never corrupt the
// store; the peer keeps cycling through idle/syncing under backoff.
#[test]
fn unreachable_peer_leaves_store_unchanged() {
    let store1 = TestStore::spawn("node-1");
    let store2 = TestStore::spawn("node-2");

    let val1 = value(1, "node-1", "value1");
    let val2 = value(2, "node-2", "value2");
    assert!(store1.set_key("key1", val1.clone()));
    assert!(store2.set_key("key2", val2.clone()));

    assert!(store1.add_peer("node-2", PeerSpec::new(dead_addr())));
    assert!(store2.add_peer("node-1", PeerSpec::new(dead_addr())));

    // observe for a second: nothing crosses over
    assert!(!store1.wait_for_key("key2", &val2, Duration::from_secs(1)));
    assert!(store2.get_key("key1").is_none());
    assert_eq!(store1.dump_all().len(), 1);
    assert_eq!(store2.dump_all().len(), 1);

    let state = store1.peer_state("node-2").expect("peer exists");
    assert_ne!(state, PeerState::Initialized);
}

// Startup-configured peers gate the synced signal until their first
// successful sync.
#[test]
fn synced_signal_waits_for_startup_peers() {
    let store1 = TestStore::spawn("node-1");
    assert!(store1.recv_synced_signal(POLL_TIMEOUT));

    let mut config = TestStore::config("node-2");
    config.initial_peers.insert(
        TEST_AREA.to_string(),
        BTreeMap::from([("node-1".to_string(), store1.peer_spec())]),
    );
    let store2 = TestStore::spawn_with(config);

    assert!(store2.recv_synced_signal(POLL_TIMEOUT));
    assert!(store2.wait_for_peer_state("node-1", PeerState::Initialized, POLL_TIMEOUT));
}

// When every startup peer stays dark, the initialization timeout fires
// the signal anyway.
#[test]
fn synced_signal_fires_on_timeout() {
    let mut config = TestStore::config("node-1");
    config.sync_initial_timeout_ms = 400;
    config.initial_peers.insert(
        TEST_AREA.to_string(),
        BTreeMap::from([("node-9".to_string(), PeerSpec::new(dead_addr()))]),
    );
    let store = TestStore::spawn_with(config);

    assert!(!store.recv_synced_signal(Duration::from_millis(150)));
    assert!(store.recv_synced_signal(Duration::from_secs(3)));
    // exactly once per process lifetime
    assert!(!store.recv_synced_signal(Duration::from_millis(300)));
}

#[test]
fn stop_is_idempotent() {
    let mut harness = TestStore::spawn("node-1");
    assert!(harness.set_key("key1", value(1, "node-1", "value1")));

    harness.store.stop();
    harness.store.stop();

    let err = harness
        .store
        .get_key_vals(&harness.area, vec!["key1".to_string()])
        .unwrap_err();
    assert!(matches!(err, StoreError::Stopped));
}

#[test]
fn unknown_area_is_rejected() {
    let store = TestStore::spawn("node-1");
    let bogus = kvmesh::AreaId::parse("area-unknown").unwrap();
    let err = store.store.get_key_vals(&bogus, vec![]).unwrap_err();
    assert!(matches!(err, StoreError::UnknownArea(_)));

    let err = store
        .store
        .set_key_vals(&store.area, BTreeMap::new(), None)
        .unwrap_err();
    assert!(matches!(err, StoreError::EmptyKeyVals));
}
