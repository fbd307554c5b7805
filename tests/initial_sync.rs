//! Bootstrap full-sync between two stores over loopback TCP.

mod common;

use std::time::Duration;

use common::{value, TestStore, POLL_TIMEOUT};
use kvmesh::PeerState;

// Two nodes, each holding one key, peer up with each other and reach
// global consistency; peer tables become symmetric and each store emits
// its convergence signal exactly once.
#[test]
fn initial_sync_reaches_consistency() {
    let store1 = TestStore::spawn("node-1");
    let store2 = TestStore::spawn("node-2");

    // no startup peers: convergence signal fires immediately
    assert!(store1.recv_synced_signal(POLL_TIMEOUT));
    assert!(store2.recv_synced_signal(POLL_TIMEOUT));

    let val1 = value(1, "node-1", "value1");
    let val2 = value(2, "node-2", "value2");
    assert!(store1.set_key("key1", val1.clone()));
    assert!(store2.set_key("key2", val2.clone()));

    // keys are mutually exclusive before peering
    assert!(store1.get_key("key1").is_some());
    assert!(store1.get_key("key2").is_none());
    assert!(store2.get_key("key2").is_some());
    assert!(store2.get_key("key1").is_none());

    assert!(store1.add_peer("node-2", store2.peer_spec()));
    assert!(store2.add_peer("node-1", store1.peer_spec()));

    assert!(store1.wait_for_peer_state("node-2", PeerState::Initialized, POLL_TIMEOUT));
    assert!(store2.wait_for_peer_state("node-1", PeerState::Initialized, POLL_TIMEOUT));

    assert!(store1.wait_for_key("key2", &val2, POLL_TIMEOUT));
    assert!(store2.wait_for_key("key1", &val1, POLL_TIMEOUT));
    assert_eq!(store1.dump_all().len(), 2);
    assert_eq!(store2.dump_all().len(), 2);

    // peer tables are symmetric and initialized
    let peers1 = store1.peers();
    let peers2 = store2.peers();
    assert_eq!(peers1.len(), 1);
    assert_eq!(peers1["node-2"].spec, store2.peer_spec());
    assert_eq!(peers1["node-2"].state, PeerState::Initialized);
    assert_eq!(peers2.len(), 1);
    assert_eq!(peers2["node-1"].spec, store1.peer_spec());
    assert_eq!(peers2["node-1"].state, PeerState::Initialized);

    // no second synced marker
    assert!(!store1.recv_synced_signal(Duration::from_millis(300)));
}

// Re-adding a peer whose address changed forces a fresh sync against the
// new endpoint.
#[test]
fn changed_peer_spec_forces_resync() {
    let store1 = TestStore::spawn("node-1");
    let mut store2 = TestStore::spawn("node-2");

    let val1 = value(1, "node-1", "value1");
    let val2 = value(2, "node-2", "value2");
    assert!(store1.set_key("key1", val1.clone()));
    assert!(store2.set_key("key2", val2.clone()));

    assert!(store1.add_peer("node-2", store2.peer_spec()));
    assert!(store1.wait_for_peer_state("node-2", PeerState::Initialized, POLL_TIMEOUT));
    assert!(store1.wait_for_key("key2", &val2, POLL_TIMEOUT));

    // restart node-2 on a new ephemeral port
    store2.store.stop();
    store2 = TestStore::spawn("node-2");
    let new_spec = store2.peer_spec();

    assert!(store1.add_peer("node-2", new_spec.clone()));
    assert!(store1.wait_for_peer_state("node-2", PeerState::Initialized, POLL_TIMEOUT));
    assert_eq!(store1.peers()["node-2"].spec, new_spec);

    // the fresh node-2 learns both keys through the finalized push
    assert!(store2.wait_for_key("key1", &val1, POLL_TIMEOUT));
    assert!(store2.wait_for_key("key2", &val2, POLL_TIMEOUT));
}

#[test]
fn deleted_peers_are_forgotten() {
    let store1 = TestStore::spawn("node-1");
    let store2 = TestStore::spawn("node-2");

    assert!(store1.add_peer("node-2", store2.peer_spec()));
    assert!(store2.add_peer("node-1", store1.peer_spec()));
    assert!(store1.wait_for_peer_state("node-2", PeerState::Initialized, POLL_TIMEOUT));
    assert!(store2.wait_for_peer_state("node-1", PeerState::Initialized, POLL_TIMEOUT));

    assert!(store1.del_peer("node-2"));
    assert!(store2.del_peer("node-1"));
    assert!(store1.peers().is_empty());
    assert!(store2.peers().is_empty());
    assert_eq!(store1.peer_state("node-2"), None);
}
