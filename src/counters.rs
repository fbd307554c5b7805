//! Process-wide counter registry.
//!
//! A single global sink, writable from any thread, readable as a flat
//! name -> value snapshot. Gauges may be scoped (one slot per area) and are
//! summed into the flat name at snapshot time.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

pub const NUM_FULL_SYNC: &str = "kvstore.thrift.num_full_sync.count";
pub const NUM_FULL_SYNC_SUCCESS: &str = "kvstore.thrift.num_full_sync_success.count";
pub const NUM_FULL_SYNC_FAILURE: &str = "kvstore.thrift.num_full_sync_failure.count";
pub const NUM_FINALIZED_SYNC: &str = "kvstore.thrift.num_finalized_sync.count";
pub const NUM_FINALIZED_SYNC_SUCCESS: &str = "kvstore.thrift.num_finalized_sync_success.count";
pub const NUM_FINALIZED_SYNC_FAILURE: &str = "kvstore.thrift.num_finalized_sync_failure.count";
pub const NUM_KEYS: &str = "kvstore.num_keys";
pub const NUM_PEERS: &str = "kvstore.num_peers";
pub const PUBLICATION_QUEUE_DROPS: &str = "kvstore.publication_queue_drops";
pub const PROTOCOL_VIOLATIONS: &str = "kvstore.protocol_violations";
pub const REDUNDANT_PUBLICATIONS: &str = "kvstore.received_redundant_publications.count";

#[derive(Default)]
struct Registry {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, BTreeMap<String, u64>>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

pub fn bump(name: &str) {
    bump_by(name, 1);
}

pub fn bump_by(name: &str, amount: u64) {
    let mut reg = registry().lock().expect("counter registry lock poisoned");
    let slot = reg.counters.entry(name.to_string()).or_insert(0);
    *slot = slot.saturating_add(amount);
}

/// Set a gauge scoped to one producer (typically an area); the snapshot
/// reports the sum over all scopes under the flat name.
pub fn set_scoped_gauge(name: &str, scope: &str, value: u64) {
    let mut reg = registry().lock().expect("counter registry lock poisoned");
    reg.gauges
        .entry(name.to_string())
        .or_default()
        .insert(scope.to_string(), value);
}

pub fn clear_scope(scope: &str) {
    let mut reg = registry().lock().expect("counter registry lock poisoned");
    for scopes in reg.gauges.values_mut() {
        scopes.remove(scope);
    }
}

/// Flat snapshot of every counter and gauge.
pub fn snapshot() -> BTreeMap<String, u64> {
    let reg = registry().lock().expect("counter registry lock poisoned");
    let mut out = reg.counters.clone();
    for (name, scopes) in &reg.gauges {
        out.insert(name.clone(), scopes.values().sum());
    }
    out
}

pub fn value(name: &str) -> u64 {
    snapshot().get(name).copied().unwrap_or(0)
}

/// Reset every counter and gauge. Test support only; production code never
/// rewinds monotonic counters.
pub fn reset() {
    let mut reg = registry().lock().expect("counter registry lock poisoned");
    reg.counters.clear();
    reg.gauges.clear();
}
