//! Per-area event loop.
//!
//! Everything that touches one area's store or peer table runs here:
//! admin calls, inbound peer requests, egress completions, and timers.
//! Outbound RPCs never block the loop; they run on per-peer egress
//! workers that post their outcomes back as commands.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use uuid::Uuid;

use crate::config::{Config, PeerSpec};
use crate::core::{AreaId, NodeId, VersionedValue};
use crate::counters;
use crate::error::StoreError;
use crate::flood::flood_targets;
use crate::net::{
    Ack, InboundError, PeerClientFactory, PublicationMsg, SyncRequest, SyncResponse,
};
use crate::peer::{
    next_state, spawn_egress, EgressJob, EgressOutcome, EgressTimeouts, Peer, PeerEvent, PeerState,
    PeerStatus,
};
use crate::queue::{Publication, PublicationQueue, StoreUpdate};
use crate::store::{AreaStore, KeyDumpFilter, SelfOriginatedManager};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AreaSummary {
    pub area: AreaId,
    pub key_count: usize,
    pub key_bytes: usize,
    pub peer_count: usize,
}

pub enum AreaCommand {
    SetKeyVals {
        key_vals: BTreeMap<String, VersionedValue>,
        sender_ids: Vec<NodeId>,
        reply: Sender<Result<(), StoreError>>,
    },
    PersistKey {
        key: String,
        value: bytes::Bytes,
        reply: Sender<Result<(), StoreError>>,
    },
    GetKeyVals {
        keys: Vec<String>,
        reply: Sender<BTreeMap<String, VersionedValue>>,
    },
    Dump {
        filter: KeyDumpFilter,
        reply: Sender<BTreeMap<String, VersionedValue>>,
    },
    DumpHashes {
        prefix: String,
        reply: Sender<BTreeMap<String, VersionedValue>>,
    },
    DumpSelfOriginated {
        reply: Sender<BTreeMap<String, VersionedValue>>,
    },
    AddUpdatePeers {
        peers: BTreeMap<String, PeerSpec>,
        reply: Sender<()>,
    },
    DelPeers {
        names: Vec<String>,
        reply: Sender<()>,
    },
    GetPeerState {
        name: String,
        reply: Sender<Option<PeerState>>,
    },
    GetPeers {
        reply: Sender<BTreeMap<String, PeerStatus>>,
    },
    Summary {
        reply: Sender<AreaSummary>,
    },
    SyncHashes {
        request: SyncRequest,
        reply: Sender<Result<SyncResponse, InboundError>>,
    },
    ApplyPublication {
        publication: PublicationMsg,
        reply: Sender<Result<Ack, InboundError>>,
    },
    PeerOutcome {
        peer: String,
        generation: u64,
        outcome: EgressOutcome,
    },
    Stop,
}

pub struct AreaHandle {
    pub tx: Sender<AreaCommand>,
    join: JoinHandle<()>,
}

impl AreaHandle {
    pub fn join(self) {
        let _ = self.join.join();
    }
}

pub(crate) fn spawn_area(
    area: AreaId,
    config: Arc<Config>,
    queue: PublicationQueue,
    factory: Arc<dyn PeerClientFactory>,
) -> AreaHandle {
    let (tx, rx) = crossbeam::channel::unbounded();
    let loop_tx = tx.clone();
    let join = thread::spawn(move || {
        let runtime = AreaRuntime::new(area, config, queue, factory, loop_tx, rx);
        runtime.run();
    });
    AreaHandle { tx, join }
}

struct AreaRuntime {
    area: AreaId,
    node_id: NodeId,
    config: Arc<Config>,
    store: AreaStore,
    self_keys: SelfOriginatedManager,
    peers: BTreeMap<String, Peer>,
    queue: PublicationQueue,
    factory: Arc<dyn PeerClientFactory>,
    tx: Sender<AreaCommand>,
    rx: Receiver<AreaCommand>,
    initial_pending: BTreeSet<String>,
    synced_emitted: bool,
    init_deadline: Option<Instant>,
    counter_deadline: Instant,
    next_generation: u64,
    stopping: bool,
}

impl AreaRuntime {
    fn new(
        area: AreaId,
        config: Arc<Config>,
        queue: PublicationQueue,
        factory: Arc<dyn PeerClientFactory>,
        tx: Sender<AreaCommand>,
        rx: Receiver<AreaCommand>,
    ) -> Self {
        let node_id = config.node_id();
        Self {
            store: AreaStore::new(area.clone()),
            self_keys: SelfOriginatedManager::new(node_id.clone()),
            area,
            node_id,
            counter_deadline: Instant::now() + config.counter_submit_interval(),
            config,
            peers: BTreeMap::new(),
            queue,
            factory,
            tx,
            rx,
            initial_pending: BTreeSet::new(),
            synced_emitted: false,
            init_deadline: None,
            next_generation: 1,
            stopping: false,
        }
    }

    fn run(mut self) {
        self.startup();

        loop {
            self.handle_timers(Instant::now());
            if self.stopping {
                break;
            }

            let command = match self.next_deadline() {
                Some(deadline) => match self.rx.recv_deadline(deadline) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };
            self.handle_command(command);
        }

        self.shutdown();
    }

    fn startup(&mut self) {
        tracing::debug!(target: "kvstore", area = %self.area, node = %self.node_id, "area loop running");

        let startup_peers = self
            .config
            .initial_peers
            .get(self.area.as_str())
            .cloned()
            .unwrap_or_default();

        if startup_peers.is_empty() {
            self.maybe_emit_synced();
        } else {
            self.init_deadline = Some(Instant::now() + self.config.sync_initial_timeout());
            self.initial_pending = startup_peers.keys().cloned().collect();
            self.add_update_peers(startup_peers);
        }
    }

    fn shutdown(&mut self) {
        for (_, peer) in self.peers.iter_mut() {
            let generation = self.next_generation;
            self.next_generation += 1;
            peer.teardown(generation);
        }
        self.peers.clear();
        counters::clear_scope(self.area.as_str());
        tracing::debug!(target: "kvstore", area = %self.area, "area loop stopped");
    }

    // ---- timers ----

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = Some(self.counter_deadline);
        for candidate in [
            self.store.next_expiry(),
            self.self_keys.next_deadline(),
            self.init_deadline,
            self.peers.values().filter_map(|p| p.retry_at).min(),
        ] {
            deadline = match (deadline, candidate) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        deadline
    }

    fn handle_timers(&mut self, now: Instant) {
        self.expire_records(now);
        self.refresh_self_keys(now);
        self.retry_idle_peers(now);

        if let Some(deadline) = self.init_deadline {
            if now >= deadline && !self.synced_emitted {
                tracing::warn!(
                    target: "kvstore",
                    area = %self.area,
                    pending = ?self.initial_pending,
                    "initial sync timed out; signaling convergence anyway"
                );
                self.initial_pending.clear();
                self.maybe_emit_synced();
            }
        }

        if now >= self.counter_deadline {
            counters::set_scoped_gauge(
                counters::NUM_KEYS,
                self.area.as_str(),
                self.store.key_count() as u64,
            );
            counters::set_scoped_gauge(
                counters::NUM_PEERS,
                self.area.as_str(),
                self.peers.len() as u64,
            );
            self.counter_deadline = now + self.config.counter_submit_interval();
        }
    }

    fn expire_records(&mut self, now: Instant) {
        if !self.store.next_expiry().is_some_and(|at| at <= now) {
            return;
        }
        let expired = self.store.expire_tick(now);
        if expired.is_empty() {
            return;
        }
        for key in &expired {
            self.self_keys.remove(key);
        }
        tracing::debug!(target: "kvstore", area = %self.area, count = expired.len(), "records expired");
        self.publish(BTreeMap::new(), expired);
    }

    fn refresh_self_keys(&mut self, now: Instant) {
        let due = self.self_keys.due_refreshes(now);
        if due.is_empty() {
            return;
        }
        let mut delta = BTreeMap::new();
        for key in due {
            match self.store.refresh_ttl(&key, now) {
                Some(refreshed) => {
                    self.self_keys.on_refreshed(&key, now);
                    delta.insert(key, refreshed);
                }
                None => self.self_keys.remove(&key),
            }
        }
        if delta.is_empty() {
            return;
        }
        self.publish(delta.clone(), Vec::new());
        self.flood(delta, None, Vec::new());
    }

    fn retry_idle_peers(&mut self, now: Instant) {
        let due: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, peer)| {
                peer.state == PeerState::Idle && peer.retry_at.is_some_and(|at| at <= now)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in due {
            if let Some(peer) = self.peers.get_mut(&name) {
                peer.retry_at = None;
            }
            self.start_sync(&name);
        }
    }

    // ---- command dispatch ----

    fn handle_command(&mut self, command: AreaCommand) {
        match command {
            AreaCommand::SetKeyVals {
                key_vals,
                sender_ids,
                reply,
            } => {
                let _ = reply.send(self.set_key_vals(key_vals, sender_ids));
            }
            AreaCommand::PersistKey { key, value, reply } => {
                let _ = reply.send(self.persist_key(key, value));
            }
            AreaCommand::GetKeyVals { keys, reply } => {
                let _ = reply.send(self.store.get_key_vals(&keys));
            }
            AreaCommand::Dump { filter, reply } => {
                let _ = reply.send(self.store.dump(&filter));
            }
            AreaCommand::DumpHashes { prefix, reply } => {
                let _ = reply.send(self.store.dump_hashes(&prefix));
            }
            AreaCommand::DumpSelfOriginated { reply } => {
                let records = self
                    .self_keys
                    .keys()
                    .filter_map(|key| {
                        self.store
                            .get(key)
                            .map(|record| (key.to_string(), record.clone()))
                    })
                    .collect();
                let _ = reply.send(records);
            }
            AreaCommand::AddUpdatePeers { peers, reply } => {
                self.add_update_peers(peers);
                let _ = reply.send(());
            }
            AreaCommand::DelPeers { names, reply } => {
                self.del_peers(&names);
                let _ = reply.send(());
            }
            AreaCommand::GetPeerState { name, reply } => {
                let _ = reply.send(self.peers.get(&name).map(|peer| peer.state));
            }
            AreaCommand::GetPeers { reply } => {
                let statuses = self
                    .peers
                    .iter()
                    .map(|(name, peer)| (name.clone(), peer.status()))
                    .collect();
                let _ = reply.send(statuses);
            }
            AreaCommand::Summary { reply } => {
                let _ = reply.send(AreaSummary {
                    area: self.area.clone(),
                    key_count: self.store.key_count(),
                    key_bytes: self.store.value_bytes(),
                    peer_count: self.peers.len(),
                });
            }
            AreaCommand::SyncHashes { request, reply } => {
                let _ = reply.send(Ok(self.handle_sync_hashes(request)));
            }
            AreaCommand::ApplyPublication { publication, reply } => {
                let _ = reply.send(self.handle_publication(publication));
            }
            AreaCommand::PeerOutcome {
                peer,
                generation,
                outcome,
            } => {
                self.handle_peer_outcome(peer, generation, outcome);
            }
            AreaCommand::Stop => {
                self.stopping = true;
            }
        }
    }

    // ---- local writes ----

    fn set_key_vals(
        &mut self,
        key_vals: BTreeMap<String, VersionedValue>,
        sender_ids: Vec<NodeId>,
    ) -> Result<(), StoreError> {
        if key_vals.is_empty() {
            return Err(StoreError::EmptyKeyVals);
        }

        let mut prepared = BTreeMap::new();
        for (key, record) in key_vals {
            if record.version == 0 {
                return Err(StoreError::InvalidRecord {
                    key,
                    reason: "version must be > 0".into(),
                });
            }
            // Self-authored keys climb above any version already observed
            // in the mesh before they go out again.
            let record = if record.originator == self.node_id {
                let version = self.self_keys.next_author_version(&key, record.version);
                if version != record.version {
                    VersionedValue::new(
                        version,
                        record.originator,
                        record.value,
                        record.ttl,
                        record.ttl_version,
                    )
                } else {
                    record
                }
            } else {
                record
            };
            prepared.insert(key, record);
        }

        let now = Instant::now();
        let outcome = self.store.apply_key_vals(&prepared, now);
        for (key, record) in &outcome.delta {
            if record.originator == self.node_id && record.has_value() {
                self.self_keys.note_local_set(key, record, now);
            }
        }
        for key in &outcome.deleted {
            self.self_keys.remove(key);
        }

        if !outcome.is_noop() {
            self.publish(outcome.delta.clone(), outcome.deleted.clone());
            self.flood(outcome.delta, None, sender_ids);
        }
        Ok(())
    }

    /// Author a record for `key` as this node: the version climbs above
    /// both the stored record and anything observed in the mesh, the TTL
    /// comes from configuration.
    fn persist_key(&mut self, key: String, value: bytes::Bytes) -> Result<(), StoreError> {
        let base = self.store.get(&key).map(|record| record.version).unwrap_or(0);
        let version = self.self_keys.next_author_version(&key, base + 1);
        let record = VersionedValue::new(
            version,
            self.node_id.clone(),
            Some(value),
            self.config.default_ttl(),
            0,
        );
        self.set_key_vals(BTreeMap::from([(key, record)]), Vec::new())
    }

    // ---- inbound peer requests ----

    fn handle_sync_hashes(&mut self, request: SyncRequest) -> SyncResponse {
        let diff = self.store.sync_diff(&request.key_val_hashes);

        // A peer advertising a higher version for one of our keys means a
        // previous incarnation of this node is still echoing in the mesh.
        for (key, theirs) in &request.key_val_hashes {
            if self.self_keys.contains(key) && theirs.originator != self.node_id {
                self.self_keys.note_foreign_version(key, theirs.version);
            }
        }

        tracing::debug!(
            target: "kvstore",
            area = %self.area,
            from = %request.sender_id,
            remote_keys = request.key_val_hashes.len(),
            diff_keys = diff.len(),
            "served full-sync hash exchange"
        );
        SyncResponse {
            area: self.area.clone(),
            key_vals: diff,
        }
    }

    fn handle_publication(&mut self, publication: PublicationMsg) -> Result<Ack, InboundError> {
        if publication.area != self.area {
            counters::bump(counters::PROTOCOL_VIOLATIONS);
            return Err(InboundError::Malformed(format!(
                "publication for area {} routed to {}",
                publication.area, self.area
            )));
        }

        let applied = self.apply_remote(
            publication.key_vals,
            &publication.sender_id,
            publication.node_path,
        );
        if !applied {
            counters::bump(counters::REDUNDANT_PUBLICATIONS);
        }
        Ok(Ack {})
    }

    /// Merge records received from `sender` and flood whatever changed.
    /// Returns false when every record was already known.
    fn apply_remote(
        &mut self,
        key_vals: BTreeMap<String, VersionedValue>,
        sender: &NodeId,
        node_path: Vec<NodeId>,
    ) -> bool {
        if key_vals.is_empty() {
            return true;
        }
        let now = Instant::now();
        let outcome = self.store.apply_key_vals(&key_vals, now);

        for (key, record) in &key_vals {
            if self.self_keys.contains(key) && outcome.delta.contains_key(key) {
                self.self_keys.note_foreign_version(key, record.version);
            }
        }

        if outcome.is_noop() {
            return false;
        }

        self.publish(outcome.delta.clone(), outcome.deleted.clone());
        self.flood(outcome.delta, Some(sender.clone()), node_path);
        true
    }

    // ---- peer lifecycle ----

    fn add_update_peers(&mut self, specs: BTreeMap<String, PeerSpec>) {
        for (name, spec) in specs {
            match self.peers.get(&name) {
                Some(existing) if existing.spec == spec => continue,
                Some(_) => {
                    // Changed spec: tear the old incarnation down and force
                    // the peer back through IDLE -> SYNCING.
                    tracing::info!(
                        target: "kvstore",
                        area = %self.area,
                        peer = %name,
                        addr = %spec.addr,
                        "peer spec changed; resyncing"
                    );
                    let generation = self.bump_generation();
                    if let Some(peer) = self.peers.get_mut(&name) {
                        peer.teardown(generation);
                        peer.spec = spec;
                        peer.state = PeerState::Idle;
                        peer.backoff.reset();
                        peer.retry_at = None;
                    }
                }
                None => {
                    tracing::info!(
                        target: "kvstore",
                        area = %self.area,
                        peer = %name,
                        addr = %spec.addr,
                        "peer added"
                    );
                    let generation = self.bump_generation();
                    self.peers
                        .insert(name.clone(), Peer::new(spec, self.config.backoff, generation));
                }
            }
            self.start_sync(&name);
        }
    }

    fn del_peers(&mut self, names: &[String]) {
        for name in names {
            if let Some(mut peer) = self.peers.remove(name) {
                let generation = self.bump_generation();
                peer.teardown(generation);
                tracing::info!(target: "kvstore", area = %self.area, peer = %name.as_str(), "peer removed");
            }
            // A startup peer removed before it ever synced no longer gates
            // the synced signal.
            if self.initial_pending.remove(name) {
                self.maybe_emit_synced();
            }
        }
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    // ---- sync engine (initiator side) ----

    fn start_sync(&mut self, name: &str) {
        let Some(peer) = self.peers.get_mut(name) else {
            return;
        };
        if peer.state == PeerState::Syncing && peer.pending_sync.is_some() {
            return;
        }
        peer.state = next_state(peer.state, PeerEvent::PeerAdd);

        if peer.egress.is_none() {
            let timeouts = EgressTimeouts {
                connect: self.config.flood_rpc_timeout(),
                sync: self.config.sync_rpc_timeout(),
                flood: self.config.flood_rpc_timeout(),
            };
            let tx = self.tx.clone();
            peer.egress = Some(spawn_egress(
                name.to_string(),
                peer.generation,
                peer.spec.addr.clone(),
                Arc::clone(&self.factory),
                timeouts,
                move |peer, generation, outcome| {
                    let _ = tx.send(AreaCommand::PeerOutcome {
                        peer,
                        generation,
                        outcome,
                    });
                },
            ));
        }

        let token = Uuid::new_v4();
        peer.pending_sync = Some(token);
        let request = SyncRequest {
            area: self.area.clone(),
            sender_id: self.node_id.clone(),
            key_val_hashes: self.store.hash_snapshot(),
        };

        counters::bump(counters::NUM_FULL_SYNC);
        tracing::debug!(
            target: "kvstore",
            area = %self.area,
            peer = %name,
            %token,
            keys = request.key_val_hashes.len(),
            "issuing full-sync"
        );

        let sent = self
            .peers
            .get(name)
            .and_then(|peer| peer.egress.as_ref())
            .map(|egress| egress.send(EgressJob::FullSync { token, request }))
            .unwrap_or(false);
        if !sent {
            counters::bump(counters::NUM_FULL_SYNC_FAILURE);
            self.peer_rpc_error(name);
        }
    }

    fn handle_peer_outcome(&mut self, name: String, generation: u64, outcome: EgressOutcome) {
        let Some(peer) = self.peers.get(&name) else {
            return;
        };
        if peer.generation != generation {
            // stale worker from a torn-down incarnation
            return;
        }

        match outcome {
            EgressOutcome::SyncDone { token, result } => {
                if peer.pending_sync != Some(token) {
                    return;
                }
                match result {
                    Ok(response) => self.finish_sync(&name, token, response),
                    Err(err) => {
                        counters::bump(counters::NUM_FULL_SYNC_FAILURE);
                        tracing::warn!(
                            target: "kvstore",
                            area = %self.area,
                            peer = %name,
                            "full-sync failed: {err}"
                        );
                        self.peer_rpc_error(&name);
                    }
                }
            }
            EgressOutcome::FinalizedDone { token: _, result } => match result {
                Ok(()) => {
                    counters::bump(counters::NUM_FINALIZED_SYNC_SUCCESS);
                }
                Err(err) => {
                    counters::bump(counters::NUM_FINALIZED_SYNC_FAILURE);
                    tracing::warn!(
                        target: "kvstore",
                        area = %self.area,
                        peer = %name,
                        "finalized-sync failed: {err}"
                    );
                    self.peer_rpc_error(&name);
                }
            },
            EgressOutcome::FloodDone { result } => {
                if let Err(err) = result {
                    tracing::warn!(
                        target: "kvstore",
                        area = %self.area,
                        peer = %name,
                        "flood delivery failed: {err}"
                    );
                    self.peer_rpc_error(&name);
                }
            }
        }
    }

    fn finish_sync(&mut self, name: &str, token: Uuid, response: SyncResponse) {
        counters::bump(counters::NUM_FULL_SYNC_SUCCESS);

        let Ok(sender) = NodeId::parse(name.to_string()) else {
            return;
        };

        // Phase two: adopt every record the responder dominates us on, and
        // flood those changes to our other peers.
        let node_path = vec![sender.clone()];
        self.apply_remote(response.key_vals.clone(), &sender, node_path);

        // Version adoption for markers on self keys.
        for (key, record) in &response.key_vals {
            if !record.has_value() && self.self_keys.contains(key) {
                self.self_keys.note_foreign_version(key, record.version);
            }
        }

        // Phase three: push back everything we dominate.
        let finalized = self.store.finalize_diff(&response.key_vals);
        if !finalized.is_empty() {
            counters::bump(counters::NUM_FINALIZED_SYNC);
            let publication = PublicationMsg {
                area: self.area.clone(),
                sender_id: self.node_id.clone(),
                key_vals: finalized,
                expired_keys: Vec::new(),
                node_path: vec![self.node_id.clone()],
            };
            let sent = self
                .peers
                .get(name)
                .and_then(|peer| peer.egress.as_ref())
                .map(|egress| egress.send(EgressJob::FinalizedPush { token, publication }))
                .unwrap_or(false);
            if !sent {
                counters::bump(counters::NUM_FINALIZED_SYNC_FAILURE);
                self.peer_rpc_error(name);
                return;
            }
        }

        if let Some(peer) = self.peers.get_mut(name) {
            peer.pending_sync = None;
            peer.state = next_state(peer.state, PeerEvent::SyncRespRcvd);
            peer.backoff.reset();
            tracing::info!(
                target: "kvstore",
                area = %self.area,
                peer = %name,
                state = %peer.state,
                "full-sync complete"
            );
        }

        if self.initial_pending.remove(name) {
            self.maybe_emit_synced();
        }
    }

    fn peer_rpc_error(&mut self, name: &str) {
        let generation = self.bump_generation();
        let Some(peer) = self.peers.get_mut(name) else {
            return;
        };
        peer.state = next_state(peer.state, PeerEvent::RpcError);
        peer.teardown(generation);
        let delay = peer.backoff.next_delay();
        peer.retry_at = Some(Instant::now() + delay);
        tracing::debug!(
            target: "kvstore",
            area = %self.area,
            peer = %name,
            state = %peer.state,
            retry_in_ms = delay.as_millis() as u64,
            "peer backed off"
        );
    }

    // ---- output paths ----

    fn publish(&self, key_vals: BTreeMap<String, VersionedValue>, expired_keys: Vec<String>) {
        self.queue.push(StoreUpdate::Publication(Publication {
            area: self.area.clone(),
            key_vals,
            expired_keys,
        }));
    }

    fn flood(
        &mut self,
        delta: BTreeMap<String, VersionedValue>,
        sender: Option<NodeId>,
        mut node_path: Vec<NodeId>,
    ) {
        if delta.is_empty() {
            return;
        }
        let targets = flood_targets(
            self.peers.iter(),
            sender.as_ref(),
            &node_path,
            self.config.enable_flood_optimization,
        );
        if targets.is_empty() {
            return;
        }

        if !node_path.contains(&self.node_id) {
            node_path.push(self.node_id.clone());
        }
        let publication = PublicationMsg {
            area: self.area.clone(),
            sender_id: self.node_id.clone(),
            key_vals: delta,
            expired_keys: Vec::new(),
            node_path,
        };

        let mut failed = Vec::new();
        for target in targets {
            let sent = self
                .peers
                .get(&target)
                .and_then(|peer| peer.egress.as_ref())
                .map(|egress| {
                    egress.send(EgressJob::Flood {
                        publication: publication.clone(),
                    })
                })
                .unwrap_or(false);
            if !sent {
                failed.push(target);
            }
        }
        for target in failed {
            self.peer_rpc_error(&target);
        }
    }

    fn maybe_emit_synced(&mut self) {
        if self.synced_emitted || !self.initial_pending.is_empty() {
            return;
        }
        self.synced_emitted = true;
        self.init_deadline = None;
        self.queue
            .push(StoreUpdate::Initialized(self.area.clone()));
        tracing::info!(target: "kvstore", area = %self.area, "initial convergence complete");
    }
}
