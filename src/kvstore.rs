//! The store facade: one event loop per area, a mesh server for peers,
//! and the in-process admin surface.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Sender;
use thiserror::Error;

use crate::area::{spawn_area, AreaCommand, AreaHandle, AreaSummary};
use crate::config::{Config, ConfigError, PeerSpec};
use crate::core::{AreaId, NodeId, VersionedValue};
use crate::error::StoreError;
use crate::net::{
    Ack, InboundError, InboundHandler, MeshServer, MeshServerHandle, PeerClientFactory,
    PublicationMsg, SyncRequest, SyncResponse, TcpClientFactory,
};
use crate::peer::{PeerState, PeerStatus};
use crate::queue::{publication_queue, PublicationQueue, UpdateReader};
use crate::store::KeyDumpFilter;

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to start mesh server: {0}")]
    Server(#[from] crate::net::ServerError),
}

/// Routes inbound peer requests onto the owning area's loop.
struct AreaDispatch {
    areas: BTreeMap<AreaId, Sender<AreaCommand>>,
    read_timeout: Duration,
}

impl AreaDispatch {
    fn call<T>(
        &self,
        area: &AreaId,
        make: impl FnOnce(Sender<T>) -> AreaCommand,
    ) -> Result<T, InboundError>
    where
        T: Send,
    {
        let tx = self
            .areas
            .get(area)
            .ok_or_else(|| InboundError::UnknownArea(area.to_string()))?;
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        tx.send(make(reply_tx)).map_err(|_| InboundError::Stopping)?;
        reply_rx
            .recv_timeout(self.read_timeout)
            .map_err(|_| InboundError::Stopping)
    }
}

impl InboundHandler for AreaDispatch {
    fn handle_sync_hashes(&self, request: SyncRequest) -> Result<SyncResponse, InboundError> {
        let area = request.area.clone();
        self.call(&area, |reply| AreaCommand::SyncHashes { request, reply })?
    }

    fn handle_publication(&self, publication: PublicationMsg) -> Result<Ack, InboundError> {
        let area = publication.area.clone();
        self.call(&area, |reply| AreaCommand::ApplyPublication {
            publication,
            reply,
        })?
    }
}

/// An eventually-consistent gossip store hosting one or more areas.
pub struct KvStore {
    node_id: NodeId,
    config: Arc<Config>,
    areas: BTreeMap<AreaId, AreaHandle>,
    server: Option<MeshServerHandle>,
    queue: PublicationQueue,
    reader: UpdateReader,
}

impl KvStore {
    /// Validate the config, spawn the area loops, and start the mesh
    /// server with the default TCP transport.
    pub fn start(config: Config) -> Result<Self, StartError> {
        Self::start_with_factory(config, Arc::new(TcpClientFactory))
    }

    /// As [`KvStore::start`] but with a caller-supplied transport.
    pub fn start_with_factory(
        config: Config,
        factory: Arc<dyn PeerClientFactory>,
    ) -> Result<Self, StartError> {
        config.validate()?;
        let config = Arc::new(config);
        let node_id = config.node_id();
        let (queue, reader) = publication_queue(config.publication_queue_capacity);

        let mut areas = BTreeMap::new();
        for raw in &config.area_ids {
            let area = AreaId::parse(raw.clone()).expect("config validated");
            let handle = spawn_area(
                area.clone(),
                Arc::clone(&config),
                queue.clone(),
                Arc::clone(&factory),
            );
            areas.insert(area, handle);
        }

        let dispatch = AreaDispatch {
            areas: areas
                .iter()
                .map(|(area, handle)| (area.clone(), handle.tx.clone()))
                .collect(),
            read_timeout: config.read_timeout(),
        };
        let server = MeshServer::new(config.listen_addr.clone(), Arc::new(dispatch)).start()?;

        tracing::info!(
            target: "kvstore",
            node = %node_id,
            areas = areas.len(),
            addr = %server.local_addr(),
            "kvstore started"
        );
        Ok(Self {
            node_id,
            config,
            areas,
            server: Some(server),
            queue,
            reader,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Address peers should dial to reach this store.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(MeshServerHandle::local_addr)
    }

    /// This store's address packaged as a peer spec for other nodes.
    pub fn peer_spec(&self) -> Option<PeerSpec> {
        self.local_addr().map(|addr| PeerSpec::new(addr.to_string()))
    }

    /// The downstream consumer end of the publication stream.
    pub fn updates(&self) -> &UpdateReader {
        &self.reader
    }

    // ---- admin surface ----

    pub fn set_key_vals(
        &self,
        area: &AreaId,
        key_vals: BTreeMap<String, VersionedValue>,
        sender_ids: Option<Vec<NodeId>>,
    ) -> Result<(), StoreError> {
        self.call(area, |reply| AreaCommand::SetKeyVals {
            key_vals,
            sender_ids: sender_ids.unwrap_or_default(),
            reply,
        })?
    }

    /// Author `key` as this node with an auto-incremented version and the
    /// configured default TTL; the key joins the self-originated set and
    /// is kept alive by TTL refreshes.
    pub fn persist_key(
        &self,
        area: &AreaId,
        key: impl Into<String>,
        value: bytes::Bytes,
    ) -> Result<(), StoreError> {
        let key = key.into();
        self.call(area, |reply| AreaCommand::PersistKey { key, value, reply })?
    }

    pub fn get_key_vals(
        &self,
        area: &AreaId,
        keys: Vec<String>,
    ) -> Result<BTreeMap<String, VersionedValue>, StoreError> {
        self.call(area, |reply| AreaCommand::GetKeyVals { keys, reply })
    }

    pub fn get_key(
        &self,
        area: &AreaId,
        key: impl Into<String>,
    ) -> Result<Option<VersionedValue>, StoreError> {
        let key = key.into();
        let mut records = self.get_key_vals(area, vec![key.clone()])?;
        Ok(records.remove(&key))
    }

    pub fn dump(
        &self,
        area: &AreaId,
        filter: KeyDumpFilter,
    ) -> Result<BTreeMap<String, VersionedValue>, StoreError> {
        self.call(area, |reply| AreaCommand::Dump { filter, reply })
    }

    pub fn dump_hashes(
        &self,
        area: &AreaId,
        prefix: impl Into<String>,
    ) -> Result<BTreeMap<String, VersionedValue>, StoreError> {
        let prefix = prefix.into();
        self.call(area, |reply| AreaCommand::DumpHashes { prefix, reply })
    }

    pub fn dump_self_originated(
        &self,
        area: &AreaId,
    ) -> Result<BTreeMap<String, VersionedValue>, StoreError> {
        self.call(area, |reply| AreaCommand::DumpSelfOriginated { reply })
    }

    pub fn add_update_peers(
        &self,
        area: &AreaId,
        peers: BTreeMap<String, PeerSpec>,
    ) -> Result<(), StoreError> {
        self.call(area, |reply| AreaCommand::AddUpdatePeers { peers, reply })
    }

    pub fn del_peers(&self, area: &AreaId, names: Vec<String>) -> Result<(), StoreError> {
        self.call(area, |reply| AreaCommand::DelPeers { names, reply })
    }

    pub fn get_peer_state(
        &self,
        area: &AreaId,
        name: impl Into<String>,
    ) -> Result<Option<PeerState>, StoreError> {
        let name = name.into();
        self.call(area, |reply| AreaCommand::GetPeerState { name, reply })
    }

    pub fn get_peers(&self, area: &AreaId) -> Result<BTreeMap<String, PeerStatus>, StoreError> {
        self.call(area, |reply| AreaCommand::GetPeers { reply })
    }

    /// Summaries for the selected areas, or all areas when none named.
    pub fn get_area_summary(&self, areas: &[AreaId]) -> Result<Vec<AreaSummary>, StoreError> {
        let selected: Vec<&AreaId> = if areas.is_empty() {
            self.areas.keys().collect()
        } else {
            areas.iter().collect()
        };
        let mut summaries = Vec::with_capacity(selected.len());
        for area in selected {
            summaries.push(self.call(area, |reply| AreaCommand::Summary { reply })?);
        }
        Ok(summaries)
    }

    /// Stop every area loop, the server, and close the publication queue.
    /// Idempotent; in-flight remote RPCs are left to finish and their
    /// results discarded.
    pub fn stop(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };

        for handle in self.areas.values() {
            let _ = handle.tx.send(AreaCommand::Stop);
        }
        for (_, handle) in std::mem::take(&mut self.areas) {
            handle.join();
        }
        server.shutdown();
        self.queue.close();
        tracing::info!(target: "kvstore", node = %self.node_id, "kvstore stopped");
    }

    fn call<T>(
        &self,
        area: &AreaId,
        make: impl FnOnce(Sender<T>) -> AreaCommand,
    ) -> Result<T, StoreError>
    where
        T: Send,
    {
        if self.server.is_none() {
            return Err(StoreError::Stopped);
        }
        let handle = self
            .areas
            .get(area)
            .ok_or_else(|| StoreError::UnknownArea(area.to_string()))?;
        let (reply_tx, reply_rx) = crossbeam::channel::bounded(1);
        handle
            .tx
            .send(make(reply_tx))
            .map_err(|_| StoreError::Stopped)?;
        reply_rx
            .recv_timeout(self.config.read_timeout())
            .map_err(|err| match err {
                crossbeam::channel::RecvTimeoutError::Timeout => StoreError::Timeout,
                crossbeam::channel::RecvTimeoutError::Disconnected => StoreError::Stopped,
            })
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        self.stop();
    }
}
