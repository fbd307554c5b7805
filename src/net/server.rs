//! Mesh server accept loop.
//!
//! Connection threads decode framed envelopes and hand every request to
//! the owning area loop through [`InboundHandler`]; no store state is
//! touched on transport threads.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use super::frame::{FrameReader, FrameWriter};
use super::proto::{
    decode_envelope, encode_envelope, Ack, MeshEnvelope, MeshMessage, PublicationMsg, SyncRequest,
    SyncResponse, WireError,
};

/// Dispatch surface the multiplexer provides: both calls run on the area
/// loop owning the request's area and return its reply.
pub trait InboundHandler: Send + Sync {
    fn handle_sync_hashes(&self, request: SyncRequest) -> Result<SyncResponse, InboundError>;
    fn handle_publication(&self, publication: PublicationMsg) -> Result<Ack, InboundError>;
}

#[derive(Debug, Error)]
pub enum InboundError {
    #[error("unknown area {0}")]
    UnknownArea(String),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("store is stopping")]
    Stopping,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct MeshServer {
    listen_addr: String,
    handler: Arc<dyn InboundHandler>,
}

pub struct MeshServerHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl MeshServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }
}

impl MeshServer {
    pub fn new(listen_addr: impl Into<String>, handler: Arc<dyn InboundHandler>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handler,
        }
    }

    pub fn start(self) -> Result<MeshServerHandle, ServerError> {
        let listener = TcpListener::bind(&self.listen_addr)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_shutdown = Arc::clone(&shutdown);
        let handler = self.handler;
        let join = thread::spawn(move || run_accept_loop(listener, handler, accept_shutdown));

        tracing::info!(target: "mesh", %local_addr, "mesh server listening");
        Ok(MeshServerHandle {
            shutdown,
            join,
            local_addr,
        })
    }
}

fn run_accept_loop(
    listener: TcpListener,
    handler: Arc<dyn InboundHandler>,
    shutdown: Arc<AtomicBool>,
) {
    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!(target: "mesh", "server failed to set nonblocking: {err}");
        return;
    }

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let handler = Arc::clone(&handler);
                let conn_shutdown = Arc::clone(&shutdown);
                thread::spawn(move || {
                    if let Err(err) = run_connection(stream, handler, conn_shutdown) {
                        tracing::debug!(target: "mesh", %peer_addr, "inbound connection ended: {err}");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                tracing::warn!(target: "mesh", "accept error: {err}");
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn run_connection(
    stream: TcpStream,
    handler: Arc<dyn InboundHandler>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    // Bounded read so the thread notices shutdown on an idle connection.
    stream.set_read_timeout(Some(Duration::from_millis(250)))?;
    let mut reader = FrameReader::new(stream.try_clone()?);
    let mut writer = FrameWriter::new(stream);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }

        let frame = match reader.read_next() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(super::frame::FrameError::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    err.to_string(),
                ));
            }
        };

        let reply = match decode_envelope(&frame) {
            Ok(envelope) => dispatch(&*handler, envelope.message),
            Err(err) => {
                crate::counters::bump(crate::counters::PROTOCOL_VIOLATIONS);
                tracing::warn!(target: "mesh", "dropping malformed envelope: {err}");
                MeshMessage::Error(WireError {
                    message: err.to_string(),
                })
            }
        };

        let bytes = encode_envelope(&MeshEnvelope::v1(reply))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        writer
            .write_frame(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()))?;
    }
}

fn dispatch(handler: &dyn InboundHandler, message: MeshMessage) -> MeshMessage {
    match message {
        MeshMessage::SyncRequest(request) => match handler.handle_sync_hashes(request) {
            Ok(response) => MeshMessage::SyncResponse(response),
            Err(err) => inbound_error(err),
        },
        MeshMessage::Publication(publication) => match handler.handle_publication(publication) {
            Ok(ack) => MeshMessage::Ack(ack),
            Err(err) => inbound_error(err),
        },
        MeshMessage::SyncResponse(_) | MeshMessage::Ack(_) | MeshMessage::Error(_) => {
            crate::counters::bump(crate::counters::PROTOCOL_VIOLATIONS);
            MeshMessage::Error(WireError {
                message: "unexpected message on server channel".to_string(),
            })
        }
    }
}

fn inbound_error(err: InboundError) -> MeshMessage {
    if matches!(err, InboundError::UnknownArea(_) | InboundError::Malformed(_)) {
        crate::counters::bump(crate::counters::PROTOCOL_VIOLATIONS);
    }
    MeshMessage::Error(WireError {
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AreaId, NodeId};
    use crate::net::client::{PeerClient, PeerClientFactory, TcpClientFactory};
    use std::collections::BTreeMap;

    struct EchoHandler;

    impl InboundHandler for EchoHandler {
        fn handle_sync_hashes(&self, request: SyncRequest) -> Result<SyncResponse, InboundError> {
            Ok(SyncResponse {
                area: request.area,
                key_vals: BTreeMap::new(),
            })
        }

        fn handle_publication(&self, _: PublicationMsg) -> Result<Ack, InboundError> {
            Err(InboundError::UnknownArea("area-x".to_string()))
        }
    }

    #[test]
    fn serves_sync_and_reports_errors() {
        let server = MeshServer::new("127.0.0.1:0", Arc::new(EchoHandler));
        let handle = server.start().unwrap();
        let addr = handle.local_addr().to_string();

        let timeout = Duration::from_secs(1);
        let mut client = TcpClientFactory.connect(&addr, timeout).unwrap();

        let response = client
            .sync_hashes(
                &SyncRequest {
                    area: AreaId::parse("area-1").unwrap(),
                    sender_id: NodeId::parse("node-1").unwrap(),
                    key_val_hashes: BTreeMap::new(),
                },
                timeout,
            )
            .unwrap();
        assert!(response.key_vals.is_empty());

        let err = client
            .apply_publication(
                &PublicationMsg {
                    area: AreaId::parse("area-x").unwrap(),
                    sender_id: NodeId::parse("node-1").unwrap(),
                    key_vals: BTreeMap::new(),
                    expired_keys: Vec::new(),
                    node_path: vec![NodeId::parse("node-1").unwrap()],
                },
                timeout,
            )
            .unwrap_err();
        assert!(matches!(err, crate::net::RpcError::Remote(_)));

        handle.shutdown();
    }
}
