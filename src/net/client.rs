//! Outbound mesh RPC boundary.
//!
//! The sync engine and flooder talk to peers through [`PeerClient`]; the
//! TCP provider below is what production wiring installs, tests may swap
//! in their own factory.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

use super::frame::{FrameError, FrameReader, FrameWriter};
use super::proto::{
    decode_envelope, encode_envelope, MeshEnvelope, MeshMessage, ProtoDecodeError,
    ProtoEncodeError, PublicationMsg, SyncRequest, SyncResponse,
};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("encode error: {0}")]
    Encode(#[from] ProtoEncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] ProtoDecodeError),
    #[error("peer reported error: {0}")]
    Remote(String),
    #[error("peer sent unexpected {got} reply")]
    UnexpectedReply { got: &'static str },
    #[error("peer closed connection")]
    ConnectionClosed,
    #[error("peer address {addr:?} did not resolve")]
    AddrUnresolved { addr: String },
}

impl RpcError {
    /// Fold read-timeout io errors into the explicit timeout variant.
    fn from_read(err: FrameError, timeout: Duration) -> Self {
        match err {
            FrameError::Io(io)
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                RpcError::Timeout(timeout)
            }
            other => RpcError::Frame(other),
        }
    }
}

/// One peer's request/response channel. Calls are serialized by the owner
/// (the per-peer egress worker), so `&mut self` is enough.
pub trait PeerClient: Send {
    fn sync_hashes(
        &mut self,
        request: &SyncRequest,
        timeout: Duration,
    ) -> Result<SyncResponse, RpcError>;

    fn apply_publication(
        &mut self,
        publication: &PublicationMsg,
        timeout: Duration,
    ) -> Result<(), RpcError>;
}

/// Opens [`PeerClient`]s. The transport provider owns connection details;
/// the core only hands over the configured peer address.
pub trait PeerClientFactory: Send + Sync {
    fn connect(
        &self,
        addr: &str,
        connect_timeout: Duration,
    ) -> Result<Box<dyn PeerClient>, RpcError>;
}

/// TCP provider: one framed stream per peer, one request in flight.
pub struct TcpClientFactory;

impl PeerClientFactory for TcpClientFactory {
    fn connect(
        &self,
        addr: &str,
        connect_timeout: Duration,
    ) -> Result<Box<dyn PeerClient>, RpcError> {
        let resolved =
            addr.to_socket_addrs()?
                .next()
                .ok_or_else(|| RpcError::AddrUnresolved {
                    addr: addr.to_string(),
                })?;
        let stream = TcpStream::connect_timeout(&resolved, connect_timeout)?;
        stream.set_nodelay(true)?;
        let reader = FrameReader::new(stream.try_clone()?);
        let writer = FrameWriter::new(stream.try_clone()?);
        Ok(Box::new(TcpPeerClient {
            stream,
            reader,
            writer,
        }))
    }
}

struct TcpPeerClient {
    stream: TcpStream,
    reader: FrameReader<TcpStream>,
    writer: FrameWriter<TcpStream>,
}

impl TcpPeerClient {
    fn call(&mut self, message: MeshMessage, timeout: Duration) -> Result<MeshMessage, RpcError> {
        self.stream.set_read_timeout(Some(timeout))?;
        let bytes = encode_envelope(&MeshEnvelope::v1(message))?;
        self.writer.write_frame(&bytes)?;

        let reply = self
            .reader
            .read_next()
            .map_err(|e| RpcError::from_read(e, timeout))?
            .ok_or(RpcError::ConnectionClosed)?;
        let envelope = decode_envelope(&reply)?;
        match envelope.message {
            MeshMessage::Error(err) => Err(RpcError::Remote(err.message)),
            other => Ok(other),
        }
    }
}

impl PeerClient for TcpPeerClient {
    fn sync_hashes(
        &mut self,
        request: &SyncRequest,
        timeout: Duration,
    ) -> Result<SyncResponse, RpcError> {
        match self.call(MeshMessage::SyncRequest(request.clone()), timeout)? {
            MeshMessage::SyncResponse(response) => Ok(response),
            MeshMessage::SyncRequest(_) => Err(RpcError::UnexpectedReply { got: "SYNC_REQ" }),
            MeshMessage::Publication(_) => Err(RpcError::UnexpectedReply { got: "PUBLICATION" }),
            MeshMessage::Ack(_) => Err(RpcError::UnexpectedReply { got: "ACK" }),
            MeshMessage::Error(_) => unreachable!("errors handled in call"),
        }
    }

    fn apply_publication(
        &mut self,
        publication: &PublicationMsg,
        timeout: Duration,
    ) -> Result<(), RpcError> {
        match self.call(MeshMessage::Publication(publication.clone()), timeout)? {
            MeshMessage::Ack(_) => Ok(()),
            MeshMessage::SyncRequest(_) => Err(RpcError::UnexpectedReply { got: "SYNC_REQ" }),
            MeshMessage::SyncResponse(_) => Err(RpcError::UnexpectedReply { got: "SYNC_RESP" }),
            MeshMessage::Publication(_) => Err(RpcError::UnexpectedReply { got: "PUBLICATION" }),
            MeshMessage::Error(_) => unreachable!("errors handled in call"),
        }
    }
}
