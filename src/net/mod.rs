//! Mesh transport: framing, wire schema, and the RPC boundary traits.

mod client;
mod frame;
mod proto;
mod server;

pub use client::{PeerClient, PeerClientFactory, RpcError, TcpClientFactory};
pub use frame::{encode_frame, FrameError, FrameReader, FrameWriter, MAX_FRAME_BYTES};
pub use proto::{
    decode_envelope, encode_envelope, Ack, MeshEnvelope, MeshMessage, ProtoDecodeError,
    ProtoEncodeError, PublicationMsg, SyncRequest, SyncResponse, WireError, PROTOCOL_VERSION_V1,
};
pub use server::{InboundError, InboundHandler, MeshServer, MeshServerHandle, ServerError};
