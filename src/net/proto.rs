//! Mesh protocol message schemas and CBOR encoding.
//!
//! Envelopes are string-keyed CBOR maps so fields can be added without
//! breaking older peers; unknown keys are skipped. Indefinite-length items
//! are rejected so that encodings round-trip bit-exactly between nodes.

use std::collections::BTreeMap;
use std::convert::Infallible;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::{AreaId, NodeId, Ttl, ValueHash, VersionedValue};

pub const PROTOCOL_VERSION_V1: u32 = 1;

const MAX_KEYS_PER_MESSAGE: u64 = 1 << 20;
const MAX_NODE_PATH_LEN: u64 = 1 << 10;
const MAX_TEXT_LEN: usize = 4 * 1024;
const MAX_VALUE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq)]
pub struct MeshEnvelope {
    pub version: u32,
    pub message: MeshMessage,
}

impl MeshEnvelope {
    pub fn v1(message: MeshMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION_V1,
            message,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MeshMessage {
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
    Publication(PublicationMsg),
    Ack(Ack),
    Error(WireError),
}

/// Phase one of a full-sync: the initiator's entire map, values stripped.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncRequest {
    pub area: AreaId,
    pub sender_id: NodeId,
    pub key_val_hashes: BTreeMap<String, VersionedValue>,
}

/// Phase two: full records where the responder dominates, metadata-only
/// markers where the initiator does.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncResponse {
    pub area: AreaId,
    pub key_vals: BTreeMap<String, VersionedValue>,
}

/// A flooded (or finalized-push) batch of records.
#[derive(Clone, Debug, PartialEq)]
pub struct PublicationMsg {
    pub area: AreaId,
    pub sender_id: NodeId,
    pub key_vals: BTreeMap<String, VersionedValue>,
    pub expired_keys: Vec<String>,
    /// Every node this publication has traversed, oldest first.
    pub node_path: Vec<NodeId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ack {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireError {
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageType {
    SyncRequest,
    SyncResponse,
    Publication,
    Ack,
    Error,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::SyncRequest => "SYNC_REQ",
            MessageType::SyncResponse => "SYNC_RESP",
            MessageType::Publication => "PUBLICATION",
            MessageType::Ack => "ACK",
            MessageType::Error => "ERROR",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SYNC_REQ" => Some(MessageType::SyncRequest),
            "SYNC_RESP" => Some(MessageType::SyncResponse),
            "PUBLICATION" => Some(MessageType::Publication),
            "ACK" => Some(MessageType::Ack),
            "ERROR" => Some(MessageType::Error),
            _ => None,
        }
    }
}

impl MeshMessage {
    fn message_type(&self) -> MessageType {
        match self {
            MeshMessage::SyncRequest(_) => MessageType::SyncRequest,
            MeshMessage::SyncResponse(_) => MessageType::SyncResponse,
            MeshMessage::Publication(_) => MessageType::Publication,
            MeshMessage::Ack(_) => MessageType::Ack,
            MeshMessage::Error(_) => MessageType::Error,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

pub fn encode_envelope(envelope: &MeshEnvelope) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("v")?;
    enc.u32(envelope.version)?;
    enc.str("type")?;
    enc.str(envelope.message.message_type().as_str())?;
    enc.str("body")?;
    match &envelope.message {
        MeshMessage::SyncRequest(msg) => encode_sync_request(&mut enc, msg)?,
        MeshMessage::SyncResponse(msg) => encode_sync_response(&mut enc, msg)?,
        MeshMessage::Publication(msg) => encode_publication(&mut enc, msg)?,
        MeshMessage::Ack(_) => {
            enc.map(0)?;
        }
        MeshMessage::Error(msg) => {
            enc.map(1)?;
            enc.str("message")?;
            enc.str(&msg.message)?;
        }
    }
    Ok(buf)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<MeshEnvelope, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec)?;

    let mut version = None;
    let mut message_type = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec)?;
        match key {
            "v" => version = Some(decode_u32(&mut dec, "v")?),
            "type" => {
                let raw = decode_text(&mut dec)?;
                message_type = Some(
                    MessageType::parse(raw)
                        .ok_or_else(|| ProtoDecodeError::UnknownMessageType(raw.to_string()))?,
                );
            }
            "body" => {
                let start = dec.position();
                dec.skip()?;
                body_span = Some((start, dec.position()));
            }
            _ => skip_unknown(&mut dec)?,
        }
    }

    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
    if version != PROTOCOL_VERSION_V1 {
        return Err(ProtoDecodeError::UnsupportedVersion(version));
    }
    let message_type = message_type.ok_or(ProtoDecodeError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(ProtoDecodeError::MissingField("body"))?;

    let mut body = Decoder::new(&bytes[start..end]);
    let message = match message_type {
        MessageType::SyncRequest => MeshMessage::SyncRequest(decode_sync_request(&mut body)?),
        MessageType::SyncResponse => MeshMessage::SyncResponse(decode_sync_response(&mut body)?),
        MessageType::Publication => MeshMessage::Publication(decode_publication(&mut body)?),
        MessageType::Ack => {
            let len = decode_map_len(&mut body)?;
            for _ in 0..len {
                decode_text(&mut body)?;
                skip_unknown(&mut body)?;
            }
            MeshMessage::Ack(Ack {})
        }
        MessageType::Error => {
            let len = decode_map_len(&mut body)?;
            let mut message = None;
            for _ in 0..len {
                match decode_text(&mut body)? {
                    "message" => message = Some(decode_text(&mut body)?.to_string()),
                    _ => skip_unknown(&mut body)?,
                }
            }
            MeshMessage::Error(WireError {
                message: message.ok_or(ProtoDecodeError::MissingField("message"))?,
            })
        }
    };

    Ok(MeshEnvelope { version, message })
}

fn encode_sync_request(
    enc: &mut Encoder<&mut Vec<u8>>,
    msg: &SyncRequest,
) -> Result<(), ProtoEncodeError> {
    enc.map(3)?;
    enc.str("area")?;
    enc.str(msg.area.as_str())?;
    enc.str("sender_id")?;
    enc.str(msg.sender_id.as_str())?;
    enc.str("key_val_hashes")?;
    encode_key_vals(enc, &msg.key_val_hashes)?;
    Ok(())
}

fn decode_sync_request(dec: &mut Decoder) -> Result<SyncRequest, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut area = None;
    let mut sender_id = None;
    let mut key_val_hashes = None;

    for _ in 0..map_len {
        match decode_text(dec)? {
            "area" => area = Some(decode_area(dec)?),
            "sender_id" => sender_id = Some(decode_node(dec, "sender_id")?),
            "key_val_hashes" => key_val_hashes = Some(decode_key_vals(dec)?),
            _ => skip_unknown(dec)?,
        }
    }

    Ok(SyncRequest {
        area: area.ok_or(ProtoDecodeError::MissingField("area"))?,
        sender_id: sender_id.ok_or(ProtoDecodeError::MissingField("sender_id"))?,
        key_val_hashes: key_val_hashes.ok_or(ProtoDecodeError::MissingField("key_val_hashes"))?,
    })
}

fn encode_sync_response(
    enc: &mut Encoder<&mut Vec<u8>>,
    msg: &SyncResponse,
) -> Result<(), ProtoEncodeError> {
    enc.map(2)?;
    enc.str("area")?;
    enc.str(msg.area.as_str())?;
    enc.str("key_vals")?;
    encode_key_vals(enc, &msg.key_vals)?;
    Ok(())
}

fn decode_sync_response(dec: &mut Decoder) -> Result<SyncResponse, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut area = None;
    let mut key_vals = None;

    for _ in 0..map_len {
        match decode_text(dec)? {
            "area" => area = Some(decode_area(dec)?),
            "key_vals" => key_vals = Some(decode_key_vals(dec)?),
            _ => skip_unknown(dec)?,
        }
    }

    Ok(SyncResponse {
        area: area.ok_or(ProtoDecodeError::MissingField("area"))?,
        key_vals: key_vals.ok_or(ProtoDecodeError::MissingField("key_vals"))?,
    })
}

fn encode_publication(
    enc: &mut Encoder<&mut Vec<u8>>,
    msg: &PublicationMsg,
) -> Result<(), ProtoEncodeError> {
    enc.map(5)?;
    enc.str("area")?;
    enc.str(msg.area.as_str())?;
    enc.str("sender_id")?;
    enc.str(msg.sender_id.as_str())?;
    enc.str("key_vals")?;
    encode_key_vals(enc, &msg.key_vals)?;
    enc.str("expired_keys")?;
    enc.array(msg.expired_keys.len() as u64)?;
    for key in &msg.expired_keys {
        enc.str(key)?;
    }
    enc.str("node_path")?;
    enc.array(msg.node_path.len() as u64)?;
    for node in &msg.node_path {
        enc.str(node.as_str())?;
    }
    Ok(())
}

fn decode_publication(dec: &mut Decoder) -> Result<PublicationMsg, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut area = None;
    let mut sender_id = None;
    let mut key_vals = None;
    let mut expired_keys = None;
    let mut node_path = None;

    for _ in 0..map_len {
        match decode_text(dec)? {
            "area" => area = Some(decode_area(dec)?),
            "sender_id" => sender_id = Some(decode_node(dec, "sender_id")?),
            "key_vals" => key_vals = Some(decode_key_vals(dec)?),
            "expired_keys" => {
                let len = decode_array_len(dec, MAX_KEYS_PER_MESSAGE)?;
                let mut keys = Vec::with_capacity(len);
                for _ in 0..len {
                    keys.push(decode_text(dec)?.to_string());
                }
                expired_keys = Some(keys);
            }
            "node_path" => {
                let len = decode_array_len(dec, MAX_NODE_PATH_LEN)?;
                let mut path = Vec::with_capacity(len);
                for _ in 0..len {
                    path.push(decode_node(dec, "node_path")?);
                }
                node_path = Some(path);
            }
            _ => skip_unknown(dec)?,
        }
    }

    Ok(PublicationMsg {
        area: area.ok_or(ProtoDecodeError::MissingField("area"))?,
        sender_id: sender_id.ok_or(ProtoDecodeError::MissingField("sender_id"))?,
        key_vals: key_vals.ok_or(ProtoDecodeError::MissingField("key_vals"))?,
        expired_keys: expired_keys.ok_or(ProtoDecodeError::MissingField("expired_keys"))?,
        node_path: node_path.ok_or(ProtoDecodeError::MissingField("node_path"))?,
    })
}

fn encode_key_vals(
    enc: &mut Encoder<&mut Vec<u8>>,
    key_vals: &BTreeMap<String, VersionedValue>,
) -> Result<(), ProtoEncodeError> {
    enc.map(key_vals.len() as u64)?;
    for (key, record) in key_vals {
        enc.str(key)?;
        encode_record(enc, record)?;
    }
    Ok(())
}

fn decode_key_vals(
    dec: &mut Decoder,
) -> Result<BTreeMap<String, VersionedValue>, ProtoDecodeError> {
    let len = decode_map_len(dec)?;
    if len as u64 > MAX_KEYS_PER_MESSAGE {
        return Err(ProtoDecodeError::DecodeLimit("max_keys_per_message"));
    }
    let mut out = BTreeMap::new();
    for _ in 0..len {
        let key = decode_text(dec)?.to_string();
        let record = decode_record(dec)?;
        out.insert(key, record);
    }
    Ok(out)
}

fn encode_record(
    enc: &mut Encoder<&mut Vec<u8>>,
    record: &VersionedValue,
) -> Result<(), ProtoEncodeError> {
    let len = if record.value.is_some() { 6 } else { 5 };
    enc.map(len)?;
    enc.str("version")?;
    enc.u64(record.version)?;
    enc.str("originator")?;
    enc.str(record.originator.as_str())?;
    if let Some(value) = &record.value {
        enc.str("value")?;
        enc.bytes(value)?;
    }
    enc.str("ttl")?;
    match record.ttl {
        Ttl::Infinite => {
            enc.null()?;
        }
        Ttl::Finite(ms) => {
            enc.u64(ms)?;
        }
    }
    enc.str("ttl_version")?;
    enc.u64(record.ttl_version)?;
    enc.str("hash")?;
    enc.bytes(&record.hash.0)?;
    Ok(())
}

fn decode_record(dec: &mut Decoder) -> Result<VersionedValue, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut version = None;
    let mut originator = None;
    let mut value = None;
    let mut ttl = None;
    let mut ttl_version = None;
    let mut hash = None;

    for _ in 0..map_len {
        match decode_text(dec)? {
            "version" => version = Some(dec.u64()?),
            "originator" => originator = Some(decode_node(dec, "originator")?),
            "value" => value = Some(decode_bytes(dec, "value", MAX_VALUE_BYTES)?),
            "ttl" => {
                ttl = Some(if dec.datatype()? == Type::Null {
                    dec.null()?;
                    Ttl::Infinite
                } else {
                    Ttl::Finite(dec.u64()?)
                });
            }
            "ttl_version" => ttl_version = Some(dec.u64()?),
            "hash" => {
                let raw = decode_bytes(dec, "hash", 32)?;
                let digest: [u8; 32] =
                    raw.as_ref()
                        .try_into()
                        .map_err(|_| ProtoDecodeError::InvalidField {
                            field: "hash",
                            reason: format!("expected 32 bytes, got {}", raw.len()),
                        })?;
                hash = Some(ValueHash(digest));
            }
            _ => skip_unknown(dec)?,
        }
    }

    let version = version.ok_or(ProtoDecodeError::MissingField("version"))?;
    if version == 0 {
        return Err(ProtoDecodeError::InvalidField {
            field: "version",
            reason: "version must be > 0".into(),
        });
    }

    Ok(VersionedValue::from_wire(
        version,
        originator.ok_or(ProtoDecodeError::MissingField("originator"))?,
        value,
        ttl.ok_or(ProtoDecodeError::MissingField("ttl"))?,
        ttl_version.ok_or(ProtoDecodeError::MissingField("ttl_version"))?,
        hash.ok_or(ProtoDecodeError::MissingField("hash"))?,
    ))
}

fn decode_area(dec: &mut Decoder) -> Result<AreaId, ProtoDecodeError> {
    let raw = decode_text(dec)?;
    AreaId::parse(raw).map_err(|e| ProtoDecodeError::InvalidField {
        field: "area",
        reason: e.to_string(),
    })
}

fn decode_node(dec: &mut Decoder, field: &'static str) -> Result<NodeId, ProtoDecodeError> {
    let raw = decode_text(dec)?;
    NodeId::parse(raw).map_err(|e| ProtoDecodeError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

fn decode_u32(dec: &mut Decoder, field: &'static str) -> Result<u32, ProtoDecodeError> {
    let raw = dec.u64()?;
    u32::try_from(raw).map_err(|_| ProtoDecodeError::InvalidField {
        field,
        reason: "value out of range for u32".to_string(),
    })
}

fn decode_map_len(dec: &mut Decoder) -> Result<usize, ProtoDecodeError> {
    let Some(len) = dec.map()? else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > MAX_KEYS_PER_MESSAGE {
        return Err(ProtoDecodeError::DecodeLimit("max_map_entries"));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit("max_map_entries"))
}

fn decode_array_len(dec: &mut Decoder, max: u64) -> Result<usize, ProtoDecodeError> {
    let Some(len) = dec.array()? else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > max {
        return Err(ProtoDecodeError::DecodeLimit("max_array_entries"));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit("max_array_entries"))
}

fn decode_text<'a>(dec: &mut Decoder<'a>) -> Result<&'a str, ProtoDecodeError> {
    if matches!(dec.datatype()?, Type::StringIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let s = dec.str()?;
    if s.len() > MAX_TEXT_LEN {
        return Err(ProtoDecodeError::DecodeLimit("max_text_len"));
    }
    Ok(s)
}

fn decode_bytes(
    dec: &mut Decoder,
    field: &'static str,
    max_len: usize,
) -> Result<Bytes, ProtoDecodeError> {
    if matches!(dec.datatype()?, Type::BytesIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let bytes = dec.bytes()?;
    if bytes.len() > max_len {
        return Err(ProtoDecodeError::InvalidField {
            field,
            reason: format!("length {} exceeds {max_len}", bytes.len()),
        });
    }
    Ok(Bytes::copy_from_slice(bytes))
}

fn skip_unknown(dec: &mut Decoder) -> Result<(), ProtoDecodeError> {
    if matches!(
        dec.datatype()?,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    dec.skip()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Ttl;

    fn node(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    fn area(s: &str) -> AreaId {
        AreaId::parse(s).unwrap()
    }

    fn record(version: u64, originator: &str, value: Option<&str>) -> VersionedValue {
        VersionedValue::new(
            version,
            node(originator),
            value.map(|v| Bytes::copy_from_slice(v.as_bytes())),
            Ttl::Finite(60_000),
            0,
        )
    }

    #[test]
    fn sync_request_roundtrip() {
        let mut key_val_hashes = BTreeMap::new();
        key_val_hashes.insert("prefix:key-1".to_string(), record(3, "node-1", Some("x")).metadata_only());
        let envelope = MeshEnvelope::v1(MeshMessage::SyncRequest(SyncRequest {
            area: area("area-1"),
            sender_id: node("node-1"),
            key_val_hashes,
        }));

        let bytes = encode_envelope(&envelope).unwrap();
        assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
    }

    #[test]
    fn publication_roundtrip_preserves_path_and_values() {
        let mut key_vals = BTreeMap::new();
        key_vals.insert("k1".to_string(), record(1, "node-1", Some("value1")));
        key_vals.insert("k2".to_string(), record(2, "node-2", None));
        let envelope = MeshEnvelope::v1(MeshMessage::Publication(PublicationMsg {
            area: area("area-1"),
            sender_id: node("node-2"),
            key_vals,
            expired_keys: vec!["gone".to_string()],
            node_path: vec![node("node-1"), node("node-2")],
        }));

        let bytes = encode_envelope(&envelope).unwrap();
        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded, envelope);

        // byte-exact re-encode: hash exchanges depend on it
        let reencoded = encode_envelope(&decoded).unwrap();
        assert_eq!(reencoded, bytes);
    }

    #[test]
    fn metadata_only_record_keeps_carried_hash() {
        let full = record(5, "node-1", Some("payload"));
        let mut key_vals = BTreeMap::new();
        key_vals.insert("k".to_string(), full.metadata_only());
        let envelope = MeshEnvelope::v1(MeshMessage::SyncResponse(SyncResponse {
            area: area("area-1"),
            key_vals,
        }));

        let bytes = encode_envelope(&envelope).unwrap();
        let MeshMessage::SyncResponse(resp) = decode_envelope(&bytes).unwrap().message else {
            panic!("expected sync response");
        };
        assert_eq!(resp.key_vals["k"].hash, full.hash);
        assert!(!resp.key_vals["k"].has_value());
    }

    #[test]
    fn rejects_zero_version() {
        let mut key_vals = BTreeMap::new();
        let mut bad = record(1, "node-1", Some("x"));
        bad.version = 0;
        key_vals.insert("k".to_string(), bad);
        let envelope = MeshEnvelope::v1(MeshMessage::SyncResponse(SyncResponse {
            area: area("area-1"),
            key_vals,
        }));
        let bytes = encode_envelope(&envelope).unwrap();
        assert!(matches!(
            decode_envelope(&bytes),
            Err(ProtoDecodeError::InvalidField { field: "version", .. })
        ));
    }

    #[test]
    fn rejects_unsupported_version() {
        let envelope = MeshEnvelope {
            version: 99,
            message: MeshMessage::Ack(Ack {}),
        };
        let bytes = encode_envelope(&envelope).unwrap();
        assert!(matches!(
            decode_envelope(&bytes),
            Err(ProtoDecodeError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let envelope = MeshEnvelope::v1(MeshMessage::Ack(Ack {}));
        let mut bytes = encode_envelope(&envelope).unwrap();
        bytes.push(0x00);
        assert!(matches!(
            decode_envelope(&bytes),
            Err(ProtoDecodeError::TrailingBytes)
        ));
    }

    #[test]
    fn error_message_roundtrip() {
        let envelope = MeshEnvelope::v1(MeshMessage::Error(WireError {
            message: "area mismatch".to_string(),
        }));
        let bytes = encode_envelope(&envelope).unwrap();
        assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
    }
}
