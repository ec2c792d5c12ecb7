//! Payload schemas for BASP frames.
//!
//! All payloads go through the host's binary codec: big-endian integers,
//! `u32` length prefixes for strings and blobs, `u32` counts for lists.

use tidepool_core::{ActorId, BinaryReader, BinaryWriter, ExitReason, NodeId};

use crate::error::NetError;

/// Handshake payload: the announcing node plus its application identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    /// Identity of the sending process.
    pub node: NodeId,
    /// Application identifiers; peers must share at least one.
    pub app_identifiers: Vec<String>,
}

impl HandshakePayload {
    /// Serialize into `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut writer = BinaryWriter::new(buf);
        writer.write_node_id(&self.node);
        writer.write_string_list(&self.app_identifiers);
    }

    /// Parse from `payload`.
    pub fn decode(payload: &[u8]) -> Result<Self, NetError> {
        let mut reader = BinaryReader::new(payload);
        let node = reader.read_node_id()?;
        let app_identifiers = reader.read_string_list()?;
        Ok(Self {
            node,
            app_identifiers,
        })
    }
}

/// Actor message payload: routing data plus opaque content bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorMessagePayload {
    /// Node of the sending actor; invalid for anonymous senders.
    pub source_node: NodeId,
    /// Sending actor; `0` for anonymous senders.
    pub source_id: ActorId,
    /// Receiving actor on this node.
    pub dest_id: ActorId,
    /// Remaining forwarding stages.
    pub stages: Vec<ActorId>,
    /// Serialized message content.
    pub content: Vec<u8>,
}

impl ActorMessagePayload {
    /// Serialize into `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut writer = BinaryWriter::new(buf);
        writer.write_node_id(&self.source_node);
        writer.write_u64(self.source_id);
        writer.write_u64(self.dest_id);
        writer.write_u32(self.stages.len() as u32);
        for stage in &self.stages {
            writer.write_u64(*stage);
        }
        writer.write_bytes(&self.content);
    }

    /// Parse from `payload`.
    pub fn decode(payload: &[u8]) -> Result<Self, NetError> {
        let mut reader = BinaryReader::new(payload);
        let source_node = reader.read_node_id()?;
        let source_id = reader.read_u64()?;
        let dest_id = reader.read_u64()?;
        let stage_count = reader.read_u32()? as usize;
        let mut stages = Vec::with_capacity(stage_count.min(16));
        for _ in 0..stage_count {
            stages.push(reader.read_u64()?);
        }
        let content = reader.read_bytes()?.to_vec();
        if !reader.is_empty() {
            return Err(NetError::InvalidPayload {
                reason: "trailing bytes after actor message".to_string(),
            });
        }
        Ok(Self {
            source_node,
            source_id,
            dest_id,
            stages,
            content,
        })
    }
}

/// Resolve response payload: actor id (0 on miss) plus interface names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveResponsePayload {
    /// Resolved actor, `0` when the path is unknown.
    pub id: ActorId,
    /// Messaging interface names of the resolved actor.
    pub interfaces: Vec<String>,
}

impl ResolveResponsePayload {
    /// Serialize into `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut writer = BinaryWriter::new(buf);
        writer.write_u64(self.id);
        writer.write_string_list(&self.interfaces);
    }

    /// Parse from `payload`.
    pub fn decode(payload: &[u8]) -> Result<Self, NetError> {
        let mut reader = BinaryReader::new(payload);
        let id = reader.read_u64()?;
        let interfaces = reader.read_string_list()?;
        Ok(Self { id, interfaces })
    }
}

/// Parse a resolve request: exactly one length-prefixed path string.
pub fn decode_resolve_request(payload: &[u8]) -> Result<String, NetError> {
    let mut reader = BinaryReader::new(payload);
    let path = reader.read_string()?;
    if !reader.is_empty() {
        return Err(NetError::InvalidPayload {
            reason: "trailing bytes after resolve path".to_string(),
        });
    }
    Ok(path)
}

/// Serialize a resolve request path.
pub fn encode_resolve_request(path: &str, buf: &mut Vec<u8>) {
    BinaryWriter::new(buf).write_string(path);
}

/// Parse a down-message reason.
pub fn decode_down_message(payload: &[u8]) -> Result<ExitReason, NetError> {
    let mut reader = BinaryReader::new(payload);
    let reason = reader.read_exit_reason()?;
    Ok(reason)
}

/// Serialize a down-message reason.
pub fn encode_down_message(reason: &ExitReason, buf: &mut Vec<u8>) {
    BinaryWriter::new(buf).write_exit_reason(reason);
}
