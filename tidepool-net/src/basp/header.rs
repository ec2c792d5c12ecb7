//! BASP frame header.
//!
//! Every frame on the wire is `header || payload` where the header occupies
//! exactly [`HEADER_SIZE`] bytes: one type byte, a big-endian `u32` payload
//! length, and a big-endian `u64` operand whose meaning depends on the type
//! (protocol version, message id, request id, or actor id).

use crate::error::NetError;

/// Protocol version announced and required in handshakes.
pub const VERSION: u64 = 1;

/// Size of a serialized header: type (1) + payload length (4) + operand (8).
pub const HEADER_SIZE: usize = 13;

/// First header field; determines the interpretation of the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Announces protocol version, node id and application identifiers.
    Handshake = 0x00,
    /// Carries an actor-to-actor message.
    ActorMessage = 0x01,
    /// Asks the receiver to resolve a local path.
    ResolveRequest = 0x02,
    /// Answers a resolve request.
    ResolveResponse = 0x03,
    /// Announces a proxy for one of the receiver's actors; the receiver
    /// attaches a lifetime monitor.
    MonitorMessage = 0x04,
    /// Reports the termination of a monitored actor.
    DownMessage = 0x05,
    /// Keep-alive traffic; carries nothing.
    Heartbeat = 0x06,
}

impl TryFrom<u8> for MessageType {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self, NetError> {
        match value {
            0x00 => Ok(MessageType::Handshake),
            0x01 => Ok(MessageType::ActorMessage),
            0x02 => Ok(MessageType::ResolveRequest),
            0x03 => Ok(MessageType::ResolveResponse),
            0x04 => Ok(MessageType::MonitorMessage),
            0x05 => Ok(MessageType::DownMessage),
            0x06 => Ok(MessageType::Heartbeat),
            other => Err(NetError::Unimplemented {
                message_type: other,
            }),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Handshake => "handshake",
            MessageType::ActorMessage => "actor_message",
            MessageType::ResolveRequest => "resolve_request",
            MessageType::ResolveResponse => "resolve_response",
            MessageType::MonitorMessage => "monitor_message",
            MessageType::DownMessage => "down_message",
            MessageType::Heartbeat => "heartbeat",
        };
        f.write_str(name)
    }
}

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message kind.
    pub ty: MessageType,
    /// Exact number of payload bytes following the header.
    pub payload_len: u32,
    /// Per-type operand.
    pub operation_data: u64,
}

impl Header {
    /// Build a header with zero payload length (fixed up at serialization
    /// time for frames that carry one).
    pub const fn new(ty: MessageType, operation_data: u64) -> Self {
        Self {
            ty,
            payload_len: 0,
            operation_data,
        }
    }

    /// Serialize into a buffer, appending [`HEADER_SIZE`] bytes.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.ty as u8);
        buf.extend_from_slice(&self.payload_len.to_be_bytes());
        buf.extend_from_slice(&self.operation_data.to_be_bytes());
    }

    /// Deserialize from a buffer holding at least [`HEADER_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// `UnexpectedNumberOfBytes` on short input, `Unimplemented` on an
    /// unknown type byte.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetError> {
        if bytes.len() < HEADER_SIZE {
            return Err(NetError::UnexpectedNumberOfBytes);
        }
        let ty = MessageType::try_from(bytes[0])?;
        let payload_len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let mut operand = [0u8; 8];
        operand.copy_from_slice(&bytes[5..13]);
        Ok(Self {
            ty,
            payload_len,
            operation_data: u64::from_be_bytes(operand),
        })
    }
}

impl std::fmt::Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(payload_len={}, op={})",
            self.ty, self.payload_len, self.operation_data
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let hdr = Header {
            ty: MessageType::ResolveRequest,
            payload_len: 42,
            operation_data: 0xDEADBEEF,
        };
        let mut buf = Vec::new();
        hdr.write_to(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = Header::from_bytes(&buf).expect("decode");
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn test_wire_layout() {
        let hdr = Header {
            ty: MessageType::ActorMessage,
            payload_len: 0x01020304,
            operation_data: 0x1122334455667788,
        };
        let mut buf = Vec::new();
        hdr.write_to(&mut buf);
        assert_eq!(
            buf,
            vec![0x01, 0x01, 0x02, 0x03, 0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
        );
    }

    #[test]
    fn test_short_input() {
        let err = Header::from_bytes(&[0x00; HEADER_SIZE - 1]).expect_err("short");
        assert!(matches!(err, NetError::UnexpectedNumberOfBytes));
    }

    #[test]
    fn test_unknown_type() {
        let mut buf = vec![0xEE];
        buf.extend_from_slice(&[0; 12]);
        let err = Header::from_bytes(&buf).expect_err("unknown type");
        assert!(matches!(err, NetError::Unimplemented { message_type: 0xEE }));
    }

    #[test]
    fn test_all_types_roundtrip() {
        for ty in [
            MessageType::Handshake,
            MessageType::ActorMessage,
            MessageType::ResolveRequest,
            MessageType::ResolveResponse,
            MessageType::MonitorMessage,
            MessageType::DownMessage,
            MessageType::Heartbeat,
        ] {
            assert_eq!(MessageType::try_from(ty as u8).expect("known"), ty);
        }
    }
}
