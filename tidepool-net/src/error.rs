//! Error taxonomy for the networking layer.
//!
//! Decode and protocol errors are fatal for the connection they occur on:
//! the error becomes the socket manager's abort reason, the protocol state
//! machine enters its terminal state, pending resolves fail with
//! [`NetError::RemoteLookupFailed`] and the peer's proxies are erased.
//! Conditions local to a single message (unknown response id, missing
//! receiver) are logged and dropped instead.

use tidepool_core::WireError;

/// Errors surfaced by transports, framing layers and the protocol engine.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// A frame announced more or fewer bytes than were delivered.
    #[error("unexpected number of bytes")]
    UnexpectedNumberOfBytes,

    /// The first frame of a connection was not a handshake.
    #[error("missing handshake")]
    MissingHandshake,

    /// A handshake arrived on an established connection.
    #[error("unexpected handshake")]
    UnexpectedHandshake,

    /// The peer speaks a different protocol version.
    #[error("version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Locally supported version.
        expected: u64,
        /// Version announced by the peer.
        got: u64,
    },

    /// A frame that requires a payload arrived without one.
    #[error("missing payload")]
    MissingPayload,

    /// Handshake payload carried an invalid node id or no app identifiers.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// No common application identifier with the peer.
    #[error("app identifiers mismatch")]
    AppIdentifiersMismatch,

    /// A payload did not match its schema.
    #[error("invalid payload: {reason}")]
    InvalidPayload {
        /// What failed to parse.
        reason: String,
    },

    /// A payload arrived where none is allowed.
    #[error("unexpected payload")]
    UnexpectedPayload,

    /// Bytes arrived on a connection in a terminal state.
    #[error("illegal state")]
    IllegalState,

    /// Unknown message type on the wire.
    #[error("unimplemented message type {message_type}")]
    Unimplemented {
        /// The raw type byte.
        message_type: u8,
    },

    /// A pending resolve was abandoned (connection closed underneath it).
    #[error("remote lookup failed")]
    RemoteLookupFailed,

    /// The peer closed the connection (e.g. a WebSocket close frame).
    #[error("connection closed")]
    ConnectionClosed,

    /// Framing violation without a more specific code.
    #[error("runtime error: {reason}")]
    RuntimeError {
        /// Description of the violation.
        reason: String,
    },

    /// The multiplexer is shutting down.
    #[error("shutting down")]
    ShuttingDown,

    /// Socket-level failure reported by the operating system.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Shorthand for [`NetError::RuntimeError`].
    pub fn runtime(reason: impl Into<String>) -> Self {
        NetError::RuntimeError {
            reason: reason.into(),
        }
    }

    /// Clone-lite: reproduce the error for fan-out to multiple listeners.
    ///
    /// `std::io::Error` is not `Clone`; io errors are replicated by kind.
    pub fn replicate(&self) -> Self {
        match self {
            NetError::UnexpectedNumberOfBytes => NetError::UnexpectedNumberOfBytes,
            NetError::MissingHandshake => NetError::MissingHandshake,
            NetError::UnexpectedHandshake => NetError::UnexpectedHandshake,
            NetError::VersionMismatch { expected, got } => NetError::VersionMismatch {
                expected: *expected,
                got: *got,
            },
            NetError::MissingPayload => NetError::MissingPayload,
            NetError::InvalidHandshake => NetError::InvalidHandshake,
            NetError::AppIdentifiersMismatch => NetError::AppIdentifiersMismatch,
            NetError::InvalidPayload { reason } => NetError::InvalidPayload {
                reason: reason.clone(),
            },
            NetError::UnexpectedPayload => NetError::UnexpectedPayload,
            NetError::IllegalState => NetError::IllegalState,
            NetError::Unimplemented { message_type } => NetError::Unimplemented {
                message_type: *message_type,
            },
            NetError::RemoteLookupFailed => NetError::RemoteLookupFailed,
            NetError::ConnectionClosed => NetError::ConnectionClosed,
            NetError::RuntimeError { reason } => NetError::RuntimeError {
                reason: reason.clone(),
            },
            NetError::ShuttingDown => NetError::ShuttingDown,
            NetError::Io(err) => NetError::Io(std::io::Error::new(err.kind(), err.to_string())),
        }
    }

    /// Convert to an exit reason for proxies and bounced requests.
    pub fn to_exit_reason(&self) -> tidepool_core::ExitReason {
        tidepool_core::ExitReason::Remote(self.to_string())
    }
}

impl From<WireError> for NetError {
    fn from(err: WireError) -> Self {
        NetError::InvalidPayload {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_strings() {
        assert_eq!(NetError::MissingHandshake.to_string(), "missing handshake");
        assert_eq!(
            NetError::VersionMismatch {
                expected: 1,
                got: 3
            }
            .to_string(),
            "version mismatch: expected 1, got 3"
        );
    }

    #[test]
    fn test_wire_error_maps_to_invalid_payload() {
        let err: NetError = WireError::InvalidUtf8.into();
        assert!(matches!(err, NetError::InvalidPayload { .. }));
    }

    #[test]
    fn test_replicate_preserves_kind() {
        let err = NetError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        match err.replicate() {
            NetError::Io(io) => assert_eq!(io.kind(), std::io::ErrorKind::ConnectionReset),
            other => panic!("unexpected replica: {other:?}"),
        }
    }
}
