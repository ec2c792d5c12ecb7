//! Pluggable serialization for message content.
//!
//! The network layer moves [`Message`] values across process boundaries but
//! has no knowledge of their concrete types. Hosts provide a [`ContentCodec`]
//! that turns content into bytes and back. [`JsonStringCodec`] ships as the
//! default: it handles `String` content, which is plenty for debugging and
//! for the test suites in this workspace.

use std::fmt;

use crate::Message;

/// Error type for codec operations.
#[derive(Debug)]
pub enum CodecError {
    /// Failed to encode content to bytes.
    Encode(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to content.
    Decode(Box<dyn std::error::Error + Send + Sync>),
    /// The content type is not supported by this codec.
    UnsupportedContent,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "encode error: {}", e),
            CodecError::Decode(e) => write!(f, "decode error: {}", e),
            CodecError::UnsupportedContent => write!(f, "unsupported content type"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Encode(e) | CodecError::Decode(e) => Some(e.as_ref()),
            CodecError::UnsupportedContent => None,
        }
    }
}

/// Serialization boundary for opaque message content.
///
/// Implementations must be cheap to share; they are called from the
/// multiplexer thread and from deserialization workers concurrently.
pub trait ContentCodec: Send + Sync + 'static {
    /// Encode content to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::UnsupportedContent` when the codec cannot handle
    /// the concrete content type, `CodecError::Encode` on serializer errors.
    fn encode(&self, content: &Message) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to content.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` when the bytes do not parse.
    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError>;
}

/// JSON codec for `String` content.
///
/// # Example
///
/// ```
/// use tidepool_core::{ContentCodec, JsonStringCodec, Message};
///
/// let codec = JsonStringCodec;
/// let bytes = codec.encode(&Message::new("hi".to_string())).unwrap();
/// let decoded = codec.decode(&bytes).unwrap();
/// assert_eq!(decoded.downcast_ref::<String>().map(String::as_str), Some("hi"));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStringCodec;

impl ContentCodec for JsonStringCodec {
    fn encode(&self, content: &Message) -> Result<Vec<u8>, CodecError> {
        let text = content
            .downcast_ref::<String>()
            .ok_or(CodecError::UnsupportedContent)?;
        serde_json::to_vec(text).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        let text: String =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(Box::new(e)))?;
        Ok(Message::new(text))
    }
}
