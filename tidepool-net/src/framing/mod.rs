//! Framing layers between stream transports and message-oriented protocols.

/// RFC 6455 frame header codec and masking.
pub mod rfc6455;

/// The WebSocket framing layer.
pub mod websocket;

pub use websocket::{FramingOps, MessageOriented, WebSocketFraming};
