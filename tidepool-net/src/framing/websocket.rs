//! WebSocket framing (RFC 6455) between a stream transport and a
//! message-oriented layer.
//!
//! Inbound, the layer parses frames, unmasks payloads, reassembles
//! fragmented messages and hands complete text/binary messages upward.
//! Outbound, the upper layer fills a message buffer and the framing layer
//! ships it as a single frame, masked when acting as a client.
//!
//! Control frames: `ping` is answered with a `pong` carrying the identical
//! payload, `pong` is ignored, `connection_close` aborts the connection.

use tidepool_core::NodeId;

use crate::config::NetConfig;
use crate::error::NetError;
use crate::framing::rfc6455::{
    self, BINARY_FRAME, CONNECTION_CLOSE, CONTINUATION_FRAME, FrameHeader, PING, PONG, TEXT_FRAME,
};
use crate::multiplexer::ManagerWaker;
use crate::transport::contract::{Application, ReceivePolicy, TransportOps};

/// Upper bound for a frame including its header.
pub const MAX_FRAME_SIZE: u64 = i32::MAX as u64;

/// Outbound state shared between the framing layer and its upper layer.
pub struct WsOut {
    /// Mask outgoing frames with a fresh random key per frame. Clients must
    /// mask (the default); servers may disable.
    pub mask_outgoing_frames: bool,
    binary_buf: Vec<u8>,
    text_buf: String,
}

impl WsOut {
    fn fresh_mask(&self) -> u32 {
        if !self.mask_outgoing_frames {
            return 0;
        }
        loop {
            let key: u32 = rand::random();
            if key != 0 {
                return key;
            }
        }
    }
}

/// The downward interface the framing layer offers its upper layer.
pub struct FramingOps<'a> {
    out: &'a mut WsOut,
    ops: &'a mut dyn TransportOps,
}

impl FramingOps<'_> {
    /// Start a binary message.
    pub fn begin_binary_message(&mut self) {
        self.out.binary_buf.clear();
    }

    /// Buffer of the binary message under construction.
    pub fn binary_message_buffer(&mut self) -> &mut Vec<u8> {
        &mut self.out.binary_buf
    }

    /// Finish and ship the binary message as one frame.
    pub fn end_binary_message(&mut self) {
        let mask = self.out.fresh_mask();
        let mut frame = self.ops.next_header_buffer();
        rfc6455::assemble_frame(BINARY_FRAME, mask, &self.out.binary_buf, &mut frame);
        self.ops.write_packet(frame, Vec::new());
        self.out.binary_buf.clear();
    }

    /// Start a text message.
    pub fn begin_text_message(&mut self) {
        self.out.text_buf.clear();
    }

    /// Buffer of the text message under construction.
    pub fn text_message_buffer(&mut self) -> &mut String {
        &mut self.out.text_buf
    }

    /// Finish and ship the text message as one frame.
    pub fn end_text_message(&mut self) {
        let mask = self.out.fresh_mask();
        let mut frame = self.ops.next_header_buffer();
        rfc6455::assemble_frame(TEXT_FRAME, mask, self.out.text_buf.as_bytes(), &mut frame);
        self.ops.write_packet(frame, Vec::new());
        self.out.text_buf.clear();
    }

    /// Whether the transport accepts more output.
    pub fn can_send_more(&self) -> bool {
        self.ops.can_send_more()
    }

    /// Record an abort reason on the transport.
    pub fn abort_reason(&mut self, reason: NetError) {
        self.ops.abort_reason(reason);
    }
}

/// A message-oriented protocol above the framing layer.
pub trait MessageOriented {
    /// Called once at connection setup.
    fn init(
        &mut self,
        owner: &ManagerWaker,
        down: &mut FramingOps<'_>,
        cfg: &NetConfig,
    ) -> Result<(), NetError> {
        let _ = (owner, down, cfg);
        Ok(())
    }

    /// A complete text message arrived. Negative return aborts.
    fn consume_text(&mut self, down: &mut FramingOps<'_>, text: &str) -> isize;

    /// A complete binary message arrived. Negative return aborts.
    fn consume_binary(&mut self, down: &mut FramingOps<'_>, payload: &[u8]) -> isize;

    /// Produce pending output; `false` on error.
    fn prepare_send(&mut self, down: &mut FramingOps<'_>) -> bool {
        let _ = down;
        true
    }

    /// Output drained; `true` when nothing more is pending.
    fn done_sending(&mut self, down: &mut FramingOps<'_>) -> bool {
        let _ = down;
        true
    }

    /// The connection is going away.
    fn abort(&mut self, reason: &NetError) {
        let _ = reason;
    }
}

/// WebSocket framing layer over a stream transport.
pub struct WebSocketFraming<U: MessageOriented> {
    upper: U,
    out: WsOut,
    /// Opcode of the fragmented message in flight, if any.
    opcode: Option<u8>,
    /// Reassembly buffer for fragmented messages.
    payload_buf: Vec<u8>,
}

impl<U: MessageOriented> WebSocketFraming<U> {
    /// Wrap an upper layer; outgoing frames are masked (client behavior).
    pub fn new(upper: U) -> Self {
        Self {
            upper,
            out: WsOut {
                mask_outgoing_frames: true,
                binary_buf: Vec::new(),
                text_buf: String::new(),
            },
            opcode: None,
            payload_buf: Vec::new(),
        }
    }

    /// Server-side constructor: outgoing frames stay unmasked.
    pub fn new_server(upper: U) -> Self {
        let mut layer = Self::new(upper);
        layer.out.mask_outgoing_frames = false;
        layer
    }

    /// Access the upper layer.
    pub fn upper_layer(&self) -> &U {
        &self.upper
    }

    /// Mutable access to the upper layer.
    pub fn upper_layer_mut(&mut self) -> &mut U {
        &mut self.upper
    }

    fn ship_pong(&mut self, down: &mut dyn TransportOps, payload: &[u8]) {
        let mask = self.out.fresh_mask();
        let mut frame = down.next_header_buffer();
        rfc6455::assemble_frame(PONG, mask, payload, &mut frame);
        down.write_packet(frame, Vec::new());
    }

    /// Dispatch one complete message. Returns `false` to abort.
    fn handle(&mut self, down: &mut dyn TransportOps, opcode: u8, payload: &[u8]) -> bool {
        match opcode {
            TEXT_FRAME => {
                let Ok(text) = std::str::from_utf8(payload) else {
                    down.abort_reason(NetError::runtime("invalid UTF-8 in WebSocket text frame"));
                    return false;
                };
                let mut ops = FramingOps {
                    out: &mut self.out,
                    ops: down,
                };
                self.upper.consume_text(&mut ops, text) >= 0
            }
            BINARY_FRAME => {
                let mut ops = FramingOps {
                    out: &mut self.out,
                    ops: down,
                };
                self.upper.consume_binary(&mut ops, payload) >= 0
            }
            CONNECTION_CLOSE => {
                down.abort_reason(NetError::ConnectionClosed);
                false
            }
            PING => {
                self.ship_pong(down, payload);
                true
            }
            PONG => true,
            _ => {
                // Only a continuation frame reaches this point, and only
                // without a prior opcode.
                down.abort_reason(NetError::runtime(
                    "invalid WebSocket continuation frame (no prior opcode)",
                ));
                false
            }
        }
    }
}

impl<U: MessageOriented> Application for WebSocketFraming<U> {
    fn init(
        &mut self,
        owner: &ManagerWaker,
        down: &mut dyn TransportOps,
        cfg: &NetConfig,
    ) -> Result<(), NetError> {
        {
            let mut ops = FramingOps {
                out: &mut self.out,
                ops: down,
            };
            self.upper.init(owner, &mut ops, cfg)?;
        }
        down.configure_read(ReceivePolicy::AtMost(2048));
        Ok(())
    }

    fn consume(&mut self, down: &mut dyn TransportOps, input: &[u8]) -> isize {
        let mut buffer = input;
        let mut consumed: isize = 0;
        // Parse all frames in the current input.
        loop {
            let mut hdr = FrameHeader::default();
            let hdr_bytes = rfc6455::decode_header(buffer, &mut hdr);
            if hdr_bytes < 0 {
                down.abort_reason(NetError::runtime("invalid WebSocket frame header"));
                return -1;
            }
            if hdr_bytes == 0 {
                down.configure_read(ReceivePolicy::AtMost(2048));
                return consumed;
            }
            if hdr.payload_len >= MAX_FRAME_SIZE - hdr_bytes as u64 {
                down.abort_reason(NetError::runtime("WebSocket frame too large"));
                return -1;
            }
            let payload_len = hdr.payload_len as usize;
            let frame_size = hdr_bytes as usize + payload_len;
            if buffer.len() < frame_size {
                down.configure_read(ReceivePolicy::Exactly(frame_size));
                return consumed;
            }
            let mut payload = buffer[hdr_bytes as usize..frame_size].to_vec();
            if hdr.mask_key != 0 {
                rfc6455::mask_data(hdr.mask_key, &mut payload);
            }
            if hdr.fin {
                match self.opcode {
                    None => {
                        if !self.handle(down, hdr.opcode, &payload) {
                            return -1;
                        }
                    }
                    Some(_) if hdr.opcode != CONTINUATION_FRAME => {
                        down.abort_reason(NetError::runtime(
                            "invalid WebSocket frame (expected a continuation frame)",
                        ));
                        return -1;
                    }
                    Some(opcode) => {
                        if self.payload_buf.len() + payload_len > MAX_FRAME_SIZE as usize {
                            down.abort_reason(NetError::runtime(
                                "fragmented WebSocket payload exceeds maximum size",
                            ));
                            return -1;
                        }
                        // End of fragmented input.
                        self.payload_buf.extend_from_slice(&payload);
                        let assembled = std::mem::take(&mut self.payload_buf);
                        self.opcode = None;
                        if !self.handle(down, opcode, &assembled) {
                            return -1;
                        }
                    }
                }
            } else {
                match self.opcode {
                    None => {
                        if hdr.opcode == CONTINUATION_FRAME {
                            down.abort_reason(NetError::runtime(
                                "invalid WebSocket continuation frame (no prior opcode)",
                            ));
                            return -1;
                        }
                        self.opcode = Some(hdr.opcode);
                        self.payload_buf.extend_from_slice(&payload);
                    }
                    Some(_) => {
                        if self.payload_buf.len() + payload_len > MAX_FRAME_SIZE as usize {
                            down.abort_reason(NetError::runtime(
                                "fragmented WebSocket payload exceeds maximum size",
                            ));
                            return -1;
                        }
                        self.payload_buf.extend_from_slice(&payload);
                    }
                }
            }
            consumed += frame_size as isize;
            if buffer.len() == frame_size {
                down.configure_read(ReceivePolicy::AtMost(2048));
                return consumed;
            }
            buffer = &buffer[frame_size..];
        }
    }

    fn prepare_send(&mut self, down: &mut dyn TransportOps) -> bool {
        let mut ops = FramingOps {
            out: &mut self.out,
            ops: down,
        };
        self.upper.prepare_send(&mut ops)
    }

    fn done_sending(&mut self, down: &mut dyn TransportOps) -> bool {
        let mut ops = FramingOps {
            out: &mut self.out,
            ops: down,
        };
        self.upper.done_sending(&mut ops)
    }

    fn abort(&mut self, reason: &NetError) {
        self.upper.abort(reason);
    }

    fn peer(&self) -> Option<NodeId> {
        None
    }
}
