//! Contracts between the protocol layers.
//!
//! A connection is a fixed stack assembled at construction time:
//! a transport at the bottom (owns the socket, buffers bytes), optionally a
//! framing layer, and an application on top. Layers talk through two narrow
//! interfaces:
//!
//! - downward, the transport exposes [`TransportOps`] (buffers, packet
//!   output, read policy, abort reason);
//! - upward, the transport drives an [`Application`] (consume bytes, produce
//!   pending output, observe aborts).
//!
//! The endpoint manager in turn drives a whole stack through the
//! [`Transport`] trait.

use tidepool_core::{ActorId, ActorRef, ExitReason, MailboxElement, NodeId};

use crate::config::NetConfig;
use crate::error::NetError;
use crate::multiplexer::ManagerWaker;

/// Read policy for the next delivery from a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePolicy {
    /// Fill the buffer to exactly `n` bytes before delivering.
    Exactly(usize),
    /// Deliver as soon as any bytes arrive, up to `n`.
    AtMost(usize),
    /// Deliver once at least `n` bytes arrived; the buffer may grow a bit
    /// beyond `n` to avoid immediate re-reads.
    AtLeast(usize),
}

impl ReceivePolicy {
    /// Resolve the policy to `(delivery threshold, buffer size)`.
    ///
    /// `AtLeast(n)` buffers up to 10% more than `n`, but at least 100 extra
    /// bytes.
    pub fn thresholds(self) -> (usize, usize) {
        match self {
            ReceivePolicy::Exactly(n) => (n, n),
            ReceivePolicy::AtMost(n) => (1, n),
            ReceivePolicy::AtLeast(n) => (n, n + std::cmp::max(100, n / 10)),
        }
    }
}

/// Downward interface: what a transport offers the layer above it.
pub trait TransportOps {
    /// Borrow a header buffer from the cache (or allocate a fresh one).
    fn next_header_buffer(&mut self) -> Vec<u8>;

    /// Borrow a payload buffer from the cache (or allocate a fresh one).
    fn next_payload_buffer(&mut self) -> Vec<u8>;

    /// Queue a packet for transmission. By convention the first buffer is a
    /// header buffer; the rest are payload buffers. Queuing onto an empty
    /// write queue registers the manager for write events.
    fn write_packet(&mut self, header: Vec<u8>, payloads: Vec<Vec<u8>>);

    /// Set the read policy for subsequent deliveries.
    fn configure_read(&mut self, policy: ReceivePolicy);

    /// Record the reason for tearing this connection down. The first reason
    /// wins; later calls are ignored.
    fn abort_reason(&mut self, reason: NetError);

    /// Whether an abort reason was recorded.
    fn has_abort_reason(&self) -> bool;

    /// Take the recorded abort reason, leaving none.
    fn take_abort_reason(&mut self) -> Option<NetError>;

    /// Whether the transport currently accepts more output.
    fn can_send_more(&self) -> bool;
}

/// Upward interface: the protocol layer a transport drives.
///
/// `consume` returns the number of bytes processed: positive to drop that
/// prefix from the transport's buffer, `0` to wait for more input (after
/// adjusting the read policy), negative to abort the connection with the
/// reason recorded through [`TransportOps::abort_reason`].
pub trait Application {
    /// Called once before the manager starts processing events. Typically
    /// emits a greeting (e.g. the handshake) and sets the initial read
    /// policy.
    fn init(
        &mut self,
        owner: &ManagerWaker,
        down: &mut dyn TransportOps,
        cfg: &NetConfig,
    ) -> Result<(), NetError>;

    /// Process buffered input.
    fn consume(&mut self, down: &mut dyn TransportOps, input: &[u8]) -> isize;

    /// Produce pending output into the transport's write queue.
    /// Returns `false` on error (abort reason set).
    fn prepare_send(&mut self, down: &mut dyn TransportOps) -> bool;

    /// The write queue ran dry. Returns `true` when the layer has nothing
    /// more to send and agreed to be unregistered from write events.
    fn done_sending(&mut self, down: &mut dyn TransportOps) -> bool {
        let _ = down;
        true
    }

    /// The connection is going away for the given reason.
    fn abort(&mut self, reason: &NetError);

    /// Node id of the connected peer, once known.
    fn peer(&self) -> Option<NodeId> {
        None
    }

    // -- endpoint event entry points -----------------------------------------

    /// Resolve a remote path for `listener`.
    fn write_resolve_request(
        &mut self,
        down: &mut dyn TransportOps,
        path: &str,
        listener: ActorRef,
    ) {
        let _ = (down, path, listener);
        tracing::warn!("resolve is not supported by this protocol stack");
    }

    /// A local proxy for `(peer, id)` was minted.
    fn write_new_proxy(&mut self, down: &mut dyn TransportOps, peer: &NodeId, id: ActorId) {
        let _ = (down, peer, id);
    }

    /// A local actor observed by `peer` terminated.
    fn write_local_actor_down(
        &mut self,
        down: &mut dyn TransportOps,
        peer: &NodeId,
        id: ActorId,
        reason: ExitReason,
    ) {
        let _ = (down, peer, id, reason);
    }

    /// A timeout set through the endpoint manager fired.
    fn handle_timeout(&mut self, down: &mut dyn TransportOps, tag: &str, id: u64) {
        let _ = (down, tag, id);
    }

    /// Serialize and queue an outbound actor message.
    fn write_message(
        &mut self,
        down: &mut dyn TransportOps,
        element: MailboxElement,
        receiver: ActorId,
    ) {
        let _ = (down, element, receiver);
        tracing::warn!("actor messages are not supported by this protocol stack");
    }
}

/// A fully assembled per-socket protocol stack, as driven by the endpoint
/// manager.
pub trait Transport {
    /// Initialize the stack (buffer caches, application greeting).
    fn init(&mut self, owner: &ManagerWaker, cfg: &NetConfig) -> Result<(), NetError>;

    /// The socket became readable. Returns `false` to deregister reading.
    fn handle_read_event(&mut self) -> bool;

    /// The socket became writable. Returns `true` while output is pending,
    /// `false` once fully drained.
    fn handle_write_event(&mut self) -> bool;

    /// Dispatch a resolve request to the application.
    fn resolve(&mut self, locator: &str, listener: ActorRef);

    /// Dispatch a new-proxy notification to the application.
    fn new_proxy(&mut self, peer: &NodeId, id: ActorId);

    /// Dispatch a local-actor-down notification to the application.
    fn local_actor_down(&mut self, peer: &NodeId, id: ActorId, reason: ExitReason);

    /// Dispatch a fired timeout to the application.
    fn timeout(&mut self, tag: &str, id: u64);

    /// Associate a freshly scheduled timeout with transport-level state
    /// (datagram transports map it to a peer endpoint).
    fn register_timeout(&mut self, id: u64, endpoint: Option<std::net::SocketAddr>) {
        let _ = (id, endpoint);
    }

    /// Drop transport-level state of a cancelled timeout.
    fn cancel_timeout(&mut self, id: u64) {
        let _ = id;
    }

    /// Dispatch an outbound actor message to the application. `peer`
    /// selects the destination endpoint on transports serving several.
    fn write_message(&mut self, element: MailboxElement, receiver: ActorId, peer: Option<&NodeId>);

    /// Store the abort reason and notify the protocol chain.
    fn handle_error(&mut self, reason: NetError);

    /// The recorded abort reason, if any.
    fn abort_reason(&self) -> Option<&NetError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_policy_thresholds() {
        assert_eq!(ReceivePolicy::Exactly(13).thresholds(), (13, 13));
        assert_eq!(ReceivePolicy::AtMost(2048).thresholds(), (1, 2048));
        // 10% of 4096 exceeds the 100-byte floor.
        assert_eq!(ReceivePolicy::AtLeast(4096).thresholds(), (4096, 4096 + 409));
        // Small minimums grow by the 100-byte floor.
        assert_eq!(ReceivePolicy::AtLeast(10).thresholds(), (10, 110));
    }
}
