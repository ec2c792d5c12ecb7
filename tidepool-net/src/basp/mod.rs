//! BASP: the binary actor system protocol.
//!
//! A framed, length-prefixed wire protocol implementing the connection
//! handshake, remote message delivery, remote actor resolution and remote
//! monitoring. [`application::BaspApplication`] is the per-connection state
//! machine; [`queue::MessageQueue`] and [`worker::WorkerHub`] implement
//! ordered parallel deserialization of inbound actor messages.

/// The per-connection protocol state machine.
pub mod application;

/// Frame header codec.
pub mod header;

/// Payload schemas for control frames and actor messages.
pub mod payload;

/// Receipt-ordered delivery queue.
pub mod queue;

/// Deserialization worker pool.
pub mod worker;

use tidepool_core::{ActorId, ActorRef, ExitReason};

pub use application::{BaspApplication, ConnectionState};
pub use header::{HEADER_SIZE, Header, MessageType, VERSION};
pub use queue::MessageQueue;
pub use worker::WorkerHub;

/// Answer delivered to a resolve listener.
///
/// `proxy` is `None` when the peer had nothing published under the path.
#[derive(Clone)]
pub struct ResolveAnswer {
    /// Stand-in for the resolved remote actor.
    pub proxy: Option<ActorRef>,
    /// Messaging interface names advertised by the peer.
    pub interfaces: Vec<String>,
}

/// Shell message: a proxy for a remote actor was minted.
#[derive(Debug, Clone, Copy)]
pub struct NewProxyMsg {
    /// The remote actor now represented locally.
    pub id: ActorId,
}

/// Shell message: a monitored local actor terminated.
#[derive(Debug, Clone)]
pub struct LocalActorDownMsg {
    /// The terminated actor.
    pub id: ActorId,
    /// Its exit reason.
    pub reason: ExitReason,
}

/// Shell message: a timeout fired.
#[derive(Debug, Clone)]
pub struct TimeoutMsg {
    /// Timeout tag.
    pub tag: String,
    /// Timeout id.
    pub id: u64,
}
