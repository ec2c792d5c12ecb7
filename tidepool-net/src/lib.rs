//! # Tidepool Net
//!
//! The networking layer of the tidepool actor runtime: a layered protocol
//! stack connecting local mailboxes to remote peers over stream and
//! datagram transports.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │        BASP application (per connection)        │
//! │  • handshake, resolve, monitor, actor messages  │
//! │  • worker pool + receipt-ordered queue          │
//! ├─────────────────────────────────────────────────┤
//! │   framing (optional, e.g. WebSocket/RFC 6455)   │
//! ├─────────────────────────────────────────────────┤
//! │     transport (TCP stream / UDP datagram)       │
//! │  • receive policy, write queue, buffer caches   │
//! ├─────────────────────────────────────────────────┤
//! │   socket manager + multiplexer (poll loop)      │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`Multiplexer`] | Single-threaded readiness loop over socket managers |
//! | [`EndpointManager`] | Per-connection bridge between producers and the socket |
//! | [`StreamTransport`] / [`DatagramTransport`] | Byte movers under a protocol stack |
//! | [`WebSocketFraming`] | RFC 6455 framing between transport and application |
//! | [`BaspApplication`] | The wire protocol state machine |
//! | [`ActorShell`] | Non-scheduled actor living inside a socket manager |
//!
//! The actor system itself stays external; everything the stack needs from
//! it arrives through the interfaces bundled in [`HostContext`].

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Connection backends (TCP, UDP).
pub mod backend;

/// The BASP wire protocol.
pub mod basp;

/// Configuration options.
pub mod config;

/// Endpoint manager and consumer queue.
pub mod endpoint;

/// Error taxonomy.
pub mod error;

/// Framing layers.
pub mod framing;

/// Bundled host collaborators.
pub mod host;

/// The I/O event loop.
pub mod multiplexer;

/// Interest masks.
pub mod operation;

/// The multiplexer thread.
pub mod runtime;

/// The actor shell and its mailbox.
pub mod shell;

/// Transport layers and layer contracts.
pub mod transport;

pub use basp::{BaspApplication, ConnectionState, MessageQueue, ResolveAnswer, WorkerHub};
pub use config::NetConfig;
pub use endpoint::{ConsumerQueue, EndpointEvent, EndpointHandle, EndpointManager};
pub use error::NetError;
pub use framing::{MessageOriented, WebSocketFraming};
pub use host::HostContext;
pub use multiplexer::{ManagerId, ManagerWaker, Multiplexer, MultiplexerHandle, SocketEventHandler};
pub use operation::Operation;
pub use runtime::NetRuntime;
pub use shell::{ActorShell, Mailbox, MailboxState};
pub use transport::{
    Application, DatagramTransport, ReceivePolicy, StreamTransport, Transport, TransportOps,
};
