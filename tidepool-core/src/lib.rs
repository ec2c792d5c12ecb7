//! # Tidepool Core
//!
//! Shared vocabulary between the tidepool actor host and its networking
//! layer.
//!
//! The networking crate (`tidepool-net`) treats the actor system as an
//! external collaborator reached through the narrow interfaces defined
//! here:
//!
//! | Interface | Purpose |
//! |-----------|---------|
//! | [`ActorRegistry`] | Local actor lookup, path resolution, monitors |
//! | [`ActorClock`] | One-shot protocol timeouts |
//! | [`ContentCodec`] | Serialization of opaque message content |
//! | [`ProxyRegistry`] | Stable stand-ins for remote actors |
//!
//! The remaining modules define the identity and envelope types both sides
//! agree on ([`NodeId`], [`ActorId`], [`MailboxElement`]) and the binary
//! reader/writer every wire payload goes through.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Actor ids, message ids, envelopes and mailbox plumbing.
pub mod actor;

/// Clock interface for one-shot timeouts.
pub mod clock;

/// Pluggable content serialization.
pub mod codec;

/// Exit reasons for actors and connections.
pub mod exit;

/// Node identity.
pub mod node;

/// Process-wide proxy registry.
pub mod proxy;

/// Actor registry interface and local implementation.
pub mod registry;

/// Binary payload reader/writer.
pub mod wire;

pub use actor::{
    ActorId, ActorRef, ActorSink, BouncedRequest, EnqueueResult, MailboxElement, Message,
    MessageId, bounce_request,
};
pub use clock::{ActorClock, TimeoutSink, TokioClock};
pub use codec::{CodecError, ContentCodec, JsonStringCodec};
pub use exit::ExitReason;
pub use node::NodeId;
pub use proxy::{ProxyEndpoint, ProxyObserver, ProxyRegistry, RemoteProxy};
pub use registry::{ActorRegistry, DownListener, LocalRegistry};
pub use wire::{BinaryReader, BinaryWriter, WireError};
