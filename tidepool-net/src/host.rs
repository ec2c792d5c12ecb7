//! Bundled host collaborators.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tidepool_core::{ActorClock, ActorId, ActorRegistry, ContentCodec, ProxyRegistry};

/// The external collaborators the networking layer consumes.
///
/// Cheap to clone; all parts are shared.
#[derive(Clone)]
pub struct HostContext {
    /// Local actor lookup and monitoring.
    pub registry: Arc<dyn ActorRegistry>,
    /// Process-wide proxies for remote actors.
    pub proxies: Arc<ProxyRegistry>,
    /// Serialization for opaque message content.
    pub codec: Arc<dyn ContentCodec>,
    /// One-shot timeout facility.
    pub clock: Arc<dyn ActorClock>,
    next_actor_id: Arc<AtomicU64>,
}

impl HostContext {
    /// Bundle host collaborators.
    pub fn new(
        registry: Arc<dyn ActorRegistry>,
        proxies: Arc<ProxyRegistry>,
        codec: Arc<dyn ContentCodec>,
        clock: Arc<dyn ActorClock>,
    ) -> Self {
        Self {
            registry,
            proxies,
            codec,
            clock,
            // Ids below 1000 stay reserved for host-published actors.
            next_actor_id: Arc::new(AtomicU64::new(1000)),
        }
    }

    /// Allocate an actor id for internal actors (shells, timeout proxies).
    pub fn next_actor_id(&self) -> ActorId {
        self.next_actor_id.fetch_add(1, Ordering::Relaxed)
    }
}
