//! Actor registry interface and in-process implementation.
//!
//! The network layer resolves local actors through the [`ActorRegistry`]
//! trait: by id for message delivery, by path for `resolve` requests, and
//! via [`ActorRegistry::monitor`] for distributed lifetime tracking.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{ActorId, ActorRef, ExitReason};

/// One-shot listener invoked when a monitored actor terminates.
pub type DownListener = Box<dyn FnOnce(ExitReason) + Send>;

/// Host-side actor lookup and lifetime tracking.
pub trait ActorRegistry: Send + Sync {
    /// Fetch a live actor by id.
    fn get(&self, id: ActorId) -> Option<ActorRef>;

    /// Publish an actor under its id. Keeps the handle alive for remote
    /// senders.
    fn put(&self, id: ActorId, handle: ActorRef);

    /// Resolve a locally published path (e.g. `/name/dummy`).
    fn resolve_local_path(&self, path: &str) -> Option<ActorRef>;

    /// Attach a one-shot lifetime listener to a live actor.
    ///
    /// Returns `false` when the actor is not live; the listener is dropped
    /// unused in that case.
    fn monitor(&self, id: ActorId, listener: DownListener) -> bool;
}

#[derive(Default)]
struct LocalRegistryState {
    actors: HashMap<ActorId, ActorRef>,
    paths: HashMap<String, ActorId>,
    monitors: HashMap<ActorId, Vec<DownListener>>,
}

/// In-process [`ActorRegistry`].
///
/// Hosts publish actors and paths here; terminating an actor fires all of
/// its attached monitors with the given reason.
#[derive(Default)]
pub struct LocalRegistry {
    state: Mutex<LocalRegistryState>,
}

impl LocalRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish an actor under a path for remote resolution.
    pub fn publish_path(&self, path: impl Into<String>, id: ActorId) {
        self.state.lock().paths.insert(path.into(), id);
    }

    /// Remove an actor, firing its monitors with `reason`.
    pub fn terminate(&self, id: ActorId, reason: ExitReason) {
        let listeners = {
            let mut state = self.state.lock();
            state.actors.remove(&id);
            state.paths.retain(|_, published| *published != id);
            state.monitors.remove(&id).unwrap_or_default()
        };
        for listener in listeners {
            listener(reason.clone());
        }
    }

    /// Number of live actors, for tests.
    pub fn len(&self) -> usize {
        self.state.lock().actors.len()
    }

    /// Whether no actors are registered.
    pub fn is_empty(&self) -> bool {
        self.state.lock().actors.is_empty()
    }
}

impl ActorRegistry for LocalRegistry {
    fn get(&self, id: ActorId) -> Option<ActorRef> {
        self.state.lock().actors.get(&id).cloned()
    }

    fn put(&self, id: ActorId, handle: ActorRef) {
        self.state.lock().actors.insert(id, handle);
    }

    fn resolve_local_path(&self, path: &str) -> Option<ActorRef> {
        let state = self.state.lock();
        let id = state.paths.get(path)?;
        state.actors.get(id).cloned()
    }

    fn monitor(&self, id: ActorId, listener: DownListener) -> bool {
        let mut state = self.state.lock();
        if !state.actors.contains_key(&id) {
            return false;
        }
        state.monitors.entry(id).or_default().push(listener);
        true
    }
}
