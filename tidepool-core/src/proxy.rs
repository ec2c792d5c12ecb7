//! Process-wide registry of proxies for remote actors.
//!
//! A proxy is the local stand-in for an actor living on another node.
//! Delivering to a proxy forwards the element over the endpoint owning the
//! peer connection. The registry guarantees stable identity: two lookups for
//! the same `(node, actor)` pair return the same handle until the proxy is
//! erased by a remote down-message or connection loss.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    ActorId, ActorRef, ActorSink, EnqueueResult, ExitReason, MailboxElement, NodeId,
    bounce_request,
};

/// Observer invoked once when a proxy is erased.
pub type ProxyObserver = Box<dyn FnOnce(ExitReason) + Send>;

/// The narrow interface a connection endpoint offers to proxies.
pub trait ProxyEndpoint: Send + Sync {
    /// Queue an element for remote delivery to `receiver` on `node`.
    fn forward(&self, element: MailboxElement, receiver: ActorId, node: &NodeId);

    /// A proxy for `(node, id)` was just minted; the endpoint announces the
    /// monitor to its peer.
    fn on_new_proxy(&self, node: &NodeId, id: ActorId);
}

struct ProxyState {
    endpoint: Option<Arc<dyn ProxyEndpoint>>,
    observers: Vec<ProxyObserver>,
    exit: Option<ExitReason>,
}

/// Local stand-in for a remote actor.
pub struct RemoteProxy {
    node: NodeId,
    id: ActorId,
    state: Mutex<ProxyState>,
}

impl RemoteProxy {
    fn new(node: NodeId, id: ActorId, endpoint: Option<Arc<dyn ProxyEndpoint>>) -> Self {
        Self {
            node,
            id,
            state: Mutex::new(ProxyState {
                endpoint,
                observers: Vec::new(),
                exit: None,
            }),
        }
    }

    /// Node hosting the represented actor.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Attach a one-shot observer fired when the proxy is erased.
    ///
    /// An already-erased proxy fires the observer immediately.
    pub fn attach(&self, observer: ProxyObserver) {
        let reason = {
            let mut state = self.state.lock();
            match &state.exit {
                Some(reason) => reason.clone(),
                None => {
                    state.observers.push(observer);
                    return;
                }
            }
        };
        observer(reason);
    }

    /// Whether the proxy was erased.
    pub fn is_closed(&self) -> bool {
        self.state.lock().exit.is_some()
    }

    fn kill(&self, reason: ExitReason) {
        let observers = {
            let mut state = self.state.lock();
            if state.exit.is_some() {
                return;
            }
            state.exit = Some(reason.clone());
            state.endpoint = None;
            std::mem::take(&mut state.observers)
        };
        for observer in observers {
            observer(reason.clone());
        }
    }
}

impl ActorSink for RemoteProxy {
    fn id(&self) -> ActorId {
        self.id
    }

    fn enqueue(&self, element: MailboxElement) -> EnqueueResult {
        let endpoint = {
            let state = self.state.lock();
            if let Some(reason) = &state.exit {
                let reason = reason.clone();
                drop(state);
                bounce_request(&element, &reason);
                return EnqueueResult::Closed;
            }
            state.endpoint.clone()
        };
        match endpoint {
            Some(endpoint) => {
                endpoint.forward(element, self.id, &self.node);
                EnqueueResult::Success
            }
            None => {
                tracing::warn!(
                    node = %self.node,
                    actor = self.id,
                    "dropped message for proxy without endpoint"
                );
                EnqueueResult::Success
            }
        }
    }
}

#[derive(Default)]
struct RegistryState {
    proxies: HashMap<(NodeId, ActorId), Arc<RemoteProxy>>,
    endpoints: HashMap<NodeId, Arc<dyn ProxyEndpoint>>,
}

/// Thread-safe proxy registry shared across all connections of a process.
#[derive(Default)]
pub struct ProxyRegistry {
    state: Mutex<RegistryState>,
}

impl ProxyRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the endpoint responsible for a peer node. Called when a
    /// handshake completes.
    pub fn set_endpoint(&self, node: NodeId, endpoint: Arc<dyn ProxyEndpoint>) {
        self.state.lock().endpoints.insert(node, endpoint);
    }

    /// Remove a peer's endpoint registration (connection teardown).
    pub fn drop_endpoint(&self, node: &NodeId) {
        self.state.lock().endpoints.remove(node);
    }

    /// Fetch or mint the proxy for `(node, id)`.
    ///
    /// Minting notifies the peer's endpoint so it can announce the monitor
    /// on the wire.
    pub fn get_or_put(&self, node: NodeId, id: ActorId) -> ActorRef {
        let (proxy, minted_endpoint) = {
            let mut state = self.state.lock();
            if let Some(existing) = state.proxies.get(&(node, id)) {
                return existing.clone();
            }
            let endpoint = state.endpoints.get(&node).cloned();
            let proxy = Arc::new(RemoteProxy::new(node, id, endpoint.clone()));
            state.proxies.insert((node, id), proxy.clone());
            (proxy, endpoint)
        };
        // Outside the lock: the endpoint callback takes its own locks.
        if let Some(endpoint) = minted_endpoint {
            endpoint.on_new_proxy(&node, id);
        } else {
            tracing::warn!(node = %node, actor = id, "minted proxy without endpoint");
        }
        proxy
    }

    /// Fetch the proxy for `(node, id)` without minting.
    pub fn get(&self, node: &NodeId, id: ActorId) -> Option<ActorRef> {
        self.state
            .lock()
            .proxies
            .get(&(*node, id))
            .map(|proxy| proxy.clone() as ActorRef)
    }

    /// Erase one proxy, signalling `reason` to its observers.
    pub fn erase(&self, node: &NodeId, id: ActorId, reason: ExitReason) {
        let proxy = self.state.lock().proxies.remove(&(*node, id));
        if let Some(proxy) = proxy {
            proxy.kill(reason);
        }
    }

    /// Erase every proxy of a node (connection loss).
    pub fn erase_node(&self, node: &NodeId, reason: ExitReason) {
        let victims: Vec<_> = {
            let mut state = self.state.lock();
            let keys: Vec<_> = state
                .proxies
                .keys()
                .filter(|(proxy_node, _)| proxy_node == node)
                .copied()
                .collect();
            keys.iter()
                .filter_map(|key| state.proxies.remove(key))
                .collect()
        };
        for proxy in victims {
            proxy.kill(reason.clone());
        }
    }

    /// Number of live proxies, for tests.
    pub fn len(&self) -> usize {
        self.state.lock().proxies.len()
    }

    /// Whether no proxies are registered.
    pub fn is_empty(&self) -> bool {
        self.state.lock().proxies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::{Message, MessageId};

    use super::*;

    #[derive(Default)]
    struct RecordingEndpoint {
        forwarded: Mutex<Vec<(ActorId, MailboxElement)>>,
        new_proxies: Mutex<Vec<(NodeId, ActorId)>>,
    }

    impl ProxyEndpoint for RecordingEndpoint {
        fn forward(&self, element: MailboxElement, receiver: ActorId, node: &NodeId) {
            assert_eq!(*node, peer());
            self.forwarded.lock().push((receiver, element));
        }

        fn on_new_proxy(&self, node: &NodeId, id: ActorId) {
            self.new_proxies.lock().push((*node, id));
        }
    }

    fn peer() -> NodeId {
        NodeId::new(1, 2)
    }

    #[test]
    fn test_get_or_put_is_idempotent() {
        let registry = ProxyRegistry::new();
        let endpoint = Arc::new(RecordingEndpoint::default());
        registry.set_endpoint(peer(), endpoint.clone());

        let first = registry.get_or_put(peer(), 7);
        let second = registry.get_or_put(peer(), 7);
        assert!(Arc::ptr_eq(&first, &second));
        // Only the first lookup announces the proxy.
        assert_eq!(endpoint.new_proxies.lock().len(), 1);
        assert_eq!(endpoint.new_proxies.lock()[0], (peer(), 7));
    }

    #[test]
    fn test_enqueue_forwards_through_endpoint() {
        let registry = ProxyRegistry::new();
        let endpoint = Arc::new(RecordingEndpoint::default());
        registry.set_endpoint(peer(), endpoint.clone());

        let proxy = registry.get_or_put(peer(), 7);
        let element = MailboxElement::new(None, MessageId::none(), Message::new(1u32));
        assert_eq!(proxy.enqueue(element), EnqueueResult::Success);

        let forwarded = endpoint.forwarded.lock();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0, 7);
    }

    #[test]
    fn test_erase_fires_observers_and_closes() {
        let registry = ProxyRegistry::new();
        let endpoint = Arc::new(RecordingEndpoint::default());
        registry.set_endpoint(peer(), endpoint.clone());

        let proxy = registry.get_or_put(peer(), 7);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let remote = {
            let state = registry.state.lock();
            state.proxies.get(&(peer(), 7)).expect("present").clone()
        };
        remote.attach(Box::new(move |reason| {
            assert_eq!(reason, ExitReason::Remote("gone".to_string()));
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        registry.erase(&peer(), 7, ExitReason::Remote("gone".to_string()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());

        // A closed proxy rejects further traffic.
        let element = MailboxElement::new(None, MessageId::none(), Message::new(1u32));
        assert_eq!(proxy.enqueue(element), EnqueueResult::Closed);
    }

    #[test]
    fn test_erase_node_sweeps_all_proxies() {
        let registry = ProxyRegistry::new();
        let endpoint = Arc::new(RecordingEndpoint::default());
        registry.set_endpoint(peer(), endpoint.clone());
        let other = NodeId::new(9, 9);
        registry.set_endpoint(other, endpoint.clone());

        registry.get_or_put(peer(), 1);
        registry.get_or_put(peer(), 2);
        registry.get_or_put(other, 3);

        registry.erase_node(&peer(), ExitReason::Shutdown);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&other, 3).is_some());
    }

    #[test]
    fn test_attach_after_erase_fires_immediately() {
        let registry = ProxyRegistry::new();
        let endpoint = Arc::new(RecordingEndpoint::default());
        registry.set_endpoint(peer(), endpoint.clone());
        registry.get_or_put(peer(), 7);
        let remote = {
            let state = registry.state.lock();
            state.proxies.get(&(peer(), 7)).expect("present").clone()
        };
        registry.erase(&peer(), 7, ExitReason::Unknown);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        remote.attach(Box::new(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
