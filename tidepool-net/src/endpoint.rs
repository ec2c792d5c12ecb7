//! Endpoint manager: the socket manager specialized for remote messaging.
//!
//! The manager owns a [`ConsumerQueue`] of control events and outbound
//! messages. Producers (proxies, the host, the timeout proxy) push from any
//! thread and make sure the manager is registered for write events; the
//! write handler drains the queue in FIFO order into the transport, then
//! lets the transport flush, and finally parks the queue again when
//! everything ran dry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tidepool_core::{
    ActorClock, ActorId, ActorRef, ExitReason, MailboxElement, Message, MessageId, NodeId,
    ProxyEndpoint, TimeoutSink, bounce_request,
};

use crate::error::NetError;
use crate::multiplexer::{ManagerWaker, SocketEventHandler};
use crate::transport::Transport;

/// Events travelling through an endpoint's consumer queue.
pub enum EndpointEvent {
    /// Resolve a remote path and answer `listener`.
    ResolveRequest {
        /// Locator of the remote actor (path, or `scheme://authority/path`).
        locator: String,
        /// Receiver of the answer.
        listener: ActorRef,
    },
    /// A proxy for a remote actor was minted locally.
    NewProxy {
        /// Node hosting the actor.
        peer: NodeId,
        /// The remote actor.
        id: ActorId,
    },
    /// A local actor observed by the peer terminated.
    LocalActorDown {
        /// The observing peer.
        peer: NodeId,
        /// The terminated actor.
        id: ActorId,
        /// Its exit reason.
        reason: ExitReason,
    },
    /// A timeout set through this endpoint fired.
    Timeout {
        /// Timeout tag.
        tag: String,
        /// Timeout id.
        id: u64,
    },
    /// An outbound actor message.
    Message {
        /// The envelope to deliver remotely.
        element: MailboxElement,
        /// Destination actor on the peer.
        receiver: ActorId,
        /// Destination node, where the transport serves several.
        peer: Option<NodeId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Active,
    Blocked,
    Closed,
}

enum QueuePush {
    Stored,
    Unblocked,
    Closed(EndpointEvent),
}

struct QueueInner {
    items: std::collections::VecDeque<EndpointEvent>,
    state: QueueState,
}

/// Single-producer-amortized FIFO of endpoint events with a blocked state.
///
/// Starts blocked; the first push unblocks it and tells the producer to
/// register the manager for write events.
pub struct ConsumerQueue {
    inner: Mutex<QueueInner>,
}

impl ConsumerQueue {
    /// Create a parked queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                items: std::collections::VecDeque::new(),
                state: QueueState::Blocked,
            }),
        })
    }

    fn push(&self, event: EndpointEvent) -> QueuePush {
        let mut inner = self.inner.lock();
        match inner.state {
            QueueState::Closed => QueuePush::Closed(event),
            QueueState::Blocked => {
                inner.state = QueueState::Active;
                inner.items.push_back(event);
                QueuePush::Unblocked
            }
            QueueState::Active => {
                inner.items.push_back(event);
                QueuePush::Stored
            }
        }
    }

    /// Pop the next event in FIFO order.
    pub fn pop(&self) -> Option<EndpointEvent> {
        self.inner.lock().items.pop_front()
    }

    /// Park the queue; succeeds only when it is empty (or already parked).
    pub fn try_block(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            QueueState::Active if inner.items.is_empty() => {
                inner.state = QueueState::Blocked;
                true
            }
            QueueState::Blocked => true,
            _ => false,
        }
    }

    /// Close the queue, returning everything still queued.
    pub fn close(&self) -> Vec<EndpointEvent> {
        let mut inner = self.inner.lock();
        inner.state = QueueState::Closed;
        inner.items.drain(..).collect()
    }

    /// Whether the queue holds no events.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the queue was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().state == QueueState::Closed
    }
}

/// Thread-safe producer facade of an endpoint manager.
///
/// Shared by proxies, the timeout proxy and host code. Pushing onto the
/// parked queue registers the manager for write events.
#[derive(Clone)]
pub struct EndpointHandle {
    queue: Arc<ConsumerQueue>,
    waker: ManagerWaker,
}

impl EndpointHandle {
    /// Build the facade over a manager's queue and waker.
    pub fn new(queue: Arc<ConsumerQueue>, waker: ManagerWaker) -> Arc<Self> {
        Arc::new(Self { queue, waker })
    }

    /// Resolve a remote path; `listener` receives the answer message.
    pub fn resolve(&self, locator: impl Into<String>, listener: ActorRef) {
        self.enqueue_event(EndpointEvent::ResolveRequest {
            locator: locator.into(),
            listener,
        });
    }

    /// Queue an outbound actor message.
    pub fn enqueue(&self, element: MailboxElement, receiver: ActorId, peer: Option<NodeId>) {
        self.enqueue_event(EndpointEvent::Message {
            element,
            receiver,
            peer,
        });
    }

    /// Queue a control event.
    pub fn enqueue_event(&self, event: EndpointEvent) {
        match self.queue.push(event) {
            QueuePush::Stored => {}
            QueuePush::Unblocked => self.waker.register_writing(),
            QueuePush::Closed(event) => reject_event(event, &NetError::ConnectionClosed),
        }
    }
}

impl ProxyEndpoint for EndpointHandle {
    fn forward(&self, element: MailboxElement, receiver: ActorId, node: &NodeId) {
        self.enqueue(element, receiver, Some(*node));
    }

    fn on_new_proxy(&self, node: &NodeId, id: ActorId) {
        self.enqueue_event(EndpointEvent::NewProxy { peer: *node, id });
    }
}

/// Turns clock firings into [`EndpointEvent::Timeout`] events.
pub struct TimeoutProxy {
    handle: Arc<EndpointHandle>,
}

impl TimeoutProxy {
    /// Create the proxy for an endpoint.
    pub fn new(handle: Arc<EndpointHandle>) -> Arc<Self> {
        Arc::new(Self { handle })
    }
}

impl TimeoutSink for TimeoutProxy {
    fn fire(&self, tag: &str, id: u64) {
        self.handle.enqueue_event(EndpointEvent::Timeout {
            tag: tag.to_string(),
            id,
        });
    }
}

/// Reject an event that hit a closed queue.
fn reject_event(event: EndpointEvent, reason: &NetError) {
    match event {
        EndpointEvent::Message { element, .. } => {
            bounce_request(&element, &reason.to_exit_reason());
        }
        EndpointEvent::ResolveRequest { listener, .. } => {
            let answer = MailboxElement::new(
                None,
                MessageId::none(),
                Message::new(NetError::RemoteLookupFailed),
            );
            listener.enqueue(answer);
        }
        _ => {}
    }
}

/// Per-connection unit bridging the multiplexer with actor-style producers.
pub struct EndpointManager<T: Transport> {
    transport: T,
    queue: Arc<ConsumerQueue>,
    clock: Arc<dyn ActorClock>,
    timeout_proxy: Arc<TimeoutProxy>,
    next_timeout_id: u64,
    waker: ManagerWaker,
    torn_down: bool,
}

impl<T: Transport> EndpointManager<T> {
    /// Assemble a manager over an initialized transport stack.
    pub fn new(
        transport: T,
        queue: Arc<ConsumerQueue>,
        clock: Arc<dyn ActorClock>,
        handle: Arc<EndpointHandle>,
        waker: ManagerWaker,
    ) -> Self {
        Self {
            transport,
            queue,
            clock,
            timeout_proxy: TimeoutProxy::new(handle),
            next_timeout_id: 0,
            waker,
            torn_down: false,
        }
    }

    /// Initialize the transport stack (emits the protocol greeting).
    pub fn init(&mut self, cfg: &crate::config::NetConfig) -> Result<(), NetError> {
        self.transport.init(&self.waker, cfg)
    }

    /// Access the transport stack.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the transport stack.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Register a one-shot timeout with the actor clock; the firing timer
    /// arrives back as a [`EndpointEvent::Timeout`].
    pub fn set_timeout(
        &mut self,
        delay: Duration,
        tag: impl Into<String>,
        endpoint: Option<SocketAddr>,
    ) -> u64 {
        let id = self.next_timeout_id;
        self.next_timeout_id += 1;
        self.transport.register_timeout(id, endpoint);
        self.clock
            .schedule(delay, tag.into(), id, self.timeout_proxy.clone());
        id
    }

    /// Cancel a timeout at the clock and in the transport bookkeeping.
    pub fn cancel_timeout(&mut self, tag: &str, id: u64) {
        self.clock.cancel(tag, id);
        self.transport.cancel_timeout(id);
    }

    fn dispatch(&mut self, event: EndpointEvent) {
        match event {
            EndpointEvent::ResolveRequest { locator, listener } => {
                self.transport.resolve(&locator, listener);
            }
            EndpointEvent::NewProxy { peer, id } => self.transport.new_proxy(&peer, id),
            EndpointEvent::LocalActorDown { peer, id, reason } => {
                self.transport.local_actor_down(&peer, id, reason);
            }
            EndpointEvent::Timeout { tag, id } => self.transport.timeout(&tag, id),
            EndpointEvent::Message {
                element,
                receiver,
                peer,
            } => self
                .transport
                .write_message(element, receiver, peer.as_ref()),
        }
    }

    fn teardown(&mut self, reason: &NetError) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        tracing::debug!(error = %reason, "endpoint manager teardown");
        for event in self.queue.close() {
            reject_event(event, reason);
        }
        self.waker.discard();
    }

    fn teardown_from_abort(&mut self) {
        let reason = self
            .transport
            .abort_reason()
            .map(NetError::replicate)
            .unwrap_or(NetError::ConnectionClosed);
        self.teardown(&reason);
    }
}

impl<T: Transport> SocketEventHandler for EndpointManager<T> {
    fn handle_read_event(&mut self) -> bool {
        let keep = self.transport.handle_read_event();
        if !keep {
            self.teardown_from_abort();
        }
        keep
    }

    fn handle_write_event(&mut self) -> bool {
        // Control events and outbound messages first, in FIFO order.
        while let Some(event) = self.queue.pop() {
            self.dispatch(event);
        }
        let more = self.transport.handle_write_event();
        if self.transport.abort_reason().is_some() {
            self.teardown_from_abort();
            return false;
        }
        if more {
            return true;
        }
        // Nothing more to send: park the queue, or keep write interest when
        // a producer slipped in.
        !(self.queue.is_empty() && self.queue.try_block())
    }

    fn handle_error(&mut self, reason: NetError) {
        let replica = reason.replicate();
        self.transport.handle_error(reason);
        self.teardown(&replica);
    }
}

impl<T: Transport> Drop for EndpointManager<T> {
    fn drop(&mut self) {
        self.teardown(&NetError::ConnectionClosed);
    }
}

#[cfg(test)]
mod tests {
    use tidepool_core::{ActorSink, BouncedRequest, EnqueueResult};

    use crate::multiplexer::testing::mock_waker;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<MailboxElement>>,
    }

    impl ActorSink for RecordingSink {
        fn id(&self) -> ActorId {
            7
        }

        fn enqueue(&self, element: MailboxElement) -> EnqueueResult {
            self.received.lock().push(element);
            EnqueueResult::Success
        }
    }

    #[test]
    fn test_first_push_unblocks_and_registers() {
        let (waker, probe) = mock_waker();
        let queue = ConsumerQueue::new();
        let handle = EndpointHandle::new(queue.clone(), waker);

        handle.enqueue_event(EndpointEvent::NewProxy {
            peer: NodeId::new(1, 1),
            id: 9,
        });
        assert_eq!(probe.count(), 1);
        handle.enqueue_event(EndpointEvent::NewProxy {
            peer: NodeId::new(1, 1),
            id: 10,
        });
        // Still active; no second registration.
        assert_eq!(probe.count(), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_try_block_requires_empty() {
        let (waker, _probe) = mock_waker();
        let queue = ConsumerQueue::new();
        let handle = EndpointHandle::new(queue.clone(), waker);
        handle.enqueue_event(EndpointEvent::Timeout {
            tag: "t".to_string(),
            id: 0,
        });
        assert!(!queue.try_block());
        let _ = queue.pop();
        assert!(queue.try_block());
    }

    #[test]
    fn test_closed_queue_bounces_requests() {
        let (waker, _probe) = mock_waker();
        let queue = ConsumerQueue::new();
        let handle = EndpointHandle::new(queue.clone(), waker);
        queue.close();

        let sender = Arc::new(RecordingSink::default());
        let element = MailboxElement::new(
            Some(sender.clone() as ActorRef),
            MessageId::request(3),
            Message::new(()),
        );
        handle.enqueue(element, 42, None);

        let received = sender.received.lock();
        assert_eq!(received.len(), 1);
        assert!(
            received[0]
                .content
                .downcast_ref::<BouncedRequest>()
                .is_some()
        );
    }

    #[test]
    fn test_closed_queue_fails_resolves() {
        let (waker, _probe) = mock_waker();
        let queue = ConsumerQueue::new();
        let handle = EndpointHandle::new(queue.clone(), waker);
        queue.close();

        let listener = Arc::new(RecordingSink::default());
        handle.resolve("/name/dummy", listener.clone() as ActorRef);

        let received = listener.received.lock();
        assert_eq!(received.len(), 1);
        assert!(matches!(
            received[0].content.downcast_ref::<NetError>(),
            Some(NetError::RemoteLookupFailed)
        ));
    }

    /// Transport double recording dispatched events.
    #[derive(Default)]
    struct MockTransport {
        events: Vec<String>,
        pending_writes: usize,
        abort: Option<NetError>,
    }

    impl crate::transport::Transport for MockTransport {
        fn init(
            &mut self,
            _owner: &ManagerWaker,
            _cfg: &crate::config::NetConfig,
        ) -> Result<(), NetError> {
            Ok(())
        }

        fn handle_read_event(&mut self) -> bool {
            true
        }

        fn handle_write_event(&mut self) -> bool {
            if self.pending_writes > 0 {
                self.pending_writes -= 1;
                true
            } else {
                false
            }
        }

        fn resolve(&mut self, locator: &str, _listener: ActorRef) {
            self.events.push(format!("resolve:{locator}"));
        }

        fn new_proxy(&mut self, _peer: &NodeId, id: ActorId) {
            self.events.push(format!("new_proxy:{id}"));
        }

        fn local_actor_down(&mut self, _peer: &NodeId, id: ActorId, _reason: ExitReason) {
            self.events.push(format!("down:{id}"));
        }

        fn timeout(&mut self, tag: &str, id: u64) {
            self.events.push(format!("timeout:{tag}:{id}"));
        }

        fn write_message(
            &mut self,
            _element: MailboxElement,
            receiver: ActorId,
            _peer: Option<&NodeId>,
        ) {
            self.events.push(format!("message:{receiver}"));
        }

        fn handle_error(&mut self, reason: NetError) {
            self.abort = Some(reason);
        }

        fn abort_reason(&self) -> Option<&NetError> {
            self.abort.as_ref()
        }
    }

    /// Clock double firing every timeout synchronously.
    struct ImmediateClock;

    impl ActorClock for ImmediateClock {
        fn schedule(
            &self,
            _delay: std::time::Duration,
            tag: String,
            id: u64,
            sink: Arc<dyn TimeoutSink>,
        ) {
            sink.fire(&tag, id);
        }

        fn cancel(&self, _tag: &str, _id: u64) {}
    }

    fn make_manager() -> (
        EndpointManager<MockTransport>,
        Arc<ConsumerQueue>,
        Arc<EndpointHandle>,
    ) {
        let (waker, _probe) = mock_waker();
        let queue = ConsumerQueue::new();
        let handle = EndpointHandle::new(queue.clone(), waker.clone());
        let manager = EndpointManager::new(
            MockTransport::default(),
            queue.clone(),
            Arc::new(ImmediateClock),
            handle.clone(),
            waker,
        );
        (manager, queue, handle)
    }

    #[test]
    fn test_write_event_dispatches_fifo() {
        let (mut manager, queue, handle) = make_manager();
        handle.resolve("/name/dummy", Arc::new(RecordingSink::default()) as ActorRef);
        handle.enqueue_event(EndpointEvent::NewProxy {
            peer: NodeId::new(1, 1),
            id: 9,
        });
        handle.enqueue_event(EndpointEvent::LocalActorDown {
            peer: NodeId::new(1, 1),
            id: 17,
            reason: ExitReason::Normal,
        });
        handle.enqueue(
            MailboxElement::new(None, MessageId::none(), Message::new(())),
            42,
            None,
        );

        use crate::multiplexer::SocketEventHandler as _;
        assert!(!manager.handle_write_event());
        assert_eq!(
            manager.transport().events,
            vec![
                "resolve:/name/dummy".to_string(),
                "new_proxy:9".to_string(),
                "down:17".to_string(),
                "message:42".to_string(),
            ]
        );
        // Queue drained and parked again.
        assert!(queue.is_empty());
        assert!(!queue.is_closed());
    }

    #[test]
    fn test_write_event_keeps_interest_while_pending() {
        let (mut manager, _queue, _handle) = make_manager();
        manager.transport_mut().pending_writes = 2;

        use crate::multiplexer::SocketEventHandler as _;
        assert!(manager.handle_write_event());
        assert!(manager.handle_write_event());
        assert!(!manager.handle_write_event());
    }

    #[test]
    fn test_handle_error_closes_queue_and_bounces() {
        let (mut manager, queue, handle) = make_manager();
        let sender = Arc::new(RecordingSink::default());
        handle.enqueue(
            MailboxElement::new(
                Some(sender.clone() as ActorRef),
                MessageId::request(4),
                Message::new(()),
            ),
            42,
            None,
        );

        use crate::multiplexer::SocketEventHandler as _;
        manager.handle_error(NetError::ConnectionClosed);
        assert!(queue.is_closed());
        assert!(matches!(
            manager.transport().abort,
            Some(NetError::ConnectionClosed)
        ));

        let received = sender.received.lock();
        assert_eq!(received.len(), 1);
        assert!(
            received[0]
                .content
                .downcast_ref::<BouncedRequest>()
                .is_some()
        );
    }

    #[test]
    fn test_set_timeout_arrives_as_queue_event() {
        let (mut manager, _queue, _handle) = make_manager();
        let id = manager.set_timeout(std::time::Duration::from_millis(1), "heartbeat", None);
        assert_eq!(id, 0);
        // The immediate clock already fired; the next write event routes the
        // timeout to the transport.
        use crate::multiplexer::SocketEventHandler as _;
        assert!(!manager.handle_write_event());
        assert_eq!(
            manager.transport().events,
            vec!["timeout:heartbeat:0".to_string()]
        );
    }

    #[test]
    fn test_timeout_proxy_queues_event() {
        let (waker, _probe) = mock_waker();
        let queue = ConsumerQueue::new();
        let handle = EndpointHandle::new(queue.clone(), waker);
        let proxy = TimeoutProxy::new(handle);

        proxy.fire("heartbeat", 4);
        match queue.pop() {
            Some(EndpointEvent::Timeout { tag, id }) => {
                assert_eq!(tag, "heartbeat");
                assert_eq!(id, 4);
            }
            _ => panic!("expected timeout event"),
        }
    }
}
