//! Actor-facing vocabulary shared between the host system and the network
//! layer.
//!
//! The networking code never inspects message *content*; it moves opaque
//! [`Message`] values between mailboxes and serializes them at the process
//! boundary via a [`ContentCodec`](crate::ContentCodec). Everything the
//! network needs to route a message lives in the [`MailboxElement`] envelope.

use std::any::Any;
use std::sync::Arc;

use crate::ExitReason;

/// A 64-bit actor id, unique within one node.
///
/// `(NodeId, ActorId)` uniquely addresses an actor. Id 0 denotes an
/// anonymous sender.
pub type ActorId = u64;

/// Message id carrying request/response correlation flags.
///
/// Bit 63 flags a response, bit 62 flags a request; the low 62 bits carry
/// the request number. Plain one-way messages use [`MessageId::none`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageId(pub u64);

const RESPONSE_FLAG: u64 = 1 << 63;
const REQUEST_FLAG: u64 = 1 << 62;
const NUMBER_MASK: u64 = REQUEST_FLAG - 1;

impl MessageId {
    /// Id for a plain asynchronous message.
    pub const fn none() -> Self {
        Self(0)
    }

    /// Id for a request with the given request number.
    pub const fn request(number: u64) -> Self {
        Self(REQUEST_FLAG | (number & NUMBER_MASK))
    }

    /// Id for the response answering `self`.
    pub const fn response_to(self) -> Self {
        Self(RESPONSE_FLAG | (self.0 & NUMBER_MASK))
    }

    /// Whether this id tags a request.
    pub const fn is_request(self) -> bool {
        self.0 & REQUEST_FLAG != 0
    }

    /// Whether this id tags a response.
    pub const fn is_response(self) -> bool {
        self.0 & RESPONSE_FLAG != 0
    }

    /// The request number without flag bits.
    pub const fn request_number(self) -> u64 {
        self.0 & NUMBER_MASK
    }
}

/// Opaque, shareable message content.
///
/// The host decides what lives inside; the network layer only clones the
/// handle and hands it to a codec at process boundaries.
#[derive(Clone)]
pub struct Message(Arc<dyn Any + Send + Sync>);

impl Message {
    /// Wrap a value as message content.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Downcast to a concrete content type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Whether the content is of type `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message").finish_non_exhaustive()
    }
}

/// Content delivered to a request's sender when its target went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BouncedRequest {
    /// Why the request could not be answered.
    pub reason: ExitReason,
}

/// The envelope moved between mailboxes.
#[derive(Clone)]
pub struct MailboxElement {
    /// Sending actor, if any.
    pub sender: Option<ActorRef>,
    /// Correlation id.
    pub mid: MessageId,
    /// Remaining forwarding stages. Proxies push the destination actor id
    /// onto the back before handing the element to an endpoint.
    pub stages: Vec<ActorId>,
    /// Opaque content.
    pub content: Message,
}

impl MailboxElement {
    /// Build an envelope without forwarding stages.
    pub fn new(sender: Option<ActorRef>, mid: MessageId, content: Message) -> Self {
        Self {
            sender,
            mid,
            stages: Vec::new(),
            content,
        }
    }
}

impl std::fmt::Debug for MailboxElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxElement")
            .field("sender", &self.sender.as_ref().map(|sender| sender.id()))
            .field("mid", &self.mid)
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

/// Outcome of enqueueing into a mailbox-like queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Element stored; the queue was already active.
    Success,
    /// Element stored and the queue transitioned from blocked to active.
    /// The producer must wake the consumer.
    UnblockedReader,
    /// The queue is closed; the element was rejected.
    Closed,
}

/// Anything that can receive mailbox elements.
pub trait ActorSink: Send + Sync {
    /// Local id of the receiving actor.
    fn id(&self) -> ActorId;

    /// Deliver one element.
    fn enqueue(&self, element: MailboxElement) -> EnqueueResult;
}

/// Shared handle to an actor mailbox.
pub type ActorRef = Arc<dyn ActorSink>;

/// Reply to a rejected request with an error response.
///
/// No-op for non-request elements or elements without a sender. The sender
/// receives a [`BouncedRequest`] tagged with the matching response id.
pub fn bounce_request(element: &MailboxElement, reason: &ExitReason) {
    if !element.mid.is_request() {
        return;
    }
    let Some(sender) = &element.sender else {
        return;
    };
    let reply = MailboxElement::new(
        None,
        element.mid.response_to(),
        Message::new(BouncedRequest {
            reason: reason.clone(),
        }),
    );
    if sender.enqueue(reply) == EnqueueResult::Closed {
        tracing::debug!(sender = sender.id(), "dropped bounce for closed sender");
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct CollectingSink {
        elements: Mutex<Vec<MailboxElement>>,
    }

    impl ActorSink for CollectingSink {
        fn id(&self) -> ActorId {
            99
        }

        fn enqueue(&self, element: MailboxElement) -> EnqueueResult {
            self.elements.lock().push(element);
            EnqueueResult::Success
        }
    }

    #[test]
    fn test_message_id_flags() {
        let req = MessageId::request(42);
        assert!(req.is_request());
        assert!(!req.is_response());
        assert_eq!(req.request_number(), 42);

        let resp = req.response_to();
        assert!(resp.is_response());
        assert!(!resp.is_request());
        assert_eq!(resp.request_number(), 42);

        assert!(!MessageId::none().is_request());
        assert!(!MessageId::none().is_response());
    }

    #[test]
    fn test_message_downcast() {
        let msg = Message::new("hello".to_string());
        assert!(msg.is::<String>());
        assert_eq!(msg.downcast_ref::<String>().map(String::as_str), Some("hello"));
        assert!(msg.downcast_ref::<u64>().is_none());
    }

    #[test]
    fn test_bounce_request_replies_to_sender() {
        let sender = Arc::new(CollectingSink::default());
        let sender_ref: ActorRef = sender.clone();
        let element = MailboxElement::new(
            Some(sender_ref),
            MessageId::request(7),
            Message::new(1u32),
        );

        bounce_request(&element, &ExitReason::Kill);

        let received = sender.elements.lock();
        assert_eq!(received.len(), 1);
        assert!(received[0].mid.is_response());
        assert_eq!(received[0].mid.request_number(), 7);
        let bounced = received[0]
            .content
            .downcast_ref::<BouncedRequest>()
            .expect("bounced content");
        assert_eq!(bounced.reason, ExitReason::Kill);
    }

    #[test]
    fn test_bounce_ignores_plain_messages() {
        let sender = Arc::new(CollectingSink::default());
        let sender_ref: ActorRef = sender.clone();
        let element = MailboxElement::new(Some(sender_ref), MessageId::none(), Message::new(1u32));

        bounce_request(&element, &ExitReason::Kill);

        assert!(sender.elements.lock().is_empty());
    }
}
