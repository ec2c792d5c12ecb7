//! Actor shell: a non-scheduled actor living inside a socket manager.
//!
//! The shell bridges actor-style messaging and I/O callbacks. Its mailbox
//! starts out *blocked*; the first enqueue flips it to *active* and
//! registers the owning socket manager for write events, whose
//! `prepare_send` then consumes the mailbox on the multiplexer thread.
//! Unlike a scheduled actor, nothing ever runs the shell; the socket
//! manager pulls messages out of it when the socket can accept output.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tidepool_core::{
    ActorId, ActorRef, ActorSink, EnqueueResult, ExitReason, MailboxElement, Message,
    bounce_request,
};

use crate::multiplexer::ManagerWaker;

/// Observable states of a shell mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxState {
    /// Has items or expects a consumer to poll soon.
    Active,
    /// Empty and parked; the next enqueue re-arms to `Active` and wakes the
    /// owner.
    Blocked,
    /// Rejects enqueues permanently.
    Closed,
}

enum PushOutcome {
    Stored,
    Unblocked,
    Closed(MailboxElement, ExitReason),
}

struct MailboxInner {
    queue: std::collections::VecDeque<MailboxElement>,
    state: MailboxState,
    fail_reason: Option<ExitReason>,
}

/// Intrusive-style FIFO with blocked/active/closed states.
pub struct Mailbox {
    inner: Mutex<MailboxInner>,
}

impl Mailbox {
    /// A new mailbox starts blocked: the first enqueue must wake the owner.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MailboxInner {
                queue: std::collections::VecDeque::new(),
                state: MailboxState::Blocked,
                fail_reason: None,
            }),
        }
    }

    fn push(&self, element: MailboxElement) -> PushOutcome {
        let mut inner = self.inner.lock();
        match inner.state {
            MailboxState::Closed => {
                let reason = inner
                    .fail_reason
                    .clone()
                    .unwrap_or(ExitReason::Normal);
                PushOutcome::Closed(element, reason)
            }
            MailboxState::Blocked => {
                inner.state = MailboxState::Active;
                inner.queue.push_back(element);
                PushOutcome::Unblocked
            }
            MailboxState::Active => {
                inner.queue.push_back(element);
                PushOutcome::Stored
            }
        }
    }

    /// Pop one element. An empty mailbox stays active; consumers block it
    /// explicitly via [`Mailbox::try_block`] when they choose to wait.
    pub fn pop(&self) -> Option<MailboxElement> {
        self.inner.lock().queue.pop_front()
    }

    /// Transition `active → blocked`, succeeding only on an empty, active
    /// mailbox.
    pub fn try_block(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == MailboxState::Active && inner.queue.is_empty() {
            inner.state = MailboxState::Blocked;
            true
        } else {
            inner.state == MailboxState::Blocked
        }
    }

    /// Close the mailbox, returning all drained elements for bouncing.
    pub fn close(&self, reason: ExitReason) -> Vec<MailboxElement> {
        let mut inner = self.inner.lock();
        if inner.state == MailboxState::Closed {
            return Vec::new();
        }
        inner.state = MailboxState::Closed;
        inner.fail_reason = Some(reason);
        inner.queue.drain(..).collect()
    }

    /// Current state.
    pub fn state(&self) -> MailboxState {
        self.inner.lock().state
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether the mailbox holds no elements.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe half of the shell: the mailbox plus the owner pointer.
///
/// External threads hold this as an [`ActorRef`]; the mutex around the owner
/// ensures the socket manager is not detached mid-wakeup.
pub struct ShellCore {
    id: ActorId,
    mailbox: Mailbox,
    owner: Mutex<Option<ManagerWaker>>,
}

impl ShellCore {
    fn new(id: ActorId, owner: ManagerWaker) -> Arc<Self> {
        Arc::new(Self {
            id,
            mailbox: Mailbox::new(),
            owner: Mutex::new(Some(owner)),
        })
    }

    /// The shell's mailbox.
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }
}

impl ActorSink for ShellCore {
    fn id(&self) -> ActorId {
        self.id
    }

    fn enqueue(&self, element: MailboxElement) -> EnqueueResult {
        match self.mailbox.push(element) {
            PushOutcome::Stored => EnqueueResult::Success,
            PushOutcome::Unblocked => {
                // The owner can only be detached after the mailbox closed;
                // holding the mutex across the wakeup keeps the manager
                // alive for the duration of the call.
                let owner = self.owner.lock();
                if let Some(waker) = owner.as_ref() {
                    waker.register_writing();
                }
                EnqueueResult::UnblockedReader
            }
            PushOutcome::Closed(element, reason) => {
                bounce_request(&element, &reason);
                EnqueueResult::Closed
            }
        }
    }
}

/// Result of offering an element to the installed behavior.
pub enum BehaviorOutcome {
    /// The behavior handled the element; an optional reply for the sender.
    Consumed(Option<Message>),
    /// The behavior does not understand the element; fall back.
    Skipped,
}

/// Handler for mailbox elements.
pub type Behavior = Box<dyn FnMut(&mut MailboxElement) -> BehaviorOutcome>;

/// Handler of last resort; its result is emitted like a regular reply.
pub type Fallback = Box<dyn FnMut(&mut MailboxElement) -> Option<Message>>;

/// The owning, single-threaded half of the shell.
///
/// Dropping the shell quits it with [`ExitReason::Normal`].
pub struct ActorShell {
    core: Arc<ShellCore>,
    behavior: Option<Behavior>,
    fallback: Option<Fallback>,
    multiplexed_responses: HashMap<u64, Behavior>,
    terminated: bool,
}

impl ActorShell {
    /// Create a shell attached to the socket manager identified by `owner`.
    pub fn new(id: ActorId, owner: ManagerWaker) -> Self {
        Self {
            core: ShellCore::new(id, owner),
            behavior: None,
            fallback: None,
            multiplexed_responses: HashMap::new(),
            terminated: false,
        }
    }

    /// Shareable handle for enqueuing into this shell.
    pub fn as_actor_ref(&self) -> ActorRef {
        self.core.clone()
    }

    /// Install the message handler.
    pub fn set_behavior(&mut self, behavior: Behavior) {
        self.behavior = Some(behavior);
    }

    /// Install the handler for messages the behavior rejects.
    pub fn set_fallback(&mut self, fallback: Fallback) {
        self.fallback = Some(fallback);
    }

    /// Register a one-shot handler for a multiplexed response.
    pub fn add_multiplexed_response_handler(&mut self, request_number: u64, behavior: Behavior) {
        self.multiplexed_responses.insert(request_number, behavior);
    }

    /// Dequeue the next element, or `None` on an empty mailbox. Does not
    /// block the mailbox.
    pub fn next_message(&mut self) -> Option<MailboxElement> {
        self.core.mailbox.pop()
    }

    /// Try to park the mailbox; the next enqueue will re-register the owner
    /// for write events.
    pub fn try_block_mailbox(&mut self) -> bool {
        self.core.mailbox.try_block()
    }

    /// Dequeue and process one message.
    ///
    /// Responses go through the multiplexed-responses table; everything else
    /// through the behavior, then the fallback. Replies are emitted to
    /// request senders like a regular actor would.
    pub fn consume_message(&mut self) -> bool {
        let Some(mut element) = self.core.mailbox.pop() else {
            return false;
        };
        if element.mid.is_response() {
            let key = element.mid.request_number();
            match self.multiplexed_responses.remove(&key) {
                Some(mut handler) => {
                    handler(&mut element);
                }
                None => {
                    tracing::debug!(request = key, "dropped unexpected response");
                }
            }
            return true;
        }
        let outcome = match self.behavior.as_mut() {
            Some(behavior) => behavior(&mut element),
            None => BehaviorOutcome::Skipped,
        };
        let reply = match outcome {
            BehaviorOutcome::Consumed(reply) => reply,
            BehaviorOutcome::Skipped => match self.fallback.as_mut() {
                Some(fallback) => fallback(&mut element),
                None => {
                    tracing::debug!("dropped message without matching handler");
                    None
                }
            },
        };
        emit_reply(&element, reply);
        true
    }

    /// Close the mailbox, bounce everything still queued, and detach from
    /// the owning socket manager.
    pub fn quit(&mut self, reason: ExitReason) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        let dropped = self.core.mailbox.close(reason.clone());
        for element in &dropped {
            bounce_request(element, &reason);
        }
        // Detach under the mutex so an in-flight enqueue either sees the
        // owner or the closed mailbox, never a dangling manager.
        self.core.owner.lock().take();
        self.multiplexed_responses.clear();
    }
}

impl Drop for ActorShell {
    fn drop(&mut self) {
        self.quit(ExitReason::Normal);
    }
}

/// Send `reply` to the element's sender when the element is a request.
fn emit_reply(element: &MailboxElement, reply: Option<Message>) {
    let Some(reply) = reply else {
        return;
    };
    if !element.mid.is_request() {
        return;
    }
    let Some(sender) = &element.sender else {
        return;
    };
    let response = MailboxElement::new(None, element.mid.response_to(), reply);
    if sender.enqueue(response) == EnqueueResult::Closed {
        tracing::debug!(sender = sender.id(), "reply hit a closed mailbox");
    }
}
