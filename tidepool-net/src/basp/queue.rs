//! Receipt-ordered delivery of inbound actor messages.
//!
//! Deserialization runs on a worker pool, so completions arrive in arbitrary
//! order. The queue assigns every inbound message a monotonically increasing
//! id at receipt (on the I/O thread) and releases results to destination
//! mailboxes strictly in id order: a worker holding id `k + 1` publishes
//! into the hold-back map until id `k` was published or dropped.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tidepool_core::{ActorRef, MailboxElement};

enum Slot {
    Deliver(ActorRef, MailboxElement),
    Dropped,
}

#[derive(Default)]
struct QueueState {
    /// Next id handed out at receipt.
    next_id: u64,
    /// Next id allowed to reach a mailbox.
    next_undelivered: u64,
    /// Out-of-order completions waiting for their turn.
    pending: BTreeMap<u64, Slot>,
}

/// Orders inbound messages by receipt id across parallel deserialization.
#[derive(Default)]
pub struct MessageQueue {
    state: Mutex<QueueState>,
}

impl MessageQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next receipt id. Must be called on the I/O thread, in
    /// arrival order.
    pub fn new_id(&self) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    /// Publish a completed message. Delivers immediately when `id` is next
    /// in line, then flushes any directly following completions.
    pub fn push(&self, id: u64, receiver: ActorRef, element: MailboxElement) {
        self.publish(id, Slot::Deliver(receiver, element));
    }

    /// Release an id whose message was dropped (deserialization failure or
    /// missing receiver) so the sequence cannot stall.
    pub fn drop_id(&self, id: u64) {
        self.publish(id, Slot::Dropped);
    }

    /// Number of held-back completions, for tests.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn publish(&self, id: u64, slot: Slot) {
        // Deliveries happen under the lock: releasing it between the
        // contiguity check and the enqueue would let a later id overtake.
        let mut state = self.state.lock();
        debug_assert!(id >= state.next_undelivered, "id released twice");
        if id != state.next_undelivered {
            state.pending.insert(id, slot);
            return;
        }
        let mut current = slot;
        loop {
            if let Slot::Deliver(receiver, element) = current {
                receiver.enqueue(element);
            }
            state.next_undelivered += 1;
            let next_id = state.next_undelivered;
            match state.pending.remove(&next_id) {
                Some(next) => current = next,
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tidepool_core::{ActorId, ActorSink, EnqueueResult, Message, MessageId};

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<u64>>,
    }

    impl ActorSink for RecordingSink {
        fn id(&self) -> ActorId {
            1
        }

        fn enqueue(&self, element: MailboxElement) -> EnqueueResult {
            let tag = *element.content.downcast_ref::<u64>().expect("tag");
            self.received.lock().push(tag);
            EnqueueResult::Success
        }
    }

    fn element(tag: u64) -> MailboxElement {
        MailboxElement::new(None, MessageId::none(), Message::new(tag))
    }

    #[test]
    fn test_in_order_delivery() {
        let queue = MessageQueue::new();
        let sink = Arc::new(RecordingSink::default());

        for tag in 0..3 {
            let id = queue.new_id();
            queue.push(id, sink.clone(), element(tag));
        }
        assert_eq!(*sink.received.lock(), vec![0, 1, 2]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_out_of_order_completion_is_reordered() {
        let queue = MessageQueue::new();
        let sink = Arc::new(RecordingSink::default());

        let first = queue.new_id();
        let second = queue.new_id();
        let third = queue.new_id();

        // Worker for the second message finishes first.
        queue.push(second, sink.clone(), element(2));
        assert!(sink.received.lock().is_empty());
        assert_eq!(queue.pending(), 1);

        queue.push(third, sink.clone(), element(3));
        assert!(sink.received.lock().is_empty());

        queue.push(first, sink.clone(), element(1));
        assert_eq!(*sink.received.lock(), vec![1, 2, 3]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_dropped_id_does_not_stall() {
        let queue = MessageQueue::new();
        let sink = Arc::new(RecordingSink::default());

        let first = queue.new_id();
        let second = queue.new_id();

        queue.push(second, sink.clone(), element(2));
        queue.drop_id(first);
        assert_eq!(*sink.received.lock(), vec![2]);
    }

    #[test]
    fn test_parallel_publication() {
        let queue = Arc::new(MessageQueue::new());
        let sink = Arc::new(RecordingSink::default());

        let ids: Vec<u64> = (0..32).map(|_| queue.new_id()).collect();
        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let queue = queue.clone();
                let sink = sink.clone();
                std::thread::spawn(move || queue.push(id, sink, element(id)))
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }

        let received = sink.received.lock();
        assert_eq!(received.len(), 32);
        assert!(received.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
