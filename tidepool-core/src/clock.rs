//! Clock interface for one-shot protocol timeouts.
//!
//! Endpoint managers schedule timeouts against the host's [`ActorClock`];
//! firing timers come back through a [`TimeoutSink`] (in practice the
//! endpoint's timeout proxy, which turns them into queue events).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Receiver for fired timeouts.
pub trait TimeoutSink: Send + Sync {
    /// A timeout with the given tag and id elapsed.
    fn fire(&self, tag: &str, id: u64);
}

/// One-shot timer facility.
pub trait ActorClock: Send + Sync {
    /// Arrange for `sink.fire(tag, id)` after `delay`.
    fn schedule(&self, delay: Duration, tag: String, id: u64, sink: Arc<dyn TimeoutSink>);

    /// Cancel a scheduled timeout. A cancelled timeout never fires;
    /// cancelling an unknown timeout is a no-op.
    fn cancel(&self, tag: &str, id: u64);
}

/// Tokio-backed [`ActorClock`] spawning one sleep task per timeout.
#[derive(Default)]
pub struct TokioClock {
    cancelled: Arc<Mutex<HashSet<(String, u64)>>>,
}

impl TokioClock {
    /// Create a clock. Scheduling requires a running tokio runtime.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ActorClock for TokioClock {
    fn schedule(&self, delay: Duration, tag: String, id: u64, sink: Arc<dyn TimeoutSink>) {
        // Clear any stale cancellation from a previous timeout reusing the key.
        self.cancelled.lock().remove(&(tag.clone(), id));
        let cancelled = Arc::clone(&self.cancelled);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if cancelled.lock().remove(&(tag.clone(), id)) {
                tracing::trace!(tag = %tag, id, "timeout cancelled before firing");
                return;
            }
            sink.fire(&tag, id);
        });
    }

    fn cancel(&self, tag: &str, id: u64) {
        self.cancelled.lock().insert((tag.to_string(), id));
    }
}
