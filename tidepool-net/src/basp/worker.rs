//! Deserialization worker pool for inbound actor messages.
//!
//! The I/O thread assigns each inbound message its receipt id, then either
//! hands the raw payload to an idle pool worker or, when the pool ran dry,
//! deserializes synchronously. Either way the result goes through the
//! [`MessageQueue`](super::MessageQueue), which restores receipt order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tidepool_core::{
    ActorRegistry, ContentCodec, MailboxElement, MessageId, ProxyRegistry,
};
use tokio::sync::mpsc;

use crate::basp::header::Header;
use crate::basp::payload::ActorMessagePayload;
use crate::basp::queue::MessageQueue;

/// Everything a worker needs to turn payload bytes into a delivery.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) registry: Arc<dyn ActorRegistry>,
    pub(crate) proxies: Arc<ProxyRegistry>,
    pub(crate) codec: Arc<dyn ContentCodec>,
    pub(crate) queue: Arc<MessageQueue>,
}

pub(crate) struct Job {
    pub(crate) msg_id: u64,
    pub(crate) header: Header,
    pub(crate) payload: Vec<u8>,
}

/// Fixed pool of deserialization threads.
pub struct WorkerHub {
    tx: Option<mpsc::UnboundedSender<Job>>,
    idle: Arc<AtomicUsize>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerHub {
    /// Spawn `count` worker threads.
    pub(crate) fn new(count: usize, ctx: WorkerContext) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let idle = Arc::new(AtomicUsize::new(count));
        let mut threads = Vec::with_capacity(count);
        for index in 0..count {
            let rx = rx.clone();
            let idle_thread = idle.clone();
            let ctx = ctx.clone();
            let thread = std::thread::Builder::new()
                .name(format!("basp-worker-{index}"))
                .spawn(move || {
                    loop {
                        // One worker at a time parks on the channel; the
                        // lock is released while processing.
                        let job = rx.lock().blocking_recv();
                        let Some(job) = job else {
                            return;
                        };
                        handle_remote_message(&ctx, job.msg_id, &job.header, &job.payload);
                        idle_thread.fetch_add(1, Ordering::Release);
                    }
                });
            match thread {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    tracing::error!(error = %err, "failed to spawn BASP worker");
                    idle.fetch_sub(1, Ordering::Release);
                }
            }
        }
        Self {
            tx: Some(tx),
            idle,
            threads,
        }
    }

    /// Number of currently idle workers.
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Claim an idle worker and hand it `job`. Gives the job back when the
    /// pool ran dry; the caller then deserializes synchronously.
    pub(crate) fn try_dispatch(&self, job: Job) -> Result<(), Job> {
        let mut available = self.idle.load(Ordering::Acquire);
        loop {
            if available == 0 {
                return Err(job);
            }
            match self.idle.compare_exchange_weak(
                available,
                available - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => available = actual,
            }
        }
        match &self.tx {
            Some(tx) => tx.send(job).map_err(|rejected| {
                self.idle.fetch_add(1, Ordering::Release);
                rejected.0
            }),
            None => {
                self.idle.fetch_add(1, Ordering::Release);
                Err(job)
            }
        }
    }
}

impl Drop for WorkerHub {
    fn drop(&mut self) {
        // Closing the channel ends the worker loops.
        self.tx.take();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                tracing::error!("BASP worker panicked");
            }
        }
    }
}

/// Deserialize one actor message and publish it through the ordering queue.
///
/// Runs on pool threads or, as fallback, on the I/O thread. Failures release
/// the receipt id so later messages are not held back.
pub(crate) fn handle_remote_message(ctx: &WorkerContext, msg_id: u64, hdr: &Header, payload: &[u8]) {
    let fields = match ActorMessagePayload::decode(payload) {
        Ok(fields) => fields,
        Err(err) => {
            tracing::error!(error = %err, "failed to deserialize actor message payload");
            ctx.queue.drop_id(msg_id);
            return;
        }
    };
    if fields.dest_id == 0 {
        tracing::debug!("actor message without receiver, dropped");
        ctx.queue.drop_id(msg_id);
        return;
    }
    let Some(receiver) = ctx.registry.get(fields.dest_id) else {
        tracing::debug!(actor = fields.dest_id, "no actor found for given ID, dropped");
        ctx.queue.drop_id(msg_id);
        return;
    };
    let content = match ctx.codec.decode(&fields.content) {
        Ok(content) => content,
        Err(err) => {
            tracing::error!(error = %err, "failed to deserialize message content");
            ctx.queue.drop_id(msg_id);
            return;
        }
    };
    // Anonymous senders (id 0) deliver without a handle; everyone else gets
    // a proxy minted on demand.
    let sender = if fields.source_node.is_valid() && fields.source_id != 0 {
        Some(ctx.proxies.get_or_put(fields.source_node, fields.source_id))
    } else {
        None
    };
    let element = MailboxElement {
        sender,
        mid: MessageId(hdr.operation_data),
        stages: fields.stages,
        content,
    };
    ctx.queue.push(msg_id, receiver, element);
}
