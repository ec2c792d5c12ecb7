//! Stream transport: one TCP connection under a protocol stack.
//!
//! Reads accumulate in a buffer governed by the application's
//! [`ReceivePolicy`]; once the delivery threshold is reached the buffered
//! prefix goes to [`Application::consume`], which reports how many bytes it
//! processed. Writes drain a queue of header/payload buffers with partial
//! writes carried across events; drained buffers return to bounded caches.

use std::collections::VecDeque;
use std::rc::Rc;

use tidepool_core::{ActorId, ActorRef, ExitReason, MailboxElement, NodeId};
use tokio::net::TcpStream;

use crate::config::NetConfig;
use crate::error::NetError;
use crate::multiplexer::ManagerWaker;
use crate::transport::cache::BufferPool;
use crate::transport::contract::{Application, ReceivePolicy, Transport, TransportOps};
use crate::transport::split_locator;

/// Backpressure bound: stop accepting new packets once this many buffers
/// are queued.
const MAX_QUEUED_BUFFERS: usize = 128;

/// The downward half of a stream transport: everything the application may
/// touch from within a callback.
pub(crate) struct StreamIo {
    socket: Rc<TcpStream>,
    waker: ManagerWaker,
    header_bufs: BufferPool,
    payload_bufs: BufferPool,
    write_queue: VecDeque<(bool, Vec<u8>)>,
    written: usize,
    threshold: usize,
    buffer_size: usize,
    abort: Option<NetError>,
}

impl StreamIo {
    fn recycle_front(&mut self) {
        if let Some((is_header, buf)) = self.write_queue.pop_front() {
            if is_header {
                self.header_bufs.recycle(buf);
            } else {
                self.payload_bufs.recycle(buf);
            }
        }
        self.written = 0;
    }
}

impl TransportOps for StreamIo {
    fn next_header_buffer(&mut self) -> Vec<u8> {
        self.header_bufs.acquire()
    }

    fn next_payload_buffer(&mut self) -> Vec<u8> {
        self.payload_bufs.acquire()
    }

    fn write_packet(&mut self, header: Vec<u8>, payloads: Vec<Vec<u8>>) {
        let was_empty = self.write_queue.is_empty();
        if header.is_empty() {
            self.header_bufs.recycle(header);
        } else {
            self.write_queue.push_back((true, header));
        }
        for payload in payloads {
            if payload.is_empty() {
                self.payload_bufs.recycle(payload);
            } else {
                self.write_queue.push_back((false, payload));
            }
        }
        if was_empty && !self.write_queue.is_empty() {
            self.waker.register_writing();
        }
    }

    fn configure_read(&mut self, policy: ReceivePolicy) {
        let (threshold, buffer_size) = policy.thresholds();
        self.threshold = threshold;
        self.buffer_size = buffer_size;
    }

    fn abort_reason(&mut self, reason: NetError) {
        if self.abort.is_none() {
            self.abort = Some(reason);
        }
    }

    fn has_abort_reason(&self) -> bool {
        self.abort.is_some()
    }

    fn take_abort_reason(&mut self) -> Option<NetError> {
        self.abort.take()
    }

    fn can_send_more(&self) -> bool {
        self.write_queue.len() < MAX_QUEUED_BUFFERS
    }
}

/// TCP transport driving an [`Application`].
pub struct StreamTransport<A: Application> {
    app: A,
    io: StreamIo,
    read_buf: Vec<u8>,
    collected: usize,
    max_consecutive_reads: usize,
}

impl<A: Application> StreamTransport<A> {
    /// Wrap a connected socket. `waker` must address the socket manager this
    /// transport will live in.
    pub fn new(socket: Rc<TcpStream>, waker: ManagerWaker, app: A) -> Self {
        Self {
            app,
            io: StreamIo {
                socket,
                waker,
                header_bufs: BufferPool::new(0),
                payload_bufs: BufferPool::new(0),
                write_queue: VecDeque::new(),
                written: 0,
                threshold: 1024,
                buffer_size: 1024,
                abort: None,
            },
            read_buf: Vec::new(),
            collected: 0,
            max_consecutive_reads: 50,
        }
    }

    /// Immutable access to the application layer.
    pub fn application(&self) -> &A {
        &self.app
    }

    /// Mutable access to the application layer.
    pub fn application_mut(&mut self) -> &mut A {
        &mut self.app
    }

    fn fail(&mut self, reason: NetError) {
        tracing::debug!(error = %reason, "stream transport failure");
        let replica = reason.replicate();
        self.io.abort_reason(reason);
        self.app.abort(&replica);
    }

    /// Feed buffered bytes into the application until it asks for more.
    /// Returns `false` on a fatal consume result.
    fn deliver(&mut self) -> bool {
        while self.collected >= self.io.threshold && self.collected > 0 {
            let buf = std::mem::take(&mut self.read_buf);
            let consumed = self.app.consume(&mut self.io, &buf[..self.collected]);
            self.read_buf = buf;
            if consumed < 0 {
                let reason = self
                    .io
                    .take_abort_reason()
                    .unwrap_or_else(|| NetError::runtime("protocol rejected input"));
                self.fail(reason);
                return false;
            }
            let consumed = consumed as usize;
            if consumed == 0 {
                if self.collected >= self.io.buffer_size {
                    // The application wants more bytes than it allows us to
                    // buffer; nothing can ever complete.
                    self.fail(NetError::runtime("read policy stalled"));
                    return false;
                }
                return true;
            }
            debug_assert!(consumed <= self.collected);
            let consumed = consumed.min(self.collected);
            self.read_buf.copy_within(consumed..self.collected, 0);
            self.collected -= consumed;
        }
        true
    }
}

impl<A: Application> Transport for StreamTransport<A> {
    fn init(&mut self, owner: &ManagerWaker, cfg: &NetConfig) -> Result<(), NetError> {
        self.io.header_bufs = BufferPool::new(cfg.max_header_buffers);
        self.io.payload_bufs = BufferPool::new(cfg.max_payload_buffers);
        self.max_consecutive_reads = cfg.max_consecutive_reads.max(1);
        self.app.init(owner, &mut self.io, cfg)
    }

    fn handle_read_event(&mut self) -> bool {
        for _ in 0..self.max_consecutive_reads {
            if self.read_buf.len() < self.io.buffer_size {
                self.read_buf.resize(self.io.buffer_size, 0);
            }
            if self.collected < self.io.buffer_size {
                let chunk = {
                    let target = &mut self.read_buf[self.collected..self.io.buffer_size];
                    self.io.socket.try_read(target)
                };
                match chunk {
                    Ok(0) => {
                        self.fail(NetError::ConnectionClosed);
                        return false;
                    }
                    Ok(n) => self.collected += n,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                    Err(e) => {
                        self.fail(NetError::Io(e));
                        return false;
                    }
                }
            }
            if !self.deliver() {
                return false;
            }
        }
        true
    }

    fn handle_write_event(&mut self) -> bool {
        // Cap the pull loop; a shell mailbox under sustained fire keeps the
        // manager registered and continues on the next event.
        for _ in 0..MAX_QUEUED_BUFFERS {
            while !self.io.write_queue.is_empty() {
                let result = {
                    let (_, buf) = &self.io.write_queue[0];
                    self.io.socket.try_write(&buf[self.io.written..])
                };
                let front_len = self.io.write_queue[0].1.len();
                match result {
                    Ok(n) => {
                        self.io.written += n;
                        if self.io.written >= front_len {
                            self.io.recycle_front();
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                    Err(e) => {
                        self.fail(NetError::Io(e));
                        return false;
                    }
                }
            }
            if !self.app.prepare_send(&mut self.io) {
                let reason = self
                    .io
                    .take_abort_reason()
                    .unwrap_or_else(|| NetError::runtime("prepare_send failed"));
                self.fail(reason);
                return false;
            }
            if !self.io.write_queue.is_empty() {
                continue;
            }
            if self.app.done_sending(&mut self.io) {
                return false;
            }
        }
        true
    }

    fn resolve(&mut self, locator: &str, listener: ActorRef) {
        let (_, path) = split_locator(locator);
        self.app.write_resolve_request(&mut self.io, path, listener);
    }

    fn new_proxy(&mut self, peer: &NodeId, id: ActorId) {
        self.app.write_new_proxy(&mut self.io, peer, id);
    }

    fn local_actor_down(&mut self, peer: &NodeId, id: ActorId, reason: ExitReason) {
        self.app.write_local_actor_down(&mut self.io, peer, id, reason);
    }

    fn timeout(&mut self, tag: &str, id: u64) {
        self.app.handle_timeout(&mut self.io, tag, id);
    }

    fn write_message(&mut self, element: MailboxElement, receiver: ActorId, _peer: Option<&NodeId>) {
        self.app.write_message(&mut self.io, element, receiver);
    }

    fn handle_error(&mut self, reason: NetError) {
        self.fail(reason);
    }

    fn abort_reason(&self) -> Option<&NetError> {
        self.io.abort.as_ref()
    }
}
