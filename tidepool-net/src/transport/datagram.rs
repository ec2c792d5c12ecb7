//! Datagram transport: one UDP socket serving many peer endpoints.
//!
//! Inbound datagrams are demultiplexed by source address to per-endpoint
//! application instances, created lazily on the first packet from a new
//! endpoint. Outbound packets queue in strict FIFO order with head-of-line
//! blocking: a datagram either leaves the socket whole or the head entry
//! stays for the next write event.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;

use tidepool_core::{ActorId, ActorRef, ExitReason, MailboxElement, NodeId};
use tokio::net::UdpSocket;

use crate::config::NetConfig;
use crate::error::NetError;
use crate::multiplexer::ManagerWaker;
use crate::transport::cache::BufferPool;
use crate::transport::contract::{Application, ReceivePolicy, Transport, TransportOps};
use crate::transport::split_locator;

/// Largest datagram accepted from the socket.
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Creates per-endpoint application instances.
pub trait DatagramAppFactory {
    /// The application type driven for each endpoint.
    type App: Application;

    /// Create the application for a newly seen endpoint.
    fn make(&mut self, endpoint: SocketAddr) -> Self::App;
}

struct OutboundPacket {
    destination: SocketAddr,
    /// Header and payload assembled into a single datagram.
    data: Vec<u8>,
}

struct DatagramIo {
    socket: Rc<UdpSocket>,
    waker: ManagerWaker,
    header_bufs: BufferPool,
    payload_bufs: BufferPool,
    packet_queue: VecDeque<OutboundPacket>,
    abort: Option<NetError>,
}

/// [`TransportOps`] scoped to one endpoint: packets written through this
/// handle carry the endpoint as their destination.
struct WorkerOps<'a> {
    io: &'a mut DatagramIo,
    endpoint: SocketAddr,
}

impl TransportOps for WorkerOps<'_> {
    fn next_header_buffer(&mut self) -> Vec<u8> {
        self.io.header_bufs.acquire()
    }

    fn next_payload_buffer(&mut self) -> Vec<u8> {
        self.io.payload_bufs.acquire()
    }

    fn write_packet(&mut self, header: Vec<u8>, payloads: Vec<Vec<u8>>) {
        let was_empty = self.io.packet_queue.is_empty();
        // Datagrams leave the socket in one piece; assemble into the header
        // buffer and recycle the payload buffers right away.
        let mut data = header;
        for payload in payloads {
            data.extend_from_slice(&payload);
            self.io.payload_bufs.recycle(payload);
        }
        if data.is_empty() {
            self.io.header_bufs.recycle(data);
            return;
        }
        self.io.packet_queue.push_back(OutboundPacket {
            destination: self.endpoint,
            data,
        });
        if was_empty {
            self.io.waker.register_writing();
        }
    }

    fn configure_read(&mut self, _policy: ReceivePolicy) {
        // Reads operate on whole datagrams; the policy does not chunk them.
    }

    fn abort_reason(&mut self, reason: NetError) {
        if self.io.abort.is_none() {
            self.io.abort = Some(reason);
        }
    }

    fn has_abort_reason(&self) -> bool {
        self.io.abort.is_some()
    }

    fn take_abort_reason(&mut self) -> Option<NetError> {
        self.io.abort.take()
    }

    fn can_send_more(&self) -> bool {
        self.io.packet_queue.len() < 128
    }
}

struct WorkerEntry<A> {
    app: A,
    node: Option<NodeId>,
}

/// UDP transport demultiplexing one socket across peer endpoints.
pub struct DatagramTransport<F: DatagramAppFactory> {
    factory: F,
    io: DatagramIo,
    workers: HashMap<SocketAddr, WorkerEntry<F::App>>,
    node_index: HashMap<NodeId, SocketAddr>,
    timeout_index: HashMap<u64, SocketAddr>,
    read_buf: Vec<u8>,
    max_consecutive_reads: usize,
    owner: Option<ManagerWaker>,
    cfg: NetConfig,
}

impl<F: DatagramAppFactory> DatagramTransport<F> {
    /// Wrap a bound socket. `waker` must address the socket manager this
    /// transport will live in.
    pub fn new(socket: Rc<UdpSocket>, waker: ManagerWaker, factory: F) -> Self {
        Self {
            factory,
            io: DatagramIo {
                socket,
                waker,
                header_bufs: BufferPool::new(0),
                payload_bufs: BufferPool::new(0),
                packet_queue: VecDeque::new(),
                abort: None,
            },
            workers: HashMap::new(),
            node_index: HashMap::new(),
            timeout_index: HashMap::new(),
            read_buf: Vec::new(),
            max_consecutive_reads: 50,
            owner: None,
            cfg: NetConfig::default(),
        }
    }

    /// Number of per-endpoint application instances, for tests.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Create the worker for `endpoint` if none exists yet; returns `false`
    /// when initialization failed.
    fn ensure_worker(&mut self, endpoint: SocketAddr) -> bool {
        if self.workers.contains_key(&endpoint) {
            return true;
        }
        let Some(owner) = self.owner.clone() else {
            tracing::error!("datagram transport used before init");
            return false;
        };
        let mut app = self.factory.make(endpoint);
        let mut ops = WorkerOps {
            io: &mut self.io,
            endpoint,
        };
        match app.init(&owner, &mut ops, &self.cfg) {
            Ok(()) => {
                self.workers.insert(endpoint, WorkerEntry { app, node: None });
                true
            }
            Err(err) => {
                tracing::warn!(%endpoint, error = %err, "datagram application init failed");
                false
            }
        }
    }

    fn remove_worker(&mut self, endpoint: SocketAddr, reason: &NetError) {
        if let Some(mut entry) = self.workers.remove(&endpoint) {
            entry.app.abort(reason);
            if let Some(node) = entry.node {
                self.node_index.remove(&node);
            }
        }
        self.timeout_index.retain(|_, ep| *ep != endpoint);
    }

    fn dispatch_datagram(&mut self, endpoint: SocketAddr, len: usize) {
        if !self.ensure_worker(endpoint) {
            return;
        }
        let data = std::mem::take(&mut self.read_buf);
        let consumed = {
            let Some(entry) = self.workers.get_mut(&endpoint) else {
                self.read_buf = data;
                return;
            };
            let mut ops = WorkerOps {
                io: &mut self.io,
                endpoint,
            };
            entry.app.consume(&mut ops, &data[..len])
        };
        self.read_buf = data;
        if consumed < 0 {
            let reason = self
                .io
                .abort
                .take()
                .unwrap_or_else(|| NetError::runtime("datagram rejected"));
            tracing::debug!(%endpoint, error = %reason, "dropping datagram endpoint");
            self.remove_worker(endpoint, &reason);
            return;
        }
        if (consumed as usize) < len {
            tracing::debug!(
                %endpoint,
                consumed,
                len,
                "datagram left trailing bytes, dropped"
            );
        }
        // Record the peer's node id once the handshake revealed it.
        if let Some(entry) = self.workers.get_mut(&endpoint)
            && entry.node.is_none()
            && let Some(node) = entry.app.peer()
        {
            entry.node = Some(node);
            self.node_index.insert(node, endpoint);
        }
    }

    fn worker_for_node(&mut self, node: &NodeId) -> Option<SocketAddr> {
        self.node_index.get(node).copied()
    }

    fn abort_all(&mut self, reason: &NetError) {
        for entry in self.workers.values_mut() {
            entry.app.abort(reason);
        }
        self.workers.clear();
        self.node_index.clear();
        self.timeout_index.clear();
    }
}

impl<F: DatagramAppFactory> Transport for DatagramTransport<F> {
    fn init(&mut self, owner: &ManagerWaker, cfg: &NetConfig) -> Result<(), NetError> {
        self.io.header_bufs = BufferPool::new(cfg.max_header_buffers);
        self.io.payload_bufs = BufferPool::new(cfg.max_payload_buffers);
        self.max_consecutive_reads = cfg.max_consecutive_reads.max(1);
        self.owner = Some(owner.clone());
        self.cfg = cfg.clone();
        self.read_buf.resize(MAX_DATAGRAM_SIZE, 0);
        Ok(())
    }

    fn handle_read_event(&mut self) -> bool {
        for _ in 0..self.max_consecutive_reads {
            if self.read_buf.len() < MAX_DATAGRAM_SIZE {
                self.read_buf.resize(MAX_DATAGRAM_SIZE, 0);
            }
            let received = self.io.socket.try_recv_from(&mut self.read_buf);
            match received {
                Ok((len, endpoint)) => self.dispatch_datagram(endpoint, len),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(e) => {
                    let reason = NetError::Io(e);
                    tracing::debug!(error = %reason, "datagram socket failure");
                    self.abort_all(&reason);
                    self.io.abort = Some(reason);
                    return false;
                }
            }
        }
        true
    }

    fn handle_write_event(&mut self) -> bool {
        // Bounded pull loop; sustained mailbox traffic keeps the manager
        // registered and continues on the next event.
        for _ in 0..128 {
            while !self.io.packet_queue.is_empty() {
                let result = {
                    let packet = &self.io.packet_queue[0];
                    self.io.socket.try_send_to(&packet.data, packet.destination)
                };
                match result {
                    Ok(_) => {
                        if let Some(sent) = self.io.packet_queue.pop_front() {
                            self.io.header_bufs.recycle(sent.data);
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                    Err(e) => {
                        let reason = NetError::Io(e);
                        tracing::debug!(error = %reason, "datagram send failure");
                        self.abort_all(&reason);
                        self.io.abort = Some(reason);
                        return false;
                    }
                }
            }
            // Give every worker a chance to enqueue pending output.
            let endpoints: Vec<SocketAddr> = self.workers.keys().copied().collect();
            for endpoint in endpoints {
                if let Some(entry) = self.workers.get_mut(&endpoint) {
                    let mut ops = WorkerOps {
                        io: &mut self.io,
                        endpoint,
                    };
                    if !entry.app.prepare_send(&mut ops) {
                        let reason = self
                            .io
                            .abort
                            .take()
                            .unwrap_or_else(|| NetError::runtime("prepare_send failed"));
                        self.remove_worker(endpoint, &reason);
                    }
                }
            }
            if !self.io.packet_queue.is_empty() {
                continue;
            }
            let endpoints: Vec<SocketAddr> = self.workers.keys().copied().collect();
            let mut all_done = true;
            for endpoint in endpoints {
                if let Some(entry) = self.workers.get_mut(&endpoint) {
                    let mut ops = WorkerOps {
                        io: &mut self.io,
                        endpoint,
                    };
                    all_done &= entry.app.done_sending(&mut ops);
                }
            }
            if all_done && self.io.packet_queue.is_empty() {
                return false;
            }
            if self.io.packet_queue.is_empty() {
                // A mailbox re-armed between prepare_send and done_sending;
                // loop once more to pick its messages up.
                continue;
            }
        }
        true
    }

    fn resolve(&mut self, locator: &str, listener: ActorRef) {
        let (authority, path) = split_locator(locator);
        let Ok(endpoint) = authority.parse::<SocketAddr>() else {
            tracing::warn!(locator, "datagram resolve with unparsable authority");
            return;
        };
        if !self.ensure_worker(endpoint) {
            return;
        }
        if let Some(entry) = self.workers.get_mut(&endpoint) {
            let mut ops = WorkerOps {
                io: &mut self.io,
                endpoint,
            };
            entry.app.write_resolve_request(&mut ops, path, listener);
        }
    }

    fn new_proxy(&mut self, peer: &NodeId, id: ActorId) {
        let Some(endpoint) = self.worker_for_node(peer) else {
            tracing::warn!(node = %peer, "new_proxy for unknown datagram peer");
            return;
        };
        if let Some(entry) = self.workers.get_mut(&endpoint) {
            let mut ops = WorkerOps {
                io: &mut self.io,
                endpoint,
            };
            entry.app.write_new_proxy(&mut ops, peer, id);
        }
    }

    fn local_actor_down(&mut self, peer: &NodeId, id: ActorId, reason: ExitReason) {
        let Some(endpoint) = self.worker_for_node(peer) else {
            tracing::warn!(node = %peer, "local_actor_down for unknown datagram peer");
            return;
        };
        if let Some(entry) = self.workers.get_mut(&endpoint) {
            let mut ops = WorkerOps {
                io: &mut self.io,
                endpoint,
            };
            entry.app.write_local_actor_down(&mut ops, peer, id, reason);
        }
    }

    fn timeout(&mut self, tag: &str, id: u64) {
        let Some(endpoint) = self.timeout_index.remove(&id) else {
            tracing::debug!(tag, id, "timeout without endpoint association");
            return;
        };
        if let Some(entry) = self.workers.get_mut(&endpoint) {
            let mut ops = WorkerOps {
                io: &mut self.io,
                endpoint,
            };
            entry.app.handle_timeout(&mut ops, tag, id);
        }
    }

    fn register_timeout(&mut self, id: u64, endpoint: Option<SocketAddr>) {
        if let Some(endpoint) = endpoint {
            self.timeout_index.insert(id, endpoint);
        }
    }

    fn cancel_timeout(&mut self, id: u64) {
        self.timeout_index.remove(&id);
    }

    fn write_message(&mut self, element: MailboxElement, receiver: ActorId, peer: Option<&NodeId>) {
        let Some(endpoint) = peer.and_then(|node| self.worker_for_node(node)) else {
            tracing::warn!("outbound datagram message without a known peer, dropped");
            return;
        };
        if let Some(entry) = self.workers.get_mut(&endpoint) {
            let mut ops = WorkerOps {
                io: &mut self.io,
                endpoint,
            };
            entry.app.write_message(&mut ops, element, receiver);
        }
    }

    fn handle_error(&mut self, reason: NetError) {
        tracing::debug!(error = %reason, "datagram transport failure");
        self.abort_all(&reason);
        if self.io.abort.is_none() {
            self.io.abort = Some(reason);
        }
    }

    fn abort_reason(&self) -> Option<&NetError> {
        self.io.abort.as_ref()
    }
}
