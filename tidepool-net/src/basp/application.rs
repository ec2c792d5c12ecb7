//! The BASP connection state machine.
//!
//! One instance per connection. Inbound, the application parses frames
//! driven by the transport's receive policy, validates the handshake,
//! dispatches actor messages to the worker pool and answers resolve and
//! monitor traffic. Outbound, control messages and actor messages flow
//! through the connection's actor shell and the endpoint manager's consumer
//! queue; both converge on the frame writers here.
//!
//! Protocol errors are fatal: the abort reason is recorded, every pending
//! resolve fails with `RemoteLookupFailed`, the peer's proxies are erased
//! and the state machine parks in [`ConnectionState::Shutdown`].

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use tidepool_core::{
    ActorId, ActorRef, ExitReason, MailboxElement, Message, MessageId, NodeId,
};

use crate::basp::header::{HEADER_SIZE, Header, MessageType, VERSION};
use crate::basp::payload::{
    ActorMessagePayload, HandshakePayload, ResolveResponsePayload, decode_down_message,
    decode_resolve_request, encode_down_message, encode_resolve_request,
};
use crate::basp::queue::MessageQueue;
use crate::basp::worker::{Job, WorkerContext, WorkerHub, handle_remote_message};
use crate::basp::{LocalActorDownMsg, NewProxyMsg, ResolveAnswer, TimeoutMsg};
use crate::config::NetConfig;
use crate::endpoint::EndpointHandle;
use crate::error::NetError;
use crate::host::HostContext;
use crate::multiplexer::ManagerWaker;
use crate::shell::{ActorShell, BehaviorOutcome};
use crate::transport::contract::{Application, ReceivePolicy, TransportOps};

/// Decode states of a BASP connection.
///
/// `AwaitHandshakeHeader`/`AwaitHandshakePayload` make up the handshake
/// phase, `AwaitHeader`/`AwaitPayload` the established phase, `Shutdown` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection opened; the first frame must be a handshake.
    AwaitHandshakeHeader,
    /// Handshake header checked; its payload is outstanding.
    AwaitHandshakePayload,
    /// Established; waiting for the next frame header.
    AwaitHeader,
    /// Header received with a non-zero payload length.
    AwaitPayload,
    /// Terminal; any further input is an error.
    Shutdown,
}

/// Work items produced by the shell's behavior, applied once the transport
/// is ready to take output.
enum BaspCommand {
    NewProxy { id: ActorId },
    LocalActorDown { id: ActorId, reason: ExitReason },
    Timeout { tag: String, id: u64 },
    Outbound { element: MailboxElement },
}

/// BASP as an application layer protocol.
pub struct BaspApplication {
    host: HostContext,
    endpoint: Arc<EndpointHandle>,
    state: ConnectionState,
    hdr: Header,
    peer_id: Option<NodeId>,
    this_node: NodeId,
    app_ids: Vec<String>,
    /// Caches listeners of resolve requests sent to the peer.
    pending_resolves: HashMap<u64, ActorRef>,
    /// Ascending id generator for requests to the peer.
    next_request_id: u64,
    queue: Arc<MessageQueue>,
    hub: Option<WorkerHub>,
    shell: Option<ActorShell>,
    commands: Rc<RefCell<VecDeque<BaspCommand>>>,
}

impl BaspApplication {
    /// Create the application for one connection.
    pub fn new(host: HostContext, endpoint: Arc<EndpointHandle>) -> Self {
        Self {
            host,
            endpoint,
            state: ConnectionState::AwaitHandshakeHeader,
            hdr: Header::new(MessageType::Handshake, 0),
            peer_id: None,
            this_node: NodeId::invalid(),
            app_ids: Vec::new(),
            pending_resolves: HashMap::new(),
            next_request_id: 1,
            queue: Arc::new(MessageQueue::new()),
            hub: None,
            shell: None,
            commands: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Current decode state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the peer's handshake was accepted.
    pub fn handshake_complete(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::AwaitHeader | ConnectionState::AwaitPayload
        )
    }

    /// Node id recorded at handshake time.
    pub fn peer_id(&self) -> Option<NodeId> {
        self.peer_id
    }

    /// Number of resolve requests awaiting a response, for tests.
    pub fn pending_resolves(&self) -> usize {
        self.pending_resolves.len()
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            registry: self.host.registry.clone(),
            proxies: self.host.proxies.clone(),
            codec: self.host.codec.clone(),
            queue: self.queue.clone(),
        }
    }

    fn fail(&mut self, down: &mut dyn TransportOps, reason: NetError) -> isize {
        tracing::debug!(error = %reason, "basp protocol error");
        down.abort_reason(reason);
        -1
    }

    fn write_frame(
        &mut self,
        down: &mut dyn TransportOps,
        mut hdr: Header,
        payload: Option<Vec<u8>>,
    ) {
        let mut head = down.next_header_buffer();
        match payload {
            Some(payload) => {
                // The length field always reflects the buffer that actually
                // follows the header.
                hdr.payload_len = payload.len() as u32;
                hdr.write_to(&mut head);
                down.write_packet(head, vec![payload]);
            }
            None => {
                hdr.payload_len = 0;
                hdr.write_to(&mut head);
                down.write_packet(head, Vec::new());
            }
        }
    }

    // -- inbound frame handlers ----------------------------------------------

    fn handle_handshake_payload(&mut self, payload: &[u8]) -> Result<(), NetError> {
        let handshake = HandshakePayload::decode(payload)?;
        if !handshake.node.is_valid() || handshake.app_identifiers.is_empty() {
            return Err(NetError::InvalidHandshake);
        }
        let shared = handshake
            .app_identifiers
            .iter()
            .any(|id| self.app_ids.contains(id));
        if !shared {
            return Err(NetError::AppIdentifiersMismatch);
        }
        self.peer_id = Some(handshake.node);
        self.host
            .proxies
            .set_endpoint(handshake.node, self.endpoint.clone());
        tracing::debug!(peer = %handshake.node, "handshake complete");
        Ok(())
    }

    fn handle_frame(
        &mut self,
        down: &mut dyn TransportOps,
        hdr: Header,
        payload: &[u8],
    ) -> Result<(), NetError> {
        match hdr.ty {
            MessageType::Handshake => Err(NetError::UnexpectedHandshake),
            MessageType::ActorMessage => {
                self.handle_actor_message(hdr, payload);
                Ok(())
            }
            MessageType::ResolveRequest => self.handle_resolve_request(down, hdr, payload),
            MessageType::ResolveResponse => self.handle_resolve_response(hdr, payload),
            MessageType::MonitorMessage => self.handle_monitor_message(down, hdr, payload),
            MessageType::DownMessage => self.handle_down_message(hdr, payload),
            MessageType::Heartbeat => Ok(()),
        }
    }

    fn handle_actor_message(&mut self, hdr: Header, payload: &[u8]) {
        // The receipt id is assigned here, on the I/O thread, so parallel
        // workers cannot reorder deliveries.
        let msg_id = self.queue.new_id();
        let job = Job {
            msg_id,
            header: hdr,
            payload: payload.to_vec(),
        };
        let job = match &self.hub {
            Some(hub) => match hub.try_dispatch(job) {
                Ok(()) => return,
                Err(job) => job,
            },
            None => job,
        };
        // Out of workers: take the hit and deserialize on this thread.
        tracing::trace!("out of BASP workers, deserializing inline");
        let ctx = self.worker_context();
        handle_remote_message(&ctx, job.msg_id, &job.header, &job.payload);
    }

    fn handle_resolve_request(
        &mut self,
        down: &mut dyn TransportOps,
        hdr: Header,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let path = decode_resolve_request(payload)?;
        let response = match self.host.registry.resolve_local_path(&path) {
            Some(handle) => {
                let id = handle.id();
                // Keep the resolved actor reachable for remote senders.
                self.host.registry.put(id, handle);
                ResolveResponsePayload {
                    id,
                    interfaces: Vec::new(),
                }
            }
            None => {
                tracing::debug!(path = %path, "resolve miss");
                ResolveResponsePayload {
                    id: 0,
                    interfaces: Vec::new(),
                }
            }
        };
        let mut buf = down.next_payload_buffer();
        response.encode(&mut buf);
        self.write_frame(
            down,
            Header::new(MessageType::ResolveResponse, hdr.operation_data),
            Some(buf),
        );
        Ok(())
    }

    fn handle_resolve_response(&mut self, hdr: Header, payload: &[u8]) -> Result<(), NetError> {
        let Some(listener) = self.pending_resolves.remove(&hdr.operation_data) else {
            tracing::warn!(
                request = hdr.operation_data,
                "received unknown ID in resolve_response message"
            );
            return Ok(());
        };
        let response = match ResolveResponsePayload::decode(payload) {
            Ok(response) => response,
            Err(err) => {
                deliver(&listener, Message::new(NetError::RemoteLookupFailed));
                return Err(err);
            }
        };
        let proxy = match (response.id, self.peer_id) {
            (0, _) | (_, None) => None,
            (id, Some(peer)) => Some(self.host.proxies.get_or_put(peer, id)),
        };
        deliver(
            &listener,
            Message::new(ResolveAnswer {
                proxy,
                interfaces: response.interfaces,
            }),
        );
        Ok(())
    }

    fn handle_monitor_message(
        &mut self,
        down: &mut dyn TransportOps,
        hdr: Header,
        payload: &[u8],
    ) -> Result<(), NetError> {
        if !payload.is_empty() {
            return Err(NetError::UnexpectedPayload);
        }
        let id: ActorId = hdr.operation_data;
        let monitored = match &self.shell {
            Some(shell) => {
                let shell = shell.as_actor_ref();
                // On termination the listener re-enters through the shell
                // mailbox, which wakes the manager for writing.
                self.host.registry.monitor(
                    id,
                    Box::new(move |reason| {
                        deliver(&shell, Message::new(LocalActorDownMsg { id, reason }));
                    }),
                )
            }
            None => false,
        };
        if !monitored {
            let mut buf = down.next_payload_buffer();
            encode_down_message(&ExitReason::Unknown, &mut buf);
            self.write_frame(
                down,
                Header::new(MessageType::DownMessage, hdr.operation_data),
                Some(buf),
            );
        }
        Ok(())
    }

    fn handle_down_message(&mut self, hdr: Header, payload: &[u8]) -> Result<(), NetError> {
        let reason = decode_down_message(payload)?;
        if let Some(peer) = self.peer_id {
            self.host.proxies.erase(&peer, hdr.operation_data, reason);
        }
        Ok(())
    }

    // -- outbound helpers ----------------------------------------------------

    fn apply_command(&mut self, down: &mut dyn TransportOps, command: BaspCommand) {
        match command {
            BaspCommand::NewProxy { id } => {
                self.write_frame(down, Header::new(MessageType::MonitorMessage, id), None);
            }
            BaspCommand::LocalActorDown { id, reason } => {
                let mut buf = down.next_payload_buffer();
                encode_down_message(&reason, &mut buf);
                self.write_frame(down, Header::new(MessageType::DownMessage, id), Some(buf));
            }
            BaspCommand::Timeout { tag, id } => self.handle_timeout(down, &tag, id),
            BaspCommand::Outbound { mut element } => {
                // The proxy leaves the destination at the back of the stages.
                let Some(receiver) = element.stages.pop() else {
                    tracing::warn!("outbound message without destination stage, dropped");
                    return;
                };
                self.write_message(down, element, receiver);
            }
        }
    }
}

/// Hand a message to a listener, ignoring a closed mailbox.
fn deliver(listener: &ActorRef, content: Message) {
    let element = MailboxElement::new(None, MessageId::none(), content);
    if listener.enqueue(element) == tidepool_core::EnqueueResult::Closed {
        tracing::debug!(listener = listener.id(), "listener mailbox closed");
    }
}

impl Application for BaspApplication {
    fn init(
        &mut self,
        owner: &ManagerWaker,
        down: &mut dyn TransportOps,
        cfg: &NetConfig,
    ) -> Result<(), NetError> {
        if !cfg.this_node.is_valid() {
            return Err(NetError::runtime("middleman.this-node is not configured"));
        }
        self.this_node = cfg.this_node;
        self.app_ids = if cfg.app_identifiers.is_empty() {
            vec![NetConfig::DEFAULT_APP_IDENTIFIER.to_string()]
        } else {
            cfg.app_identifiers.clone()
        };
        self.hub = Some(WorkerHub::new(cfg.worker_count(), self.worker_context()));
        // Install the shell: behavior for BASP-internal messages, fallback
        // for outgoing actor messages.
        let mut shell = ActorShell::new(self.host.next_actor_id(), owner.clone());
        let commands = self.commands.clone();
        shell.set_behavior(Box::new(move |element| {
            let content = &element.content;
            let command = if let Some(msg) = content.downcast_ref::<NewProxyMsg>() {
                BaspCommand::NewProxy { id: msg.id }
            } else if let Some(msg) = content.downcast_ref::<LocalActorDownMsg>() {
                BaspCommand::LocalActorDown {
                    id: msg.id,
                    reason: msg.reason.clone(),
                }
            } else if let Some(msg) = content.downcast_ref::<TimeoutMsg>() {
                BaspCommand::Timeout {
                    tag: msg.tag.clone(),
                    id: msg.id,
                }
            } else {
                return BehaviorOutcome::Skipped;
            };
            commands.borrow_mut().push_back(command);
            BehaviorOutcome::Consumed(None)
        }));
        let commands = self.commands.clone();
        shell.set_fallback(Box::new(move |element| {
            commands.borrow_mut().push_back(BaspCommand::Outbound {
                element: element.clone(),
            });
            None
        }));
        self.shell = Some(shell);
        // Both sides greet immediately.
        let mut payload = down.next_payload_buffer();
        HandshakePayload {
            node: self.this_node,
            app_identifiers: self.app_ids.clone(),
        }
        .encode(&mut payload);
        self.write_frame(
            down,
            Header::new(MessageType::Handshake, VERSION),
            Some(payload),
        );
        down.configure_read(ReceivePolicy::Exactly(HEADER_SIZE));
        Ok(())
    }

    fn consume(&mut self, down: &mut dyn TransportOps, input: &[u8]) -> isize {
        let mut consumed = 0usize;
        loop {
            let buf = &input[consumed..];
            match self.state {
                ConnectionState::Shutdown => {
                    return self.fail(down, NetError::IllegalState);
                }
                ConnectionState::AwaitHandshakeHeader => {
                    if buf.len() < HEADER_SIZE {
                        down.configure_read(ReceivePolicy::Exactly(HEADER_SIZE));
                        return consumed as isize;
                    }
                    let hdr = match Header::from_bytes(buf) {
                        Ok(hdr) => hdr,
                        Err(err) => return self.fail(down, err),
                    };
                    if hdr.ty != MessageType::Handshake {
                        return self.fail(down, NetError::MissingHandshake);
                    }
                    if hdr.operation_data != VERSION {
                        return self.fail(
                            down,
                            NetError::VersionMismatch {
                                expected: VERSION,
                                got: hdr.operation_data,
                            },
                        );
                    }
                    if hdr.payload_len == 0 {
                        return self.fail(down, NetError::MissingPayload);
                    }
                    self.hdr = hdr;
                    self.state = ConnectionState::AwaitHandshakePayload;
                    consumed += HEADER_SIZE;
                }
                ConnectionState::AwaitHandshakePayload => {
                    let need = self.hdr.payload_len as usize;
                    if buf.len() < need {
                        down.configure_read(ReceivePolicy::Exactly(need));
                        return consumed as isize;
                    }
                    if let Err(err) = self.handle_handshake_payload(&buf[..need]) {
                        return self.fail(down, err);
                    }
                    self.state = ConnectionState::AwaitHeader;
                    consumed += need;
                }
                ConnectionState::AwaitHeader => {
                    if buf.len() < HEADER_SIZE {
                        down.configure_read(ReceivePolicy::Exactly(HEADER_SIZE));
                        return consumed as isize;
                    }
                    let hdr = match Header::from_bytes(buf) {
                        Ok(hdr) => hdr,
                        Err(err) => return self.fail(down, err),
                    };
                    consumed += HEADER_SIZE;
                    if hdr.payload_len == 0 {
                        if let Err(err) = self.handle_frame(down, hdr, &[]) {
                            return self.fail(down, err);
                        }
                    } else {
                        self.hdr = hdr;
                        self.state = ConnectionState::AwaitPayload;
                    }
                }
                ConnectionState::AwaitPayload => {
                    let need = self.hdr.payload_len as usize;
                    if buf.len() < need {
                        down.configure_read(ReceivePolicy::Exactly(need));
                        return consumed as isize;
                    }
                    let hdr = self.hdr;
                    if let Err(err) = self.handle_frame(down, hdr, &buf[..need]) {
                        return self.fail(down, err);
                    }
                    self.state = ConnectionState::AwaitHeader;
                    consumed += need;
                }
            }
        }
    }

    fn prepare_send(&mut self, down: &mut dyn TransportOps) -> bool {
        if !self.handshake_complete() {
            return true;
        }
        loop {
            if !down.can_send_more() {
                return true;
            }
            let consumed = match self.shell.as_mut() {
                Some(shell) => shell.consume_message(),
                None => false,
            };
            if !consumed {
                return true;
            }
            loop {
                let command = self.commands.borrow_mut().pop_front();
                match command {
                    Some(command) => self.apply_command(down, command),
                    None => break,
                }
            }
            if down.has_abort_reason() {
                return false;
            }
        }
    }

    fn done_sending(&mut self, _down: &mut dyn TransportOps) -> bool {
        match self.shell.as_mut() {
            Some(shell) => shell.try_block_mailbox(),
            None => true,
        }
    }

    fn abort(&mut self, reason: &NetError) {
        if self.state == ConnectionState::Shutdown {
            return;
        }
        tracing::debug!(error = %reason, "basp connection aborted");
        self.state = ConnectionState::Shutdown;
        for (_, listener) in self.pending_resolves.drain() {
            deliver(&listener, Message::new(NetError::RemoteLookupFailed));
        }
        if let Some(peer) = self.peer_id {
            self.host.proxies.erase_node(&peer, reason.to_exit_reason());
            self.host.proxies.drop_endpoint(&peer);
        }
        if let Some(shell) = self.shell.as_mut() {
            shell.quit(reason.to_exit_reason());
        }
    }

    fn peer(&self) -> Option<NodeId> {
        self.peer_id
    }

    fn write_resolve_request(
        &mut self,
        down: &mut dyn TransportOps,
        path: &str,
        listener: ActorRef,
    ) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.pending_resolves.insert(request_id, listener);
        let mut buf = down.next_payload_buffer();
        encode_resolve_request(path, &mut buf);
        self.write_frame(
            down,
            Header::new(MessageType::ResolveRequest, request_id),
            Some(buf),
        );
    }

    fn write_new_proxy(&mut self, down: &mut dyn TransportOps, _peer: &NodeId, id: ActorId) {
        self.write_frame(down, Header::new(MessageType::MonitorMessage, id), None);
    }

    fn write_local_actor_down(
        &mut self,
        down: &mut dyn TransportOps,
        _peer: &NodeId,
        id: ActorId,
        reason: ExitReason,
    ) {
        let mut buf = down.next_payload_buffer();
        encode_down_message(&reason, &mut buf);
        self.write_frame(down, Header::new(MessageType::DownMessage, id), Some(buf));
    }

    fn handle_timeout(&mut self, _down: &mut dyn TransportOps, tag: &str, id: u64) {
        // Heartbeat emission lives in extensions; the core only tracks the
        // plumbing.
        tracing::trace!(tag, id, "timeout fired");
    }

    fn write_message(
        &mut self,
        down: &mut dyn TransportOps,
        element: MailboxElement,
        receiver: ActorId,
    ) {
        let (source_node, source_id) = match &element.sender {
            Some(sender) => {
                // Keep the sender reachable for replies from the peer.
                self.host.registry.put(sender.id(), sender.clone());
                (self.this_node, sender.id())
            }
            None => (NodeId::invalid(), 0),
        };
        let content = match self.host.codec.encode(&element.content) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize outbound message, dropped");
                return;
            }
        };
        let payload = ActorMessagePayload {
            source_node,
            source_id,
            dest_id: receiver,
            stages: element.stages,
            content,
        };
        let mut buf = down.next_payload_buffer();
        payload.encode(&mut buf);
        self.write_frame(
            down,
            Header::new(MessageType::ActorMessage, element.mid.0),
            Some(buf),
        );
    }
}
