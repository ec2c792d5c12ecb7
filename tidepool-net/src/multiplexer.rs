//! Single-threaded I/O event loop driving socket managers.
//!
//! The multiplexer owns a registry of socket managers, each a socket plus an
//! event handler plus an interest mask. [`Multiplexer::poll_once`] waits for
//! readiness on the registered sockets and dispatches
//! `handle_read_event` / `handle_write_event`; a `false` return clears that
//! direction from the mask, and a manager whose mask runs empty is dropped.
//!
//! All handler invocations happen on the multiplexer's thread. Other
//! threads interact exclusively through a [`MultiplexerHandle`]: they
//! enqueue mask updates and wake the poll loop, but never drive handlers.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use futures_util::future::{LocalBoxFuture, select_all};
use parking_lot::Mutex;
use tokio::io::{Interest, Ready};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Notify;

use crate::error::NetError;
use crate::operation::Operation;

/// Identifies a socket manager within its multiplexer.
pub type ManagerId = u64;

/// Callbacks of a socket manager.
///
/// Both event handlers return `false` to deregister the corresponding
/// direction; once neither direction is registered the manager is dropped.
pub trait SocketEventHandler {
    /// The socket has data to read.
    fn handle_read_event(&mut self) -> bool;

    /// The socket accepts output.
    fn handle_write_event(&mut self) -> bool;

    /// The socket failed; `reason` becomes the abort reason.
    fn handle_error(&mut self, reason: NetError);
}

/// The socket owned by a manager.
///
/// Managers and the multiplexer share the handle: the manager performs
/// non-blocking I/O on it, the multiplexer awaits readiness.
#[derive(Clone)]
pub enum SocketRef {
    /// A connected TCP stream.
    Tcp(Rc<TcpStream>),
    /// A bound UDP socket.
    Udp(Rc<UdpSocket>),
}

impl SocketRef {
    async fn ready(&self, interest: Interest) -> std::io::Result<Ready> {
        match self {
            SocketRef::Tcp(socket) => socket.ready(interest).await,
            SocketRef::Udp(socket) => socket.ready(interest).await,
        }
    }
}

fn to_interest(mask: Operation) -> Interest {
    match mask {
        Operation::Read => Interest::READABLE,
        Operation::Write => Interest::WRITABLE,
        Operation::ReadWrite | Operation::None => Interest::READABLE.add(Interest::WRITABLE),
    }
}

enum Update {
    MaskAdd(ManagerId, Operation),
    MaskDel(ManagerId, Operation),
    Discard(ManagerId),
    Shutdown,
}

struct MpxShared {
    updates: Mutex<Vec<Update>>,
    wakeup: Notify,
    shutting_down: AtomicBool,
}

/// Thread-safe handle to a multiplexer.
///
/// The only cross-thread surface: updates are queued and applied on the
/// multiplexer thread at the next poll.
#[derive(Clone)]
pub struct MultiplexerHandle {
    shared: Arc<MpxShared>,
}

impl MultiplexerHandle {
    fn push(&self, update: Update) {
        self.shared.updates.lock().push(update);
        self.shared.wakeup.notify_one();
    }

    /// Add read interest for a manager.
    pub fn register_reading(&self, id: ManagerId) {
        self.push(Update::MaskAdd(id, Operation::Read));
    }

    /// Add write interest for a manager.
    pub fn register_writing(&self, id: ManagerId) {
        self.push(Update::MaskAdd(id, Operation::Write));
    }

    /// Remove interest for a manager.
    pub fn mask_del(&self, id: ManagerId, flag: Operation) {
        self.push(Update::MaskDel(id, flag));
    }

    /// Drop a manager at the next poll.
    pub fn discard(&self, id: ManagerId) {
        self.push(Update::Discard(id));
    }

    /// Initiate shutdown: every remaining manager is aborted with
    /// [`NetError::ShuttingDown`] and the poll loop exits.
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.push(Update::Shutdown);
    }

    /// Wake the poll loop without an update.
    pub fn wakeup(&self) {
        self.shared.wakeup.notify_one();
    }
}

/// Mask control for one manager, held by mailboxes and consumer queues to
/// request write events from any thread.
#[derive(Clone)]
pub struct ManagerWaker {
    id: ManagerId,
    handle: MultiplexerHandle,
}

impl ManagerWaker {
    /// The manager this waker addresses.
    pub fn id(&self) -> ManagerId {
        self.id
    }

    /// Register the manager for read events.
    pub fn register_reading(&self) {
        self.handle.register_reading(self.id);
    }

    /// Register the manager for write events.
    pub fn register_writing(&self) {
        self.handle.register_writing(self.id);
    }

    /// Drop the manager at the next poll.
    pub fn discard(&self) {
        self.handle.discard(self.id);
    }
}

struct Entry {
    socket: SocketRef,
    handler: Rc<RefCell<dyn SocketEventHandler>>,
    mask: Operation,
}

enum PollOutcome {
    Io(ManagerId, std::io::Result<Ready>),
    Woken,
}

/// The event loop. Single-threaded; create and drive it on the thread bound
/// via [`Multiplexer::set_thread_id`].
pub struct Multiplexer {
    entries: RefCell<BTreeMap<ManagerId, Entry>>,
    next_id: Cell<ManagerId>,
    shared: Arc<MpxShared>,
    thread: Cell<Option<std::thread::ThreadId>>,
}

impl Multiplexer {
    /// Create a multiplexer.
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            entries: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(1),
            shared: Arc::new(MpxShared {
                updates: Mutex::new(Vec::new()),
                wakeup: Notify::new(),
                shutting_down: AtomicBool::new(false),
            }),
            thread: Cell::new(None),
        })
    }

    /// Bind the multiplexer to the current thread; registrations and polls
    /// must happen here from now on.
    pub fn set_thread_id(&self) {
        self.thread.set(Some(std::thread::current().id()));
    }

    fn assert_on_thread(&self) {
        if let Some(bound) = self.thread.get() {
            debug_assert_eq!(
                bound,
                std::thread::current().id(),
                "multiplexer driven from a foreign thread"
            );
        }
    }

    /// Thread-safe handle for mask updates and wakeups.
    pub fn handle(&self) -> MultiplexerHandle {
        MultiplexerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Reserve a manager id ahead of registration, so the manager's waker
    /// can be constructed before the manager itself.
    pub fn reserve_id(&self) -> ManagerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Waker for a reserved or registered id.
    pub fn waker_for(&self, id: ManagerId) -> ManagerWaker {
        ManagerWaker {
            id,
            handle: self.handle(),
        }
    }

    /// Register a manager under a previously reserved id.
    pub fn register_at(
        &self,
        id: ManagerId,
        socket: SocketRef,
        handler: Rc<RefCell<dyn SocketEventHandler>>,
        mask: Operation,
    ) {
        self.assert_on_thread();
        self.entries.borrow_mut().insert(
            id,
            Entry {
                socket,
                handler,
                mask,
            },
        );
        // Break a concurrent blocking poll so the new socket participates.
        self.shared.wakeup.notify_one();
    }

    /// Register a manager with a fresh id.
    pub fn register(
        &self,
        socket: SocketRef,
        handler: Rc<RefCell<dyn SocketEventHandler>>,
        mask: Operation,
    ) -> ManagerId {
        let id = self.reserve_id();
        self.register_at(id, socket, handler, mask);
        id
    }

    /// Number of registered socket managers.
    pub fn num_socket_managers(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Change a manager's mask from the multiplexer thread.
    pub fn update_mask(&self, id: ManagerId, mask: Operation) {
        self.assert_on_thread();
        if let Some(entry) = self.entries.borrow_mut().get_mut(&id) {
            entry.mask = mask;
        }
    }

    /// Poll I/O activity once and run the event handlers that became ready.
    ///
    /// With `blocking` set, suspends until a socket turns ready or the
    /// handle wakes the loop. Returns whether any event or queued update was
    /// processed.
    pub async fn poll_once(&self, blocking: bool) -> bool {
        self.assert_on_thread();
        let mut progressed = self.apply_updates();
        if self.is_shutting_down() {
            self.drain_all();
            return false;
        }
        let snapshot: Vec<(ManagerId, SocketRef, Operation)> = self
            .entries
            .borrow()
            .iter()
            .filter(|(_, entry)| !entry.mask.is_none())
            .map(|(id, entry)| (*id, entry.socket.clone(), entry.mask))
            .collect();
        let mut dispatched = false;
        for (id, socket, mask) in &snapshot {
            if let Some(result) = socket.ready(to_interest(*mask)).now_or_never() {
                self.dispatch(*id, result);
                dispatched = true;
            }
        }
        if !dispatched && !progressed && blocking {
            let mut futures: Vec<LocalBoxFuture<'_, PollOutcome>> = snapshot
                .into_iter()
                .map(|(id, socket, mask)| {
                    let fut = async move { PollOutcome::Io(id, socket.ready(to_interest(mask)).await) };
                    fut.boxed_local()
                })
                .collect();
            let shared = self.shared.clone();
            futures.push(
                async move {
                    shared.wakeup.notified().await;
                    PollOutcome::Woken
                }
                .boxed_local(),
            );
            let (outcome, _, _) = select_all(futures).await;
            if let PollOutcome::Io(id, result) = outcome {
                self.dispatch(id, result);
            }
            dispatched = true;
        }
        progressed |= dispatched;
        self.apply_updates();
        if self.is_shutting_down() {
            self.drain_all();
            return false;
        }
        self.sweep_empty_masks();
        progressed
    }

    /// Poll until shutdown is requested through the handle.
    pub async fn run(&self) {
        self.set_thread_id();
        loop {
            self.poll_once(true).await;
            if self.is_shutting_down() {
                self.drain_all();
                return;
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    fn dispatch(&self, id: ManagerId, result: std::io::Result<Ready>) {
        let Some((handler, mask)) = self
            .entries
            .borrow()
            .get(&id)
            .map(|entry| (entry.handler.clone(), entry.mask))
        else {
            return;
        };
        let ready = match result {
            Ok(ready) => ready,
            Err(err) => {
                tracing::debug!(manager = id, error = %err, "socket error");
                handler.borrow_mut().handle_error(NetError::Io(err));
                self.entries.borrow_mut().remove(&id);
                return;
            }
        };
        if mask.is_reading() && (ready.is_readable() || ready.is_read_closed()) {
            let keep = handler.borrow_mut().handle_read_event();
            if !keep {
                self.mask_del_local(id, Operation::Read);
            }
        }
        // Re-read the mask: the read handler may have deregistered writing.
        let mask_now = self
            .entries
            .borrow()
            .get(&id)
            .map(|entry| entry.mask)
            .unwrap_or(Operation::None);
        if mask_now.is_writing() && (ready.is_writable() || ready.is_write_closed()) {
            let keep = handler.borrow_mut().handle_write_event();
            if !keep {
                self.mask_del_local(id, Operation::Write);
            }
        }
    }

    fn mask_del_local(&self, id: ManagerId, flag: Operation) {
        if let Some(entry) = self.entries.borrow_mut().get_mut(&id) {
            entry.mask = entry.mask.remove(flag);
        }
    }

    fn apply_updates(&self) -> bool {
        let updates: Vec<Update> = std::mem::take(&mut *self.shared.updates.lock());
        let progressed = !updates.is_empty();
        for update in updates {
            match update {
                Update::MaskAdd(id, flag) => {
                    if let Some(entry) = self.entries.borrow_mut().get_mut(&id) {
                        entry.mask = entry.mask.add(flag);
                    }
                }
                Update::MaskDel(id, flag) => {
                    if let Some(entry) = self.entries.borrow_mut().get_mut(&id) {
                        entry.mask = entry.mask.remove(flag);
                    }
                }
                Update::Discard(id) => {
                    self.entries.borrow_mut().remove(&id);
                }
                Update::Shutdown => {
                    self.shared.shutting_down.store(true, Ordering::Release);
                }
            }
        }
        progressed
    }

    fn sweep_empty_masks(&self) {
        let empty: Vec<ManagerId> = self
            .entries
            .borrow()
            .iter()
            .filter(|(_, entry)| entry.mask.is_none())
            .map(|(id, _)| *id)
            .collect();
        if !empty.is_empty() {
            let mut entries = self.entries.borrow_mut();
            for id in empty {
                entries.remove(&id);
            }
        }
    }

    fn drain_all(&self) {
        let victims: Vec<Rc<RefCell<dyn SocketEventHandler>>> = {
            let mut entries = self.entries.borrow_mut();
            let handlers = entries
                .values()
                .map(|entry| entry.handler.clone())
                .collect();
            entries.clear();
            handlers
        };
        for handler in victims {
            handler.borrow_mut().handle_error(NetError::ShuttingDown);
        }
    }
}
