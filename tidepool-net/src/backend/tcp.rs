//! TCP backend: dialing, listening and per-connection stack assembly.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::net::{TcpListener, TcpStream};

use crate::basp::BaspApplication;
use crate::config::NetConfig;
use crate::endpoint::{ConsumerQueue, EndpointHandle, EndpointManager};
use crate::error::NetError;
use crate::host::HostContext;
use crate::multiplexer::{Multiplexer, SocketRef};
use crate::operation::Operation;
use crate::transport::StreamTransport;

/// Wrap an established connection into a BASP endpoint manager and register
/// it with the multiplexer. The handshake goes out with the first write
/// event.
///
/// Must run on the multiplexer thread.
pub fn spawn_stream_endpoint(
    mpx: &Rc<Multiplexer>,
    stream: TcpStream,
    host: HostContext,
    cfg: &NetConfig,
) -> Result<std::sync::Arc<EndpointHandle>, NetError> {
    let socket = Rc::new(stream);
    let id = mpx.reserve_id();
    let waker = mpx.waker_for(id);
    let queue = ConsumerQueue::new();
    let handle = EndpointHandle::new(queue.clone(), waker.clone());
    let application = BaspApplication::new(host.clone(), handle.clone());
    let transport = StreamTransport::new(socket.clone(), waker.clone(), application);
    let manager = Rc::new(RefCell::new(EndpointManager::new(
        transport,
        queue,
        host.clock.clone(),
        handle.clone(),
        waker,
    )));
    mpx.register_at(id, SocketRef::Tcp(socket), manager.clone(), Operation::Read);
    if let Err(err) = manager.borrow_mut().init(cfg) {
        mpx.handle().discard(id);
        return Err(err);
    }
    Ok(handle)
}

/// Dial a peer and set up the BASP stack over the connection.
///
/// Must run on the multiplexer thread.
pub async fn connect(
    mpx: &Rc<Multiplexer>,
    addr: &str,
    host: HostContext,
    cfg: &NetConfig,
) -> Result<std::sync::Arc<EndpointHandle>, NetError> {
    let stream = TcpStream::connect(addr).await?;
    tracing::debug!(addr, "connected");
    spawn_stream_endpoint(mpx, stream, host, cfg)
}

/// Bind the node's listener on `middleman.tcp-port` and accept connections
/// until the task is dropped, one endpoint manager per accepted connection.
/// Port 0 binds an ephemeral port; the bound address is returned.
///
/// Must run on the multiplexer thread, inside a `LocalSet`.
pub async fn listen(
    mpx: Rc<Multiplexer>,
    host: HostContext,
    cfg: NetConfig,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), NetError> {
    let listener = TcpListener::bind(("0.0.0.0", cfg.tcp_port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "listening");
    let acceptor = tokio::task::spawn_local(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    tracing::debug!(%peer_addr, "accepted connection");
                    if let Err(err) = spawn_stream_endpoint(&mpx, stream, host.clone(), &cfg) {
                        tracing::warn!(%peer_addr, error = %err, "failed to set up connection");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                }
            }
        }
    });
    Ok((local_addr, acceptor))
}
