//! UDP backend: one socket, one endpoint manager, many peers.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::net::UdpSocket;

use crate::basp::BaspApplication;
use crate::config::NetConfig;
use crate::endpoint::{ConsumerQueue, EndpointHandle, EndpointManager};
use crate::error::NetError;
use crate::host::HostContext;
use crate::multiplexer::{Multiplexer, SocketRef};
use crate::operation::Operation;
use crate::transport::datagram::{DatagramAppFactory, DatagramTransport};

/// Mints one BASP application per peer endpoint.
pub struct BaspDatagramFactory {
    host: HostContext,
    handle: std::sync::Arc<EndpointHandle>,
}

impl DatagramAppFactory for BaspDatagramFactory {
    type App = BaspApplication;

    fn make(&mut self, endpoint: SocketAddr) -> BaspApplication {
        tracing::debug!(%endpoint, "new datagram peer");
        BaspApplication::new(self.host.clone(), self.handle.clone())
    }
}

/// Bind a UDP socket and register the datagram endpoint manager.
///
/// Must run on the multiplexer thread.
pub async fn bind(
    mpx: &Rc<Multiplexer>,
    addr: &str,
    host: HostContext,
    cfg: &NetConfig,
) -> Result<(SocketAddr, std::sync::Arc<EndpointHandle>), NetError> {
    let socket = UdpSocket::bind(addr).await?;
    let local_addr = socket.local_addr()?;
    tracing::info!(%local_addr, "datagram endpoint bound");
    let socket = Rc::new(socket);
    let id = mpx.reserve_id();
    let waker = mpx.waker_for(id);
    let queue = ConsumerQueue::new();
    let handle = EndpointHandle::new(queue.clone(), waker.clone());
    let factory = BaspDatagramFactory {
        host: host.clone(),
        handle: handle.clone(),
    };
    let transport = DatagramTransport::new(socket.clone(), waker.clone(), factory);
    let manager = Rc::new(RefCell::new(EndpointManager::new(
        transport,
        queue,
        host.clock.clone(),
        handle.clone(),
        waker,
    )));
    mpx.register_at(id, SocketRef::Udp(socket), manager.clone(), Operation::Read);
    if let Err(err) = manager.borrow_mut().init(cfg) {
        mpx.handle().discard(id);
        return Err(err);
    }
    Ok((local_addr, handle))
}
