//! The WebSocket framing layer stacked on a real stream transport: a raw
//! client socket speaks RFC 6455 frames against an echo application.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::Duration;

use tidepool_net::framing::rfc6455::{self, FrameHeader, PING, PONG, TEXT_FRAME};
use tidepool_net::framing::{FramingOps, MessageOriented, WebSocketFraming};
use tidepool_net::transport::StreamTransport;
use tidepool_net::{
    EndpointManager, HostContext, Multiplexer, NetConfig, Operation,
    endpoint::{ConsumerQueue, EndpointHandle},
    multiplexer::SocketRef,
};
use tidepool_core::{JsonStringCodec, LocalRegistry, NodeId, ProxyRegistry, TokioClock};
use tokio::net::TcpListener;

/// Echoes every text message back to the peer.
#[derive(Default)]
struct EchoApp {
    seen: Vec<String>,
}

impl MessageOriented for EchoApp {
    fn consume_text(&mut self, down: &mut FramingOps<'_>, text: &str) -> isize {
        self.seen.push(text.to_string());
        down.begin_text_message();
        down.text_message_buffer().push_str(text);
        down.end_text_message();
        text.len() as isize
    }

    fn consume_binary(&mut self, _down: &mut FramingOps<'_>, payload: &[u8]) -> isize {
        payload.len() as isize
    }
}

fn make_host() -> HostContext {
    HostContext::new(
        LocalRegistry::new(),
        ProxyRegistry::new(),
        std::sync::Arc::new(JsonStringCodec),
        TokioClock::new(),
    )
}

#[tokio::test]
async fn websocket_echo_over_tcp() {
    let mpx = Multiplexer::new();
    mpx.set_thread_id();
    let host = make_host();
    let cfg = NetConfig {
        this_node: NodeId::new(9, 9),
        ..NetConfig::default()
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let mut client = std::net::TcpStream::connect(addr).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    let (server_stream, _) = listener.accept().await.expect("accept");

    // Assemble the stack by hand: transport < websocket framing < echo app.
    let socket = Rc::new(server_stream);
    let id = mpx.reserve_id();
    let waker = mpx.waker_for(id);
    let queue = ConsumerQueue::new();
    let handle = EndpointHandle::new(queue.clone(), waker.clone());
    let framing = WebSocketFraming::new_server(EchoApp::default());
    let transport = StreamTransport::new(socket.clone(), waker.clone(), framing);
    let manager = Rc::new(RefCell::new(EndpointManager::new(
        transport,
        queue,
        host.clock.clone(),
        handle,
        waker,
    )));
    mpx.register_at(id, SocketRef::Tcp(socket), manager.clone(), Operation::Read);
    manager.borrow_mut().init(&cfg).expect("init");

    // Client sends a masked text frame, as required by the RFC.
    let mut frame = Vec::new();
    rfc6455::assemble_frame(TEXT_FRAME, 0xDEADBEEF, b"marco", &mut frame);
    client.write_all(&frame).expect("write");

    // Drive the multiplexer from this thread while the blocking client
    // reads on another.
    let reader = std::thread::spawn(move || {
        let mut response = vec![0u8; 256];
        let mut collected = 0;
        loop {
            let n = client.read(&mut response[collected..]).expect("read");
            assert_ne!(n, 0, "server closed unexpectedly");
            collected += n;
            let mut hdr = FrameHeader::default();
            let hdr_len = rfc6455::decode_header(&response[..collected], &mut hdr);
            if hdr_len > 0 && collected >= hdr_len as usize + hdr.payload_len as usize {
                return (hdr, response[hdr_len as usize..collected].to_vec());
            }
        }
    });
    while !reader.is_finished() {
        mpx.poll_once(false).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let (hdr, payload) = reader.join().expect("reader");

    assert_eq!(hdr.opcode, TEXT_FRAME);
    assert!(hdr.fin);
    assert_eq!(hdr.mask_key, 0, "server frames stay unmasked");
    assert_eq!(payload, b"marco");
    assert_eq!(
        manager
            .borrow()
            .transport()
            .application()
            .upper_layer()
            .seen,
        vec!["marco".to_string()]
    );
}

#[tokio::test]
async fn websocket_ping_gets_pong() {
    let mpx = Multiplexer::new();
    mpx.set_thread_id();
    let host = make_host();
    let cfg = NetConfig {
        this_node: NodeId::new(9, 9),
        ..NetConfig::default()
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let mut client = std::net::TcpStream::connect(addr).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    let (server_stream, _) = listener.accept().await.expect("accept");

    let socket = Rc::new(server_stream);
    let id = mpx.reserve_id();
    let waker = mpx.waker_for(id);
    let queue = ConsumerQueue::new();
    let handle = EndpointHandle::new(queue.clone(), waker.clone());
    let framing = WebSocketFraming::new_server(EchoApp::default());
    let transport = StreamTransport::new(socket.clone(), waker.clone(), framing);
    let manager = Rc::new(RefCell::new(EndpointManager::new(
        transport,
        queue,
        host.clock.clone(),
        handle,
        waker,
    )));
    mpx.register_at(id, SocketRef::Tcp(socket), manager.clone(), Operation::Read);
    manager.borrow_mut().init(&cfg).expect("init");

    let mut frame = Vec::new();
    rfc6455::assemble_frame(PING, 0x01020304, b"are you there", &mut frame);
    client.write_all(&frame).expect("write");

    let reader = std::thread::spawn(move || {
        let mut response = vec![0u8; 256];
        let mut collected = 0;
        loop {
            let n = client.read(&mut response[collected..]).expect("read");
            assert_ne!(n, 0, "server closed unexpectedly");
            collected += n;
            let mut hdr = FrameHeader::default();
            let hdr_len = rfc6455::decode_header(&response[..collected], &mut hdr);
            if hdr_len > 0 && collected >= hdr_len as usize + hdr.payload_len as usize {
                return (hdr, response[hdr_len as usize..collected].to_vec());
            }
        }
    });
    while !reader.is_finished() {
        mpx.poll_once(false).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let (hdr, payload) = reader.join().expect("reader");

    assert_eq!(hdr.opcode, PONG);
    assert_eq!(payload, b"are you there");
}
