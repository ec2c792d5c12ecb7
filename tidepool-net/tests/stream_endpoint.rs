//! End-to-end: two BASP endpoints handshake over localhost TCP, resolve a
//! remote actor, deliver messages through the proxy and propagate a remote
//! down notification.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tidepool_core::{
    ActorId, ActorRef, ActorRegistry, ActorSink, EnqueueResult, ExitReason, JsonStringCodec,
    LocalRegistry, MailboxElement, Message, MessageId, NodeId, ProxyRegistry, TokioClock,
};
use tidepool_net::backend::tcp;
use tidepool_net::{HostContext, Multiplexer, NetConfig, NetRuntime, ResolveAnswer};
use tokio::net::{TcpListener, TcpStream};

struct RecordingSink {
    id: ActorId,
    received: Mutex<Vec<MailboxElement>>,
}

impl RecordingSink {
    fn new(id: ActorId) -> Arc<Self> {
        Arc::new(Self {
            id,
            received: Mutex::new(Vec::new()),
        })
    }
}

impl ActorSink for RecordingSink {
    fn id(&self) -> ActorId {
        self.id
    }

    fn enqueue(&self, element: MailboxElement) -> EnqueueResult {
        self.received.lock().push(element);
        EnqueueResult::Success
    }
}

fn make_host() -> (HostContext, Arc<LocalRegistry>, Arc<ProxyRegistry>) {
    let registry = LocalRegistry::new();
    let proxies = ProxyRegistry::new();
    let host = HostContext::new(
        registry.clone(),
        proxies.clone(),
        Arc::new(JsonStringCodec),
        TokioClock::new(),
    );
    (host, registry, proxies)
}

fn make_config(node: NodeId) -> NetConfig {
    NetConfig {
        this_node: node,
        workers: Some(2),
        ..NetConfig::default()
    }
}

/// Poll the multiplexer until `done` holds or the retry limit is hit.
async fn drive<F: FnMut() -> bool>(mpx: &Rc<Multiplexer>, mut done: F) -> bool {
    for _ in 0..1000 {
        mpx.poll_once(false).await;
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    false
}

#[tokio::test]
async fn basp_over_tcp_end_to_end() {
    let mpx = Multiplexer::new();
    mpx.set_thread_id();

    let node_a = NodeId::new(0xA, 0xA);
    let node_b = NodeId::new(0xB, 0xB);
    let (host_a, _registry_a, proxies_a) = make_host();
    let (host_b, registry_b, _proxies_b) = make_host();

    // Node B publishes an actor under a path.
    let target = RecordingSink::new(7);
    registry_b.put(7, target.clone());
    registry_b.publish_path("/name/dummy", 7);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let client_stream = client.expect("connect");
    let (server_stream, _) = accepted.expect("accept");

    let client_handle =
        tcp::spawn_stream_endpoint(&mpx, client_stream, host_a.clone(), &make_config(node_a))
            .expect("client endpoint");
    let _server_handle =
        tcp::spawn_stream_endpoint(&mpx, server_stream, host_b.clone(), &make_config(node_b))
            .expect("server endpoint");
    assert_eq!(mpx.num_socket_managers(), 2);

    // Resolve the remote path; the answer carries a proxy for actor 7.
    let answer_sink = RecordingSink::new(100);
    client_handle.resolve("/name/dummy", answer_sink.clone() as ActorRef);
    assert!(
        drive(&mpx, || !answer_sink.received.lock().is_empty()).await,
        "resolve answer never arrived"
    );
    let proxy = {
        let received = answer_sink.received.lock();
        let answer = received[0]
            .content
            .downcast_ref::<ResolveAnswer>()
            .expect("resolve answer");
        answer.proxy.clone().expect("proxy")
    };
    assert_eq!(proxy.id(), 7);

    // Deliver a message through the proxy.
    proxy.enqueue(MailboxElement::new(
        None,
        MessageId::none(),
        Message::new("hello across".to_string()),
    ));
    assert!(
        drive(&mpx, || !target.received.lock().is_empty()).await,
        "remote delivery never arrived"
    );
    {
        let received = target.received.lock();
        assert_eq!(
            received[0].content.downcast_ref::<String>().map(String::as_str),
            Some("hello across")
        );
    }

    // Minting the proxy announced a monitor; terminating the actor on B
    // produces a down message that erases the proxy on A.
    registry_b.terminate(7, ExitReason::Normal);
    assert!(
        drive(&mpx, || proxies_a.get(&node_b, 7).is_none()).await,
        "proxy survived the remote down message"
    );
}

#[test]
fn runtime_listen_and_connect_via_tcp_port() {
    let node_a = NodeId::new(0xC, 0xC);
    let node_b = NodeId::new(0xD, 0xD);
    let (host_a, _registry_a, _) = make_host();
    let (host_b, registry_b, _) = make_host();

    let target = RecordingSink::new(7);
    registry_b.put(7, target.clone());
    registry_b.publish_path("/name/dummy", 7);

    // Server node: the listener binds the port from `middleman.tcp-port`
    // (0 here, so an ephemeral port reported back through the bound
    // address).
    let bound = Arc::new(Mutex::new(None));
    let bound_setup = bound.clone();
    let server_cfg = make_config(node_b);
    let server = NetRuntime::start(move |mpx| async move {
        let (addr, _acceptor) = tcp::listen(mpx, host_b, server_cfg).await?;
        *bound_setup.lock() = Some(addr);
        Ok(())
    })
    .expect("server runtime");
    let port = bound.lock().take().expect("bound address").port();

    // Client node: dial and hand the endpoint out of the setup future.
    let endpoint_cell = Arc::new(Mutex::new(None));
    let endpoint_setup = endpoint_cell.clone();
    let client_cfg = make_config(node_a);
    let client = NetRuntime::start(move |mpx| async move {
        let endpoint =
            tcp::connect(&mpx, &format!("127.0.0.1:{port}"), host_a, &client_cfg).await?;
        *endpoint_setup.lock() = Some(endpoint);
        Ok(())
    })
    .expect("client runtime");
    let endpoint = endpoint_cell.lock().clone().expect("endpoint handle");

    let answer_sink = RecordingSink::new(100);
    endpoint.resolve("/name/dummy", answer_sink.clone() as ActorRef);
    let mut answered = false;
    for _ in 0..1000 {
        if !answer_sink.received.lock().is_empty() {
            answered = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(answered, "resolve answer never arrived");
    {
        let received = answer_sink.received.lock();
        let answer = received[0]
            .content
            .downcast_ref::<ResolveAnswer>()
            .expect("resolve answer");
        assert_eq!(answer.proxy.as_ref().expect("proxy").id(), 7);
    }

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn resolve_miss_returns_null_handle() {
    let mpx = Multiplexer::new();
    mpx.set_thread_id();

    let (host_a, _registry_a, _) = make_host();
    let (host_b, _registry_b, _) = make_host();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let client_handle = tcp::spawn_stream_endpoint(
        &mpx,
        client.expect("connect"),
        host_a,
        &make_config(NodeId::new(1, 1)),
    )
    .expect("client endpoint");
    let (server_stream, _) = accepted.expect("accept");
    let _server = tcp::spawn_stream_endpoint(
        &mpx,
        server_stream,
        host_b,
        &make_config(NodeId::new(2, 2)),
    )
    .expect("server endpoint");

    let answer_sink = RecordingSink::new(100);
    client_handle.resolve("/name/nobody", answer_sink.clone() as ActorRef);
    assert!(drive(&mpx, || !answer_sink.received.lock().is_empty()).await);

    let received = answer_sink.received.lock();
    let answer = received[0]
        .content
        .downcast_ref::<ResolveAnswer>()
        .expect("resolve answer");
    assert!(answer.proxy.is_none());
    assert!(answer.interfaces.is_empty());
}

#[tokio::test]
async fn mismatched_app_identifiers_tear_down() {
    let mpx = Multiplexer::new();
    mpx.set_thread_id();

    let (host_a, _, _) = make_host();
    let (host_b, _, _) = make_host();
    let cfg_a = NetConfig {
        this_node: NodeId::new(1, 1),
        app_identifiers: vec!["foo".to_string()],
        workers: Some(1),
        ..NetConfig::default()
    };
    let cfg_b = NetConfig {
        this_node: NodeId::new(2, 2),
        app_identifiers: vec!["bar".to_string()],
        workers: Some(1),
        ..NetConfig::default()
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let _client =
        tcp::spawn_stream_endpoint(&mpx, client.expect("connect"), host_a, &cfg_a).expect("client");
    let (server_stream, _) = accepted.expect("accept");
    let _server =
        tcp::spawn_stream_endpoint(&mpx, server_stream, host_b, &cfg_b).expect("server");
    assert_eq!(mpx.num_socket_managers(), 2);

    // Both sides reject the peer's handshake and tear down.
    assert!(
        drive(&mpx, || mpx.num_socket_managers() == 0).await,
        "managers survived an app identifier mismatch"
    );
}
