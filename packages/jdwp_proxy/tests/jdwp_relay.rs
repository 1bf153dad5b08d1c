use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jdwp_proxy::{
    ConnectionHandlerFactory, JdwpPacket, JdwpProxyFactory, JdwpProxyHandler, ListenEndpoint,
    ProxyServer, Role,
};
use state_hub::wire::{JDWP_HANDSHAKE, OKAY, encode_hex4};
use state_hub::{ClientStateChangeHub, TrackJdwpFactory};
use tokio::net::TcpStream;

fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn start(factory: JdwpProxyFactory) -> (ProxyServer<JdwpProxyFactory>, u16) {
    let port = free_port();
    let mut server = ProxyServer::new(ListenEndpoint::loopback(port), factory);
    server.start().unwrap();
    (server, port)
}

fn connect(port: u16) -> StdTcpStream {
    let stream = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream
}

fn read_n(stream: &mut StdTcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn assert_closed(stream: &mut StdTcpStream) {
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}

/// Request `pid` and complete the handshake.
fn attach(port: u16, pid: u32) -> StdTcpStream {
    let mut stream = connect(port);
    let request = encode_hex4(format!("jdwp:{}", pid).as_bytes()).unwrap();
    stream.write_all(&request).unwrap();
    assert_eq!(read_n(&mut stream, 4), OKAY);

    stream.write_all(JDWP_HANDSHAKE).unwrap();
    assert_eq!(read_n(&mut stream, JDWP_HANDSHAKE.len()), JDWP_HANDSHAKE);
    stream
}

#[test]
fn packets_reach_other_debuggers_of_the_same_pid() {
    let factory = JdwpProxyFactory::new();
    let directory = factory.directory();
    let (mut server, port) = start(factory);

    let mut first = attach(port, 1234);
    let mut second = attach(port, 1234);
    let _bystander = attach(port, 99);
    assert_eq!(directory.attached_pids(), vec![99, 1234]);
    assert_eq!(directory.session(1234).unwrap().debugger_count(), 2);

    let command = JdwpPacket::command(7, 1, 1, b"");
    first.write_all(command.as_bytes()).unwrap();
    assert_eq!(read_n(&mut second, command.as_bytes().len()), command.as_bytes());

    // Split across writes, with the next packet glued to the tail.
    let reply = JdwpPacket::reply(7, 0, b"payload");
    let follow_up = JdwpPacket::command(8, 1, 7, b"");
    let mut bytes = reply.as_bytes().to_vec();
    bytes.extend_from_slice(follow_up.as_bytes());
    second.write_all(&bytes[..6]).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    second.write_all(&bytes[6..]).unwrap();
    assert_eq!(read_n(&mut first, bytes.len()), bytes);

    server.stop();
}

#[test]
fn unknown_request_gets_fail() {
    let (mut server, port) = start(JdwpProxyFactory::new());
    let mut stream = connect(port);

    stream.write_all(&encode_hex4(b"host:version").unwrap()).unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    assert_eq!(reply, b"FAIL001Dunknown request: host:version");

    server.stop();
}

#[test]
fn malformed_length_closes_the_connection() {
    let (mut server, port) = start(JdwpProxyFactory::new());
    let mut stream = connect(port);

    stream.write_all(b"zz!!jdwp:1").unwrap();
    assert_closed(&mut stream);
    assert!(wait_until(Duration::from_secs(1), || server.connection_count() == 0));

    server.stop();
}

#[test]
fn bad_handshake_closes_the_connection() {
    let factory = JdwpProxyFactory::new();
    let directory = factory.directory();
    let (mut server, port) = start(factory);
    let mut stream = connect(port);

    stream.write_all(&encode_hex4(b"jdwp:5").unwrap()).unwrap();
    assert_eq!(read_n(&mut stream, 4), OKAY);
    stream.write_all(b"JDWP-Handshaky").unwrap();

    assert_closed(&mut stream);
    assert!(directory.attached_pids().is_empty());
    server.stop();
}

#[test]
fn silent_client_times_out() {
    let factory = JdwpProxyFactory::new().with_handshake_timeout(Duration::from_millis(200));
    let (mut server, port) = start(factory);
    let mut stream = connect(port);

    let started = Instant::now();
    assert_closed(&mut stream);
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert!(wait_until(Duration::from_secs(1), || server.connection_count() == 0));

    server.stop();
}

#[test]
fn attached_debugger_is_not_timed_out() {
    let factory = JdwpProxyFactory::new().with_handshake_timeout(Duration::from_millis(100));
    let (mut server, port) = start(factory);
    let mut first = attach(port, 3);
    let mut second = attach(port, 3);

    std::thread::sleep(Duration::from_millis(300));
    let packet = JdwpPacket::command(1, 64, 100, b"\x01");
    first.write_all(packet.as_bytes()).unwrap();
    assert_eq!(read_n(&mut second, packet.as_bytes().len()), packet.as_bytes());

    server.stop();
}

#[test]
fn client_trackers_see_attach_and_detach() {
    let hub = Arc::new(ClientStateChangeHub::new());
    let sink = Arc::new(Mutex::new(Vec::<u8>::new()));
    let mut queue = hub
        .subscribe(Arc::new(TrackJdwpFactory::new(sink.clone())))
        .unwrap();

    let (mut server, port) = start(JdwpProxyFactory::new().with_client_hub(hub.clone()));
    let debugger = attach(port, 42);
    drop(debugger);
    assert!(wait_until(Duration::from_secs(1), || server.connection_count() == 0));

    server.stop();
    hub.stop();
    while (queue.take())().should_continue {}

    assert_eq!(&sink.lock().unwrap()[..], b"000342\n0000");
}

/// Counts every connection the leader accepts.
struct CountingFactory {
    inner: JdwpProxyFactory,
    accepted: Arc<AtomicUsize>,
}

impl ConnectionHandlerFactory for CountingFactory {
    type Handler = JdwpProxyHandler;

    fn create(&self, stream: TcpStream, peer: SocketAddr) -> JdwpProxyHandler {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        self.inner.create(stream, peer)
    }
}

#[test]
fn idle_follower_link_outlives_the_handshake_timeout() {
    let port = free_port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let handshake_timeout = Duration::from_millis(200);

    let mut leader = ProxyServer::new(
        ListenEndpoint::loopback(port),
        CountingFactory {
            inner: JdwpProxyFactory::new().with_handshake_timeout(handshake_timeout),
            accepted: accepted.clone(),
        },
    );
    let mut follower = ProxyServer::new(
        ListenEndpoint::loopback(port),
        JdwpProxyFactory::new().with_handshake_timeout(handshake_timeout),
    )
    .with_reconnect_interval(Duration::from_millis(100));

    leader.start().unwrap();
    follower.start().unwrap();
    assert_eq!(follower.role(), Some(Role::Following));

    std::thread::sleep(handshake_timeout * 5);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(leader.connection_count(), 1);

    // The follow link still reports the leader's death.
    leader.stop();
    assert!(wait_until(Duration::from_secs(2), || follower.is_leading()));
    follower.stop();
}
