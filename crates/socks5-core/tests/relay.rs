//! End-to-end tests driving the reactor over real loopback sockets, in the
//! style of `flux-network`'s `tcp_roundtrip`/`tcp_multi_client_backpressure`
//! tests: spawn the reactor on a background thread, talk to it with plain
//! `std::net` sockets, join, assert.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use socks5_core::reactor::Reactor;

const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;

/// Idle timeout short enough to keep tests fast once the scenario's
/// assertions have run; long enough that slow CI schedulers don't starve a
/// handshake mid-flight.
const TEST_IDLE_TIMEOUT: Duration = Duration::from_millis(800);

/// Spawns a reactor bound to an ephemeral port and returns its address plus
/// the join handle. The shutdown pipe's sender is held by the caller and
/// simply dropped at the end of the test; the reactor's idle timeout tears
/// it down without needing a real signal.
fn spawn_reactor() -> (std::net::SocketAddr, mio::unix::pipe::Sender, thread::JoinHandle<()>) {
    let (sender, receiver) = mio::unix::pipe::new().unwrap();
    let mut reactor = Reactor::new(0, receiver, TEST_IDLE_TIMEOUT).unwrap();
    let addr = reactor.local_addr().unwrap();
    let handle = thread::spawn(move || {
        reactor.run().unwrap();
    });
    (addr, sender, handle)
}

fn send_greeting(client: &mut TcpStream, methods: &[u8]) {
    let mut buf = vec![VERSION, methods.len() as u8];
    buf.extend_from_slice(methods);
    client.write_all(&buf).unwrap();
}

fn read_method_selection(client: &mut TcpStream) -> [u8; 2] {
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).unwrap();
    buf
}

fn encode_request(addr: [u8; 4], port: u16) -> Vec<u8> {
    let mut buf = vec![VERSION, CMD_CONNECT, 0x00, ATYP_IPV4];
    buf.extend_from_slice(&addr);
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

fn read_reply(client: &mut TcpStream) -> u8 {
    let mut header = [0u8; 4];
    client.read_exact(&mut header).unwrap();
    assert_eq!(header[0], VERSION);
    let status = header[1];
    let mut addr = [0u8; 4];
    client.read_exact(&mut addr).unwrap();
    let mut port = [0u8; 2];
    client.read_exact(&mut port).unwrap();
    status
}

#[test]
fn happy_path_relay_forwards_both_directions() {
    let upstream = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let (proxy_addr, _shutdown_sender, reactor_handle) = spawn_reactor();

    let upstream_thread = thread::spawn(move || {
        let (mut conn, _) = upstream.accept().unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        conn.write_all(b"world").unwrap();
    });

    let mut client = TcpStream::connect(proxy_addr).unwrap();
    send_greeting(&mut client, &[0x00]);
    assert_eq!(read_method_selection(&mut client), [VERSION, 0x00]);

    let Ipv4SocketAddr(octets, port) = split_v4(upstream_addr);
    client.write_all(&encode_request(octets, port)).unwrap();
    assert_eq!(read_reply(&mut client), 0x00);

    client.write_all(b"hello").unwrap();
    let mut resp = [0u8; 5];
    client.read_exact(&mut resp).unwrap();
    assert_eq!(&resp, b"world");

    upstream_thread.join().unwrap();
    drop(client);
    reactor_handle.join().unwrap();
}

#[test]
fn pipelined_greeting_request_and_payload_in_one_write() {
    let upstream = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let (proxy_addr, _shutdown_sender, reactor_handle) = spawn_reactor();

    let upstream_thread = thread::spawn(move || {
        let (mut conn, _) = upstream.accept().unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    });

    let mut client = TcpStream::connect(proxy_addr).unwrap();
    let Ipv4SocketAddr(octets, port) = split_v4(upstream_addr);
    let mut pipelined = vec![VERSION, 0x01, 0x00];
    pipelined.extend_from_slice(&encode_request(octets, port));
    pipelined.extend_from_slice(b"ping");
    client.write_all(&pipelined).unwrap();

    assert_eq!(read_method_selection(&mut client), [VERSION, 0x00]);
    assert_eq!(read_reply(&mut client), 0x00);

    upstream_thread.join().unwrap();
    drop(client);
    reactor_handle.join().unwrap();
}

#[test]
fn no_acceptable_methods_is_rejected_and_closed() {
    let (proxy_addr, _shutdown_sender, reactor_handle) = spawn_reactor();

    let mut client = TcpStream::connect(proxy_addr).unwrap();
    send_greeting(&mut client, &[0x02]); // only an auth method we don't support
    assert_eq!(read_method_selection(&mut client), [VERSION, 0xFF]);

    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0, "connection should be closed after the rejection reply drains");

    drop(client);
    reactor_handle.join().unwrap();
}

#[test]
fn bad_version_closes_without_a_reply() {
    let (proxy_addr, _shutdown_sender, reactor_handle) = spawn_reactor();

    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client.write_all(&[0x04, 0x01, 0x00]).unwrap();

    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0, "bad version gets no reply, just a close");

    drop(client);
    reactor_handle.join().unwrap();
}

#[test]
fn refused_upstream_connect_maps_to_connection_refused_status() {
    let (proxy_addr, _shutdown_sender, reactor_handle) = spawn_reactor();

    // Bind, then immediately drop: the port is very likely to refuse the
    // next connect attempt within this short-lived test.
    let throwaway = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let dead_addr = throwaway.local_addr().unwrap();
    drop(throwaway);

    let mut client = TcpStream::connect(proxy_addr).unwrap();
    send_greeting(&mut client, &[0x00]);
    assert_eq!(read_method_selection(&mut client), [VERSION, 0x00]);

    let Ipv4SocketAddr(octets, port) = split_v4(dead_addr);
    client.write_all(&encode_request(octets, port)).unwrap();
    assert_eq!(read_reply(&mut client), 0x05);

    drop(client);
    reactor_handle.join().unwrap();
}

struct Ipv4SocketAddr([u8; 4], u16);

fn split_v4(addr: std::net::SocketAddr) -> Ipv4SocketAddr {
    match addr {
        std::net::SocketAddr::V4(v4) => Ipv4SocketAddr(v4.ip().octets(), v4.port()),
        std::net::SocketAddr::V6(_) => panic!("loopback test addresses are always v4"),
    }
}
