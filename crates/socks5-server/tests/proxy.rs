//! Run a real server on the loopback interface and talk SOCKS to it.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hex_literal::hex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use socks5_server::{AllowAll, Decision, NullLogger, ResolveError, Resolver, Server};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const LOCALHOST_V6: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);

/// A resolver that answers from a fixed table.
#[derive(Default)]
struct FakeResolver(HashMap<&'static str, Vec<IpAddr>>);

impl FakeResolver {
    fn with(mut self, name: &'static str, addrs: &[&str]) -> Self {
        self.0
            .insert(name, addrs.iter().map(|a| a.parse().unwrap()).collect());
        self
    }
}

#[async_trait]
impl Resolver for FakeResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        self.0
            .get(host)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(host.to_string()))
    }
}

/// Return a quiet server with `AllowAll`.
fn quiet_server() -> Server {
    let server = Server::new();
    server.set_logger(NullLogger).unwrap();
    server.set_ruler(AllowAll).unwrap();
    server
}

/// Wait until `server` has `n` listeners open.
async fn wait_for_instances(server: &Server, n: usize) {
    for _ in 0..500 {
        if server.active_instances() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("never reached {} instances", n);
}

/// Start `server` on a loopback port, and return the address it listens on.
async fn start(server: &Server) -> SocketAddr {
    start_on(server, LOCALHOST).await
}

/// Start `server` on some port of `ip`, and return the address it listens on.
async fn start_on(server: &Server, ip: IpAddr) -> SocketAddr {
    let running = server.clone();
    tokio::spawn(async move { running.listen_and_serve(ip, 0).await });
    wait_for_instances(server, 1).await;
    server.local_addrs()[0]
}

/// Start a server on IPv4 loopback that echoes everything back on one
/// connection, then closes once its client has finished sending.
async fn echo_server() -> SocketAddr {
    echo_server_on(LOCALHOST).await
}

/// Like [`echo_server`], listening on `ip`.
async fn echo_server_on(ip: IpAddr) -> SocketAddr {
    let lis = TcpListener::bind((ip, 0)).await.unwrap();
    let addr = lis.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut s, _) = lis.accept().await.unwrap();
        let (mut r, mut w) = s.split();
        tokio::io::copy(&mut r, &mut w).await.unwrap();
        w.shutdown().await.unwrap();
    });
    addr
}

/// Connect to `proxy` and do the method negotiation.
async fn negotiated(proxy: SocketAddr) -> TcpStream {
    let mut s = TcpStream::connect(proxy).await.unwrap();
    s.write_all(&hex!("05 01 00")).await.unwrap();
    let mut answer = [0_u8; 2];
    s.read_exact(&mut answer).await.unwrap();
    assert_eq!(answer, hex!("05 00"));
    s
}

/// Build a CONNECT request for an IPv4 address.
fn connect_v4(addr: SocketAddr) -> Vec<u8> {
    let mut req = hex!("05 01 00 01").to_vec();
    match addr.ip() {
        IpAddr::V4(ip) => req.extend_from_slice(&ip.octets()),
        IpAddr::V6(_) => panic!("not an IPv4 address"),
    }
    req.extend_from_slice(&addr.port().to_be_bytes());
    req
}

/// Build a CONNECT request for a hostname.
fn connect_host(host: &str, port: u16) -> Vec<u8> {
    let mut req = hex!("05 01 00 03").to_vec();
    req.push(host.len() as u8);
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    req
}

/// Return a ruler that records every candidate it is asked about, and
/// allows those for which `allow` is true.
fn recording_ruler(
    allow: fn(IpAddr) -> bool,
) -> (
    impl Fn(IpAddr, IpAddr) -> Decision + Send + Sync + 'static,
    Arc<Mutex<Vec<IpAddr>>>,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let ruler = move |_: IpAddr, candidate: IpAddr| {
        log.lock().unwrap().push(candidate);
        if allow(candidate) {
            Decision::Allow
        } else {
            Decision::Deny
        }
    };
    (ruler, seen)
}

fn ips(addrs: &[&str]) -> Vec<IpAddr> {
    addrs.iter().map(|a| a.parse().unwrap()).collect()
}

/// Send `data` through an established relay to an echo server, close our
/// side, and check that it all comes back.
async fn assert_echoes(mut s: TcpStream, data: &[u8]) {
    s.write_all(data).await.unwrap();
    s.shutdown().await.unwrap();
    let mut got = Vec::new();
    s.read_to_end(&mut got).await.unwrap();
    assert_eq!(got, data);
}

/// Read an IPv4 reply.
async fn read_reply(s: &mut TcpStream) -> [u8; 10] {
    let mut reply = [0_u8; 10];
    s.read_exact(&mut reply).await.unwrap();
    reply
}

/// Check that the server closes `s` without sending anything else.
async fn assert_closed(s: &mut TcpStream) {
    let mut rest = Vec::new();
    s.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn loopback_denied_by_default() {
    let server = Server::new();
    server.set_logger(NullLogger).unwrap();
    let proxy = start(&server).await;

    let mut s = negotiated(proxy).await;
    s.write_all(&hex!("05 01 00 01 7f000001 0050")).await.unwrap();
    assert_eq!(read_reply(&mut s).await, hex!("05 02 00 01 00000000 0000"));
    assert_closed(&mut s).await;
}

#[tokio::test]
async fn no_acceptable_method() {
    let server = quiet_server();
    let proxy = start(&server).await;

    let mut s = TcpStream::connect(proxy).await.unwrap();
    s.write_all(&hex!("05 02 01 02")).await.unwrap();
    let mut answer = [0_u8; 2];
    s.read_exact(&mut answer).await.unwrap();
    assert_eq!(answer, hex!("05 FF"));
    assert_closed(&mut s).await;
}

#[tokio::test]
async fn bind_not_supported() {
    let asked = Arc::new(AtomicUsize::new(0));
    let server = Server::new();
    server.set_logger(NullLogger).unwrap();
    let counter = Arc::clone(&asked);
    server
        .set_ruler(move |_: IpAddr, _: IpAddr| {
            counter.fetch_add(1, Ordering::SeqCst);
            Decision::Allow
        })
        .unwrap();
    let proxy = start(&server).await;

    let mut s = negotiated(proxy).await;
    s.write_all(&hex!("05 02 00 01 7f000001 0050")).await.unwrap();
    assert_eq!(read_reply(&mut s).await[..2], hex!("05 07"));
    assert_closed(&mut s).await;
    assert_eq!(asked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_host() {
    let server = quiet_server();
    server.set_resolver(FakeResolver::default()).unwrap();
    let proxy = start(&server).await;

    let mut s = negotiated(proxy).await;
    s.write_all(&connect_host("nowhere.example", 80)).await.unwrap();
    assert_eq!(read_reply(&mut s).await[..2], hex!("05 04"));
    assert_closed(&mut s).await;
}

#[tokio::test]
async fn every_candidate_denied() {
    let asked = Arc::new(AtomicUsize::new(0));
    let server = Server::new();
    server.set_logger(NullLogger).unwrap();
    server
        .set_resolver(FakeResolver::default().with("two.example", &["192.0.2.1", "2001:db8::1"]))
        .unwrap();
    let counter = Arc::clone(&asked);
    server
        .set_ruler(move |_: IpAddr, _: IpAddr| {
            counter.fetch_add(1, Ordering::SeqCst);
            Decision::Deny
        })
        .unwrap();
    let proxy = start(&server).await;

    let mut s = negotiated(proxy).await;
    s.write_all(&connect_host("two.example", 443)).await.unwrap();
    assert_eq!(read_reply(&mut s).await, hex!("05 02 00 01 00000000 0000"));
    assert_closed(&mut s).await;
    assert_eq!(asked.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn connection_refused() {
    let port = {
        let lis = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        lis.local_addr().unwrap().port()
    };
    let server = quiet_server();
    let proxy = start(&server).await;

    let mut s = negotiated(proxy).await;
    s.write_all(&connect_v4(SocketAddr::new(LOCALHOST, port)))
        .await
        .unwrap();
    assert_eq!(read_reply(&mut s).await[..2], hex!("05 01"));
    assert_closed(&mut s).await;
}

#[tokio::test]
async fn wrong_address_family() {
    // Outbound connections are bound to 127.0.0.1, which can't reach an
    // IPv6 destination.
    let server = quiet_server();
    server
        .set_resolver(FakeResolver::default().with("six.example", &["::1"]))
        .unwrap();
    let proxy = start(&server).await;

    let mut s = negotiated(proxy).await;
    s.write_all(&connect_host("six.example", 80)).await.unwrap();
    assert_eq!(read_reply(&mut s).await[..2], hex!("05 08"));
    assert_closed(&mut s).await;
}

#[tokio::test]
async fn relay_to_echo() {
    let echo = echo_server().await;
    let server = quiet_server();
    let proxy = start(&server).await;

    let mut s = negotiated(proxy).await;
    s.write_all(&connect_v4(echo)).await.unwrap();

    let mut expected = hex!("05 00 00 01 7f000001").to_vec();
    expected.extend_from_slice(&echo.port().to_be_bytes());
    assert_eq!(read_reply(&mut s).await.to_vec(), expected);

    let data: Vec<u8> = (0..100_000_u32).map(|i| (i % 251) as u8).collect();
    let (mut r, mut w) = s.into_split();
    let to_send = data.clone();
    let writer = tokio::spawn(async move {
        w.write_all(&to_send).await.unwrap();
        // Half-close: we can still read the echo afterwards.
        w.shutdown().await.unwrap();
        w
    });
    let mut got = Vec::new();
    r.read_to_end(&mut got).await.unwrap();
    let _w = writer.await.unwrap();
    assert_eq!(got, data);
}

#[tokio::test]
async fn pipelined_hostname_request() {
    let echo = echo_server().await;
    let server = quiet_server();
    server
        .set_resolver_unshuffled(FakeResolver::default().with("echo.example", &["127.0.0.1"]))
        .unwrap();
    let proxy = start(&server).await;

    // Everything at once, without waiting for any answer.
    let mut s = TcpStream::connect(proxy).await.unwrap();
    let mut all = hex!("05 01 00").to_vec();
    all.extend(connect_host("echo.example", echo.port()));
    all.extend_from_slice(b"early bird");
    s.write_all(&all).await.unwrap();
    s.shutdown().await.unwrap();

    let mut got = Vec::new();
    s.read_to_end(&mut got).await.unwrap();
    let mut expected = hex!("05 00 05 00 00 01 7f000001").to_vec();
    expected.extend_from_slice(&echo.port().to_be_bytes());
    expected.extend_from_slice(b"early bird");
    assert_eq!(got, expected);
}

#[tokio::test]
async fn pause_and_resume() {
    let server = quiet_server();
    let proxy = start(&server).await;

    // A connection accepted before pausing keeps working.
    let mut early = negotiated(proxy).await;

    server.pause();
    wait_for_instances(&server, 0).await;
    assert!(TcpStream::connect(proxy).await.is_err());
    // Reconfiguring is fine while everything is paused.
    server.set_ruler(AllowAll).unwrap();

    let echo = echo_server().await;
    early.write_all(&connect_v4(echo)).await.unwrap();
    assert_eq!(read_reply(&mut early).await[..2], hex!("05 00"));

    server.resume();
    wait_for_instances(&server, 1).await;
    assert_eq!(server.local_addrs(), vec![proxy]);
    let _late = negotiated(proxy).await;
    assert!(server.set_ruler(AllowAll).is_err());
}

#[tokio::test]
async fn denied_candidate_is_skipped() {
    let echo = echo_server().await;
    let server = Server::new();
    server.set_logger(NullLogger).unwrap();
    server
        .set_resolver_unshuffled(
            FakeResolver::default().with("mixed.example", &["192.0.2.1", "127.0.0.1"]),
        )
        .unwrap();
    let (ruler, seen) = recording_ruler(|ip| ip.is_loopback());
    server.set_ruler(ruler).unwrap();
    let proxy = start(&server).await;

    let mut s = negotiated(proxy).await;
    s.write_all(&connect_host("mixed.example", echo.port()))
        .await
        .unwrap();
    assert_eq!(read_reply(&mut s).await[..2], hex!("05 00"));
    assert_echoes(s, b"through the second candidate").await;
    assert_eq!(*seen.lock().unwrap(), ips(&["192.0.2.1", "127.0.0.1"]));
}

#[tokio::test]
async fn failed_dial_falls_through() {
    // The outbound address is 127.0.0.1, so dialing ::1 fails at once.
    let echo = echo_server().await;
    let server = Server::new();
    server.set_logger(NullLogger).unwrap();
    server
        .set_resolver_unshuffled(
            FakeResolver::default().with("two.example", &["::1", "127.0.0.1"]),
        )
        .unwrap();
    let (ruler, seen) = recording_ruler(|_| true);
    server.set_ruler(ruler).unwrap();
    let proxy = start(&server).await;

    let mut s = negotiated(proxy).await;
    s.write_all(&connect_host("two.example", echo.port()))
        .await
        .unwrap();
    assert_eq!(read_reply(&mut s).await[..2], hex!("05 00"));
    assert_echoes(s, b"after one failure").await;
    assert_eq!(*seen.lock().unwrap(), ips(&["::1", "127.0.0.1"]));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn refused_dial_falls_through() {
    // Nothing listens on 127.0.0.2 at the echo server's port, so that
    // connection is refused.
    let echo = echo_server().await;
    let server = Server::new();
    server.set_logger(NullLogger).unwrap();
    server
        .set_resolver_unshuffled(
            FakeResolver::default().with("two.example", &["127.0.0.2", "127.0.0.1"]),
        )
        .unwrap();
    let (ruler, seen) = recording_ruler(|_| true);
    server.set_ruler(ruler).unwrap();
    let proxy = start(&server).await;

    let mut s = negotiated(proxy).await;
    s.write_all(&connect_host("two.example", echo.port()))
        .await
        .unwrap();
    assert_eq!(read_reply(&mut s).await[..2], hex!("05 00"));
    assert_echoes(s, b"after a refusal").await;
    assert_eq!(*seen.lock().unwrap(), ips(&["127.0.0.2", "127.0.0.1"]));
}

#[tokio::test]
async fn first_success_ends_the_search() {
    let echo = echo_server().await;
    let server = Server::new();
    server.set_logger(NullLogger).unwrap();
    server
        .set_resolver_unshuffled(
            FakeResolver::default().with(
                "many.example",
                &["127.0.0.1", "198.51.100.1", "192.0.2.1"],
            ),
        )
        .unwrap();
    let (ruler, seen) = recording_ruler(|_| true);
    server.set_ruler(ruler).unwrap();
    let proxy = start(&server).await;

    let mut s = negotiated(proxy).await;
    s.write_all(&connect_host("many.example", echo.port()))
        .await
        .unwrap();
    assert_eq!(read_reply(&mut s).await[..2], hex!("05 00"));
    assert_echoes(s, b"first try").await;
    // The later candidates were never even checked.
    assert_eq!(*seen.lock().unwrap(), ips(&["127.0.0.1"]));
}

#[tokio::test]
async fn relay_over_ipv6() {
    if std::net::TcpListener::bind((LOCALHOST_V6, 0)).is_err() {
        // No IPv6 loopback on this host.
        return;
    }
    let echo = echo_server_on(LOCALHOST_V6).await;
    let server = quiet_server();
    let proxy = start_on(&server, LOCALHOST_V6).await;

    let mut s = negotiated(proxy).await;
    let mut req = hex!("05 01 00 04 00000000000000000000000000000001").to_vec();
    req.extend_from_slice(&echo.port().to_be_bytes());
    s.write_all(&req).await.unwrap();

    // The bound address in the reply is the listener's, ::1.
    let mut reply = [0_u8; 22];
    s.read_exact(&mut reply).await.unwrap();
    let mut expected = hex!("05 00 00 04 00000000000000000000000000000001").to_vec();
    expected.extend_from_slice(&echo.port().to_be_bytes());
    assert_eq!(reply.to_vec(), expected);

    assert_echoes(s, b"over IPv6").await;
}
