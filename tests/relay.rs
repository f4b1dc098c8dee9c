//! End-to-end relay tests over loopback, with packet capture replaced by the
//! in-memory backend.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use stream_divert::capture::{Direction, MemoryProvider};
use stream_divert::config::{ProxyRecord, ProxySettings};
use stream_divert::divert::DivertProxy;
use stream_divert::packet;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn loopback_settings(forward_port: u16) -> ProxySettings {
    let mut settings = ProxySettings::new(
        free_port(),
        free_port(),
        vec![ProxyRecord::new(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, forward_port)],
    );
    settings.listen_address = Ipv4Addr::LOCALHOST;
    settings.connect_timeout_ms = Some(2000);
    settings
}

/// Upstream that echoes every connection back, prefixed with `tag`.
fn spawn_echo_server(tag: &'static [u8], connections: usize) -> (u16, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let workers: Vec<_> = (0..connections)
            .map(|_| {
                let (mut conn, _) = listener.accept().unwrap();
                thread::spawn(move || {
                    let mut buf = Vec::new();
                    conn.read_to_end(&mut buf).unwrap();
                    conn.write_all(tag).unwrap();
                    conn.write_all(&buf).unwrap();
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
    });
    (port, handle)
}

fn round_trip(port: u16, payload: &[u8]) -> Vec<u8> {
    exchange(TcpStream::connect(("127.0.0.1", port)).unwrap(), payload)
}

fn exchange(mut client: TcpStream, payload: &[u8]) -> Vec<u8> {
    client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    client.write_all(payload).unwrap();
    client.shutdown(Shutdown::Write).unwrap();
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).unwrap();
    reply
}

/// Minimal IPv4/TCP segment with valid checksums.
fn syn_packet(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16) -> Vec<u8> {
    let mut p = vec![0u8; 40];
    p[0] = 0x45;
    p[2..4].copy_from_slice(&40u16.to_be_bytes());
    p[8] = 64;
    p[9] = 6;
    p[12..16].copy_from_slice(&src.octets());
    p[16..20].copy_from_slice(&dst.octets());
    p[20..22].copy_from_slice(&src_port.to_be_bytes());
    p[22..24].copy_from_slice(&dst_port.to_be_bytes());
    p[32] = 5 << 4;
    p[33] = 0x02;
    p[34..36].copy_from_slice(&64240u16.to_be_bytes());
    assert!(packet::fix_packet_checksums(&mut p));
    p
}

#[test]
fn relays_bytes_in_order_both_ways() {
    let (upstream_port, server) = spawn_echo_server(b"echo:", 1);
    let (provider, _tap) = MemoryProvider::new();
    let proxy = DivertProxy::with_provider(loopback_settings(upstream_port), provider).unwrap();
    proxy.start().unwrap();

    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 253) as u8).collect();
    let reply = round_trip(proxy.settings().proxy_port, &payload);
    assert_eq!(&reply[..5], b"echo:");
    assert_eq!(&reply[5..], &payload[..]);

    server.join().unwrap();
    proxy.stop();
}

#[test]
fn concurrent_connections_are_independent() {
    const CLIENTS: usize = 8;
    let (upstream_port, server) = spawn_echo_server(b"", CLIENTS);
    let (provider, _tap) = MemoryProvider::new();
    let proxy = DivertProxy::with_provider(loopback_settings(upstream_port), provider).unwrap();
    proxy.start().unwrap();
    let proxy_port = proxy.settings().proxy_port;

    let clients: Vec<_> = (0..CLIENTS)
        .map(|i| {
            thread::spawn(move || {
                let payload = format!("client-{}", i).repeat(100).into_bytes();
                assert_eq!(round_trip(proxy_port, &payload), payload);
            })
        })
        .collect();
    for c in clients {
        c.join().unwrap();
    }

    server.join().unwrap();
    assert_eq!(proxy.stats().connections_accepted, CLIENTS as u64);
    proxy.stop();
}

/// Client socket bound to `source` before connecting to the relay.
#[cfg(target_os = "linux")]
fn connect_from(source: Ipv4Addr, port: u16) -> TcpStream {
    use socket2::{Domain, Socket, Type};
    use std::net::SocketAddrV4;

    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    socket.bind(&SocketAddrV4::new(source, 0).into()).unwrap();
    socket
        .connect(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, port).into())
        .unwrap();
    socket.into()
}

// All of 127.0.0.0/8 is routable on Linux loopback.
#[cfg(target_os = "linux")]
#[test]
fn records_route_to_their_own_targets() {
    const PER_SOURCE: usize = 4;
    let second = Ipv4Addr::new(127, 0, 0, 2);
    let (first_port, first_server) = spawn_echo_server(b"one:", PER_SOURCE);
    let (second_port, second_server) = spawn_echo_server(b"two:", PER_SOURCE);

    let mut settings = loopback_settings(first_port);
    settings
        .records
        .push(ProxyRecord::new(second, Ipv4Addr::LOCALHOST, second_port));
    let (provider, _tap) = MemoryProvider::new();
    let proxy = DivertProxy::with_provider(settings, provider).unwrap();
    proxy.start().unwrap();
    let proxy_port = proxy.settings().proxy_port;

    let clients: Vec<_> = (0..PER_SOURCE * 2)
        .map(|i| {
            thread::spawn(move || {
                let (source, tag): (Ipv4Addr, &[u8]) = if i % 2 == 0 {
                    (Ipv4Addr::LOCALHOST, b"one:")
                } else {
                    (second, b"two:")
                };
                let payload = format!("{}-{}", source, i).repeat(50).into_bytes();
                let reply = exchange(connect_from(source, proxy_port), &payload);
                assert_eq!(&reply[..4], tag);
                assert_eq!(&reply[4..], &payload[..]);
            })
        })
        .collect();
    for c in clients {
        c.join().unwrap();
    }

    first_server.join().unwrap();
    second_server.join().unwrap();
    assert_eq!(proxy.stats().connections_unmatched, 0);
    proxy.stop();
}

#[test]
fn unmatched_client_is_dropped() {
    let (provider, _tap) = MemoryProvider::new();
    let mut settings = loopback_settings(1);
    settings.records = vec![ProxyRecord::new(
        Ipv4Addr::new(192, 0, 2, 1),
        Ipv4Addr::LOCALHOST,
        1,
    )];
    let proxy = DivertProxy::with_provider(settings, provider).unwrap();
    proxy.start().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", proxy.settings().proxy_port)).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 8];
    assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));

    proxy.stop();
    assert_eq!(proxy.stats().connections_unmatched, 1);
}

#[test]
fn server_half_close_reaches_client() {
    let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut conn, _) = upstream.accept().unwrap();
        conn.write_all(b"banner").unwrap();
        conn.shutdown(Shutdown::Write).unwrap();
        // Keep reading after our FIN; the client may still talk.
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).unwrap();
        rest
    });

    let (provider, _tap) = MemoryProvider::new();
    let proxy = DivertProxy::with_provider(loopback_settings(upstream_port), provider).unwrap();
    proxy.start().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", proxy.settings().proxy_port)).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut banner = Vec::new();
    client.read_to_end(&mut banner).unwrap();
    assert_eq!(banner, b"banner");

    client.write_all(b"late request").unwrap();
    client.shutdown(Shutdown::Write).unwrap();
    assert_eq!(server.join().unwrap(), b"late request");

    proxy.stop();
}

#[test]
fn diverted_packets_follow_the_relay_port() {
    let (provider, tap) = MemoryProvider::new();
    let proxy = DivertProxy::with_provider(loopback_settings(1), provider).unwrap();
    let redirect = proxy.settings().redirect_port;
    let relay = proxy.settings().proxy_port;
    let client = Ipv4Addr::LOCALHOST;
    let local = Ipv4Addr::new(127, 0, 0, 2);

    // Not started: nothing is diverted.
    assert!(!tap.inject(syn_packet(client, local, 40000, redirect), Direction::Inbound));
    let passed = tap.recv_output(Duration::from_secs(1)).unwrap();
    assert_eq!(packet::parse_ipv4_tcp(&passed.data).unwrap().dst_port, redirect);

    proxy.start().unwrap();

    assert!(tap.inject(syn_packet(client, local, 40000, redirect), Direction::Inbound));
    let inbound = tap.recv_output(Duration::from_secs(2)).unwrap();
    assert_eq!(packet::parse_ipv4_tcp(&inbound.data).unwrap().dst_port, relay);

    assert!(tap.inject(syn_packet(local, client, relay, 40000), Direction::Outbound));
    let outbound = tap.recv_output(Duration::from_secs(2)).unwrap();
    let h = packet::parse_ipv4_tcp(&outbound.data).unwrap();
    assert_eq!((h.src_port, h.dst_port), (redirect, 40000));

    proxy.stop();
    let stats = proxy.stats();
    assert_eq!(stats.packets_diverted, 2);
    assert_eq!(stats.packets_rewritten, 2);
}
