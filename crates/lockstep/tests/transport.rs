use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use lockstep::net::LISTENING_ADDRESS;
use lockstep::{ReadStatus, Socket, SocketError, SocketSet, Transport, TransportConfig};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn transport() -> Transport {
    Transport::start(TransportConfig::default()).unwrap()
}

fn connected_pair(transport: &Transport) -> (Socket, Socket) {
    let port = next_port();
    let listener = transport.listen(port).unwrap();
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let client = transport.open(addr, Duration::from_secs(2)).unwrap();

    let mut set = SocketSet::new();
    set.add(&listener);
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        set.check(Duration::from_millis(50)).unwrap();
        if let Some(server) = listener.accept() {
            return (client, server);
        }
    }
    panic!("no connection accepted on port {port}");
}

fn read_bytes(socket: &mut Socket, len: usize) -> Vec<u8> {
    let mut set = SocketSet::new();
    set.add(socket);
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; 4096];

    let start = Instant::now();
    while out.len() < len && start.elapsed() < Duration::from_secs(5) {
        set.check(Duration::from_millis(50)).unwrap();
        match socket.read(&mut buf).unwrap() {
            ReadStatus::Data(n) => out.extend_from_slice(&buf[..n]),
            ReadStatus::Pending => {}
            ReadStatus::Disconnected => break,
        }
    }
    out
}

fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|i| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            // Half noise, half runs, so both deflate paths get exercised.
            if i % 512 < 256 { (state >> 16) as u8 } else { b'a' }
        })
        .collect()
}

#[test]
fn test_uncompressed_round_trip() {
    let transport = transport();
    let (mut client, mut server) = connected_pair(&transport);

    client.write_all(b"hello from the client").unwrap();
    assert_eq!(read_bytes(&mut server, 21), b"hello from the client");

    server.write_all(b"and back").unwrap();
    assert_eq!(read_bytes(&mut client, 8), b"and back");

    assert_eq!(client.stats().bytes_sent, 21);
    assert_eq!(server.stats().bytes_received, 21);
    assert!(!client.is_compressed());
}

#[test]
fn test_compressed_round_trip_various_sizes() {
    let transport = transport();
    let (mut client, mut server) = connected_pair(&transport);
    client.begin_compression();
    client.begin_compression();
    server.begin_compression();
    assert!(client.is_compressed());

    for (seed, size) in [0usize, 1, 100, 4096, 65_536, 300_000].into_iter().enumerate() {
        let payload = noise(size, seed as u32 + 1);
        client.write_all(&payload).unwrap();
        client.flush().unwrap();
        let received = read_bytes(&mut server, size);
        assert_eq!(received.len(), size, "size {size}");
        assert!(received == payload, "payload of {size} bytes differs");
    }

    let stats = client.stats();
    assert!(stats.raw_bytes_sent > 0);
    assert!(stats.raw_bytes_sent < stats.bytes_sent);
}

#[test]
fn test_compressed_writes_wait_for_flush() {
    let transport = transport();
    let (mut client, mut server) = connected_pair(&transport);
    client.begin_compression();
    server.begin_compression();

    client.write_all(b"buffered").unwrap();
    assert_eq!(client.queued_bytes(), 0);
    assert_eq!(client.stats().raw_bytes_sent, 0);

    client.flush().unwrap();
    assert_eq!(read_bytes(&mut server, 8), b"buffered");
}

#[test]
fn test_buffered_plaintext_is_ready_without_polling() {
    let transport = transport();
    let (mut client, mut server) = connected_pair(&transport);
    client.begin_compression();
    server.begin_compression();

    server.write_all(b"ping").unwrap();
    server.flush().unwrap();
    client.write_all(&noise(100_000, 11)).unwrap();
    client.flush().unwrap();

    let mut set = SocketSet::new();
    set.add(&client);
    set.add(&server);
    let start = Instant::now();
    while !(client.read_ready() && server.read_ready()) {
        assert!(start.elapsed() < Duration::from_secs(5), "data never arrived");
        set.check(Duration::from_millis(50)).unwrap();
    }

    // Take a small bite so most of the inflated data stays behind.
    let mut buf = [0u8; 64];
    loop {
        match server.read(&mut buf).unwrap() {
            ReadStatus::Data(n) if n == buf.len() => break,
            ReadStatus::Data(_) => {}
            ReadStatus::Pending => {
                assert!(start.elapsed() < Duration::from_secs(5), "nothing decoded");
                set.check(Duration::from_millis(50)).unwrap();
            }
            ReadStatus::Disconnected => panic!("peer went away"),
        }
    }
    assert!(client.read_ready());

    let start = Instant::now();
    let ready = set.check(Duration::from_secs(5)).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(ready, 1);
    assert!(server.read_ready());
    assert!(!client.read_ready());
}

#[test]
fn test_empty_set_check_returns_at_once() {
    let mut set = SocketSet::new();
    let start = Instant::now();
    assert_eq!(set.check(Duration::from_secs(5)).unwrap(), 0);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_closed_peer_reads_as_disconnect() {
    let transport = transport();
    let (client, mut server) = connected_pair(&transport);
    assert!(server.connection_is_open());
    client.close();

    let mut set = SocketSet::new();
    set.add(&server);
    let ready = set.check(Duration::from_secs(2)).unwrap();
    assert_eq!(ready, 1);
    assert!(server.read_ready());

    let mut buf = [0u8; 64];
    assert_eq!(server.read(&mut buf).unwrap(), ReadStatus::Disconnected);
    assert!(server.read_disconnected());
    assert!(!server.connection_is_open());
}

#[test]
fn test_close_is_deferred_until_queue_drains() {
    let transport = transport();
    let (mut client, mut server) = connected_pair(&transport);

    let payload = noise(4 * 1024 * 1024, 7);
    client.write_all(&payload).unwrap();
    client.close();

    let received = read_bytes(&mut server, payload.len());
    assert_eq!(received.len(), payload.len());
    assert!(received == payload);

    let mut buf = [0u8; 16];
    let start = Instant::now();
    loop {
        match server.read(&mut buf).unwrap() {
            ReadStatus::Disconnected => break,
            ReadStatus::Data(n) => panic!("unexpected {n} extra bytes"),
            ReadStatus::Pending => {
                assert!(start.elapsed() < Duration::from_secs(5));
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

#[test]
fn test_write_to_dead_peer_fails_sticky() {
    let transport = transport();
    let (mut client, server) = connected_pair(&transport);
    drop(server);

    let start = Instant::now();
    let chunk = [0u8; 1024];
    loop {
        match client.write_all(&chunk) {
            Err(SocketError::WriteFailed) => break,
            Err(other) => panic!("unexpected error {other}"),
            Ok(()) => {
                assert!(start.elapsed() < Duration::from_secs(5), "write never failed");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    assert!(client.write_failed());
    assert!(matches!(client.write_all(b"x"), Err(SocketError::WriteFailed)));
}

#[test]
fn test_listener_properties() {
    let transport = transport();
    let port = next_port();
    let listener = transport.listen(port).unwrap();

    assert!(listener.is_listening());
    assert_eq!(listener.text_address(), LISTENING_ADDRESS);
    assert_eq!(listener.local_addr().unwrap().port(), port);
    assert!(listener.accept().is_none());

    let mut listener = listener;
    let mut buf = [0u8; 4];
    assert!(matches!(
        listener.read(&mut buf),
        Err(SocketError::InvalidSocket)
    ));
    assert!(matches!(
        listener.write_all(b"no"),
        Err(SocketError::InvalidSocket)
    ));
}

#[test]
fn test_accepted_socket_reports_peer_address() {
    let transport = transport();
    let (client, server) = connected_pair(&transport);
    assert_eq!(server.text_address(), "127.0.0.1");
    assert_eq!(client.text_address(), "127.0.0.1");
    assert_ne!(client.id(), server.id());
}

#[test]
fn test_read_all_waits_and_times_out() {
    let transport = transport();
    let (mut client, mut server) = connected_pair(&transport);

    let mut buf = [0u8; 4];
    assert!(matches!(
        server.read_all(&mut buf, Some(Duration::from_millis(50))),
        Err(SocketError::TimedOut)
    ));

    let writer = thread::spawn(move || {
        client.write_all(b"ab").unwrap();
        thread::sleep(Duration::from_millis(30));
        client.write_all(b"cd").unwrap();
        thread::sleep(Duration::from_millis(100));
        client
    });
    let n = server.read_all(&mut buf, Some(Duration::from_secs(2))).unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf, b"abcd");

    drop(writer.join().unwrap());
    let mut rest = [0u8; 4];
    assert_eq!(server.read_all(&mut rest, Some(Duration::from_secs(2))).unwrap(), 0);
}

#[test]
fn test_open_refused_and_open_any_falls_through() {
    let transport = transport();
    let dead: SocketAddr = format!("127.0.0.1:{}", next_port()).parse().unwrap();
    assert!(transport.open(dead, Duration::from_millis(500)).is_err());

    let port = next_port();
    let _listener = transport.listen(port).unwrap();
    let live: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let socket = transport
        .open_any(&[dead, live], Duration::from_millis(500))
        .unwrap();
    assert_eq!(socket.local_addr().unwrap().ip(), live.ip());

    let sockets = transport.open_array(&[dead, live, live, live], 2, Duration::from_millis(500));
    assert_eq!(sockets.len(), 2);
}

#[test]
fn test_socket_set_membership() {
    let transport = transport();
    let (client, server) = connected_pair(&transport);

    let mut set = SocketSet::new();
    assert!(set.is_empty());
    assert!(set.add(&client));
    assert!(!set.add(&client));
    assert!(set.add(&server));
    assert_eq!(set.len(), 2);
    assert!(set.contains(server.id()));

    assert!(set.remove(server.id()));
    assert!(!set.contains(server.id()));

    drop(client);
    assert_eq!(set.check(Duration::ZERO).unwrap(), 0);
    assert!(set.is_empty());
}

#[test]
fn test_shutdown_is_idempotent() {
    let mut transport = transport();
    let (mut client, _server) = connected_pair(&transport);
    client.write_all(b"late").unwrap();

    transport.shutdown();
    transport.shutdown();
    assert!(!transport.has_pending_writes());
}
