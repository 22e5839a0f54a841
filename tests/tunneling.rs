//! End-to-end scenarios against a loopback proxy instance: a real client
//! socket, a real origin socket, and a full worker event loop in between.

use std::io::{Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::net::{TcpListener as StdTcpListener, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use connect_proxy::blocklist::Blocklist;
use connect_proxy::net::TcpListener;
use connect_proxy::resolver::Resolver;
use connect_proxy::worker::Worker;

fn write_blocklist(entries: &[&str]) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!(
        "connect-proxy-it-blocklist-{}-{}",
        std::process::id(),
        entries.len()
    ));
    std::fs::write(&path, entries.join("\n")).unwrap();
    path
}

/// Spins up one worker on an ephemeral loopback port and returns its
/// address. The worker runs forever in a background thread for the
/// lifetime of the test process.
fn spawn_proxy(blocklist_entries: &[&str]) -> SocketAddr {
    let path = write_blocklist(blocklist_entries);
    let blocklist = Arc::new(Blocklist::load(&path).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let resolver = Resolver::new(1);
    let handle = resolver.handle();

    // `Worker` is deliberately `!Send` (it owns `Rc`-shared tunnel state);
    // it must be built on the thread that runs it, not handed across.
    thread::spawn(move || {
        let worker = Worker::new(0, listener, handle, blocklist, false).unwrap();
        let _ = worker.run();
        drop(resolver);
    });

    // give the worker a moment to register the listener with its poller
    thread::sleep(Duration::from_millis(50));
    addr
}

fn spawn_echo_origin() -> SocketAddr {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(s) => s,
                Err(_) => continue,
            };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Reads exactly through the header terminator and no further, so bytes
/// pipelined right after it (relayed tunnel traffic arriving in the same
/// read) are left on the socket for the caller instead of being swallowed
/// here.
fn read_response(client: &mut StdTcpStream) -> String {
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut byte = [0u8; 1];
    let mut text = String::new();
    loop {
        let n = client.read(&mut byte).unwrap();
        if n == 0 {
            break;
        }
        text.push(byte[0] as char);
        if text.ends_with("\r\n\r\n") {
            break;
        }
    }
    text
}

#[test]
fn connect_handshake_and_relay() {
    let origin = spawn_echo_origin();
    let proxy = spawn_proxy(&[]);

    let mut client = StdTcpStream::connect(proxy).unwrap();
    write!(client, "CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n").unwrap();

    let response = read_response(&mut client);
    assert_eq!(response, "HTTP/1.1 200 Connection Established \r\n\r\n");

    client.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}

#[test]
fn pipelined_bytes_after_connect_are_relayed() {
    let origin = spawn_echo_origin();
    let proxy = spawn_proxy(&[]);

    let mut client = StdTcpStream::connect(proxy).unwrap();
    write!(client, "CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\nextra").unwrap();

    let response = read_response(&mut client);
    assert_eq!(response, "HTTP/1.1 200 Connection Established \r\n\r\n");

    let mut buf = [0u8; 5];
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"extra");
}

#[test]
fn blocklisted_host_gets_400() {
    let origin = spawn_echo_origin();
    let proxy = spawn_proxy(&[&origin.ip().to_string()]);

    let mut client = StdTcpStream::connect(proxy).unwrap();
    write!(client, "CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n").unwrap();

    let response = read_response(&mut client);
    assert_eq!(response, "HTTP/1.1 400 Bad Request \r\n\r\n");
}

#[test]
fn non_connect_method_closes_without_response() {
    let proxy = spawn_proxy(&[]);

    let mut client = StdTcpStream::connect(proxy).unwrap();
    write!(client, "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();

    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn resolution_failure_gets_400() {
    let proxy = spawn_proxy(&[]);

    let mut client = StdTcpStream::connect(proxy).unwrap();
    write!(client, "CONNECT this-host-does-not-resolve.invalid:443 HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

    let response = read_response(&mut client);
    assert_eq!(response, "HTTP/1.1 400 Bad Request \r\n\r\n");
}

#[test]
fn concurrent_tunnels_do_not_leak_descriptors() {
    let origin = spawn_echo_origin();
    let proxy = spawn_proxy(&[]);

    for _ in 0..50 {
        let mut client = StdTcpStream::connect(proxy).unwrap();
        write!(client, "CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n").unwrap();
        let response = read_response(&mut client);
        assert_eq!(response, "HTTP/1.1 200 Connection Established \r\n\r\n");
        client.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.read_exact(&mut buf).unwrap();
        drop(client);
    }
}
