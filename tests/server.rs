//! End-to-end tests: a real server on a loopback socket, driven by
//! plain TCP clients speaking each protocol.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;

use strand::net::ConnectorConfig;
use strand::server::{Server, ServerConfig, ServerControl};

/// Installs a subscriber once so `RUST_LOG=strand=trace` surfaces the
/// core's tracing during test runs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct RunningServer {
    addr: SocketAddr,
    control: ServerControl,
    thread: Option<thread::JoinHandle<()>>,
}

impl RunningServer {
    fn shutdown(mut self) {
        self.control.shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join().expect("server thread");
        }
    }
}

/// Builds and runs a server on an ephemeral port in its own thread.
fn serve(protocol: &'static str) -> RunningServer {
    init_tracing();
    let (tx, rx) = mpsc::channel();
    let thread = thread::spawn(move || {
        let mut config = ServerConfig::default();
        config.worker_count = 2;
        config.shutdown_grace = Duration::from_millis(300);
        let mut server = Server::builder()
            .config(config)
            .handler(|channel| {
                let body = channel.take_body();
                let reply = if body.is_empty() {
                    Bytes::from_static(b"hello, strand\n")
                } else {
                    body
                };
                channel
                    .respond(StatusCode::OK, reply)
                    .expect("respond");
            })
            .build()
            .expect("build server");
        let addr = server
            .listen(
                "test",
                "127.0.0.1:0".parse().unwrap(),
                ConnectorConfig::default(),
                protocol,
            )
            .expect("listen");
        server.start().expect("start");
        tx.send((addr, server.control())).expect("report addr");
        server.run().expect("run");
    });
    let (addr, control) = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("server came up");
    RunningServer {
        addr,
        control,
        thread: Some(thread),
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Reads one HTTP/1 response with a Content-Length body.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end;
    loop {
        let n = stream.read(&mut chunk).expect("read head");
        assert!(n > 0, "connection closed before response head");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            header_end = pos + 4;
            break;
        }
    }
    let head = String::from_utf8(buf[..header_end].to_vec()).expect("utf8 head");
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let mut parts = line.splitn(2, ':');
            let name = parts.next()?.trim();
            if name.eq_ignore_ascii_case("content-length") {
                parts.next()?.trim().parse().ok()
            } else {
                None
            }
        })
        .expect("content-length header");
    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).expect("read body");
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    (head, body)
}

#[test]
fn http1_get_round_trip() {
    let server = serve("http/1.1");
    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{}", head);
    assert!(head.contains("Server: strand/"));
    assert!(head.contains("Date: "));
    assert!(head.contains("Connection: close"));
    assert_eq!(body, b"hello, strand\n");
    // close-negotiated: the server ends the connection
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    drop(stream);
    server.shutdown();
}

#[test]
fn http1_keep_alive_serves_sequential_requests() {
    let server = serve("http/1.1");
    let mut stream = connect(server.addr);
    for i in 0..3 {
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200"), "request {}: {}", i, head);
        assert!(!head.contains("Connection: close"));
        assert_eq!(body, b"hello, strand\n");
    }
    drop(stream);
    server.shutdown();
}

#[test]
fn http1_post_echoes_body() {
    let server = serve("http/1.1");
    let mut stream = connect(server.addr);
    let payload = b"echo me back";
    let request = format!(
        "POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    );
    stream.write_all(request.as_bytes()).unwrap();
    stream.write_all(payload).unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    assert_eq!(body, payload);
    drop(stream);
    server.shutdown();
}

#[test]
fn http1_pipelined_requests_answer_in_order() {
    let server = serve("http/1.1");
    let mut stream = connect(server.addr);
    stream
        .write_all(
            b"GET /a HTTP/1.1\r\nHost: l\r\n\r\nGET /b HTTP/1.1\r\nHost: l\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
    let (head_a, body_a) = read_response(&mut stream);
    assert!(head_a.starts_with("HTTP/1.1 200"));
    assert_eq!(body_a, b"hello, strand\n");
    let (head_b, body_b) = read_response(&mut stream);
    assert!(head_b.starts_with("HTTP/1.1 200"));
    assert_eq!(body_b, b"hello, strand\n");
    drop(stream);
    server.shutdown();
}

#[test]
fn http1_traversal_is_rejected() {
    let server = serve("http/1.1");
    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /../etc/passwd HTTP/1.1\r\nHost: l\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400"), "{}", head);
    drop(stream);
    server.shutdown();
}

#[test]
fn http2_get_round_trip() {
    use strand::proto::h2::{
        FrameHead, FrameKind, HpackDecoder, HpackEncoder, Settings, PREFACE,
    };

    let server = serve("h2");
    let mut stream = connect(server.addr);

    stream.write_all(PREFACE).unwrap();
    stream.write_all(&Settings::default().encode()).unwrap();

    let mut encoder = HpackEncoder::new(4096);
    let block = encoder.encode(&[
        (b":method".to_vec(), b"GET".to_vec()),
        (b":scheme".to_vec(), b"http".to_vec()),
        (b":path".to_vec(), b"/".to_vec()),
        (b":authority".to_vec(), b"localhost".to_vec()),
    ]);
    // HEADERS, END_STREAM | END_HEADERS, stream 1
    let mut frame = Vec::new();
    frame.push((block.len() >> 16) as u8);
    frame.push((block.len() >> 8) as u8);
    frame.push(block.len() as u8);
    frame.push(1);
    frame.push(0x1 | 0x4);
    frame.extend_from_slice(&1u32.to_be_bytes());
    frame.extend_from_slice(&block);
    stream.write_all(&frame).unwrap();

    let mut decoder = HpackDecoder::new(4096, 64 * 1024);
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut status: Option<Vec<u8>> = None;
    let mut body = Vec::new();
    let mut saw_end_stream = false;
    while !saw_end_stream {
        let n = stream.read(&mut chunk).expect("read frames");
        assert!(n > 0, "connection closed early");
        buf.extend_from_slice(&chunk[..n]);
        loop {
            if buf.len() < 9 {
                break;
            }
            let head = FrameHead::parse(&buf[..9]);
            let total = 9 + head.length as usize;
            if buf.len() < total {
                break;
            }
            let payload = buf[9..total].to_vec();
            buf.drain(..total);
            match head.kind {
                FrameKind::Headers => {
                    let headers = decoder.decode(&payload).expect("hpack");
                    for (name, value) in headers {
                        if name == b":status" {
                            status = Some(value);
                        }
                    }
                    if head.is_flag(0x1) {
                        saw_end_stream = true;
                    }
                }
                FrameKind::Data => {
                    body.extend_from_slice(&payload);
                    if head.is_flag(0x1) {
                        saw_end_stream = true;
                    }
                }
                _ => {}
            }
        }
    }
    assert_eq!(status.as_deref(), Some(&b"200"[..]));
    assert_eq!(body, b"hello, strand\n");
    drop(stream);
    server.shutdown();
}

#[test]
fn fastcgi_request_round_trip() {
    use strand::proto::fastcgi::{Generator, RecordType};

    let server = serve("fastcgi");
    let mut stream = connect(server.addr);

    // BeginRequest: responder, no keep-conn
    let begin = Generator::record(
        RecordType::BeginRequest,
        1,
        &[0, 1, 0, 0, 0, 0, 0, 0],
    );
    stream.write_all(&begin).unwrap();
    let mut params = Vec::new();
    for (name, value) in &[
        ("REQUEST_METHOD", "GET"),
        ("REQUEST_URI", "/status"),
        ("SERVER_PROTOCOL", "HTTP/1.1"),
        ("HTTP_USER_AGENT", "fcgi-test"),
    ] {
        params.push(name.len() as u8);
        params.push(value.len() as u8);
        params.extend_from_slice(name.as_bytes());
        params.extend_from_slice(value.as_bytes());
    }
    stream
        .write_all(&Generator::record(RecordType::Params, 1, &params))
        .unwrap();
    stream
        .write_all(&Generator::record(RecordType::Params, 1, &[]))
        .unwrap();
    stream
        .write_all(&Generator::record(RecordType::StdIn, 1, &[]))
        .unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut stdout = Vec::new();
    let mut ended = false;
    while !ended {
        let n = stream.read(&mut chunk).expect("read records");
        assert!(n > 0, "connection closed before EndRequest");
        buf.extend_from_slice(&chunk[..n]);
        loop {
            if buf.len() < 8 {
                break;
            }
            let content_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
            let padding = buf[6] as usize;
            let total = 8 + content_len + padding;
            if buf.len() < total {
                break;
            }
            let rtype = buf[1];
            let content = buf[8..8 + content_len].to_vec();
            buf.drain(..total);
            match rtype {
                6 => stdout.extend_from_slice(&content), // StdOut
                3 => {
                    // EndRequest: protocol status RequestComplete
                    assert_eq!(content[4], 0);
                    ended = true;
                }
                _ => {}
            }
        }
    }
    let text = String::from_utf8_lossy(&stdout);
    assert!(text.starts_with("Status: 200 OK\r\n"), "{}", text);
    assert!(text.contains("Content-Length: 14"));
    assert!(text.ends_with("hello, strand\n"), "{}", text);
    drop(stream);
    server.shutdown();
}

#[test]
fn connection_hooks_fire() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    init_tracing();
    let opened = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let (o, c, d) = (opened.clone(), closed.clone(), done.clone());
    let thread = thread::spawn(move || {
        let mut config = ServerConfig::default();
        config.worker_count = 1;
        config.shutdown_grace = Duration::from_millis(300);
        let mut server = Server::builder()
            .config(config)
            .on_connection_open(move || {
                o.fetch_add(1, Ordering::SeqCst);
            })
            .on_connection_close(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .on_request_done(move |_req, res| {
                assert_eq!(res.status(), StatusCode::NOT_FOUND);
                d.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .expect("build");
        let addr = server
            .listen(
                "hooks",
                "127.0.0.1:0".parse().unwrap(),
                ConnectorConfig::default(),
                "http/1.1",
            )
            .expect("listen");
        server.start().expect("start");
        tx.send((addr, server.control())).unwrap();
        server.run().expect("run");
    });
    let (addr, control) = rx.recv_timeout(Duration::from_secs(10)).unwrap();

    // default program: every request 404s
    let mut stream = connect(addr);
    stream
        .write_all(b"GET /missing HTTP/1.1\r\nHost: l\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404"), "{}", head);
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    drop(stream);

    // close is observed on the worker before shutdown completes
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while closed.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    control.shutdown();
    thread.join().unwrap();

    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(done.load(Ordering::SeqCst), 1);
}
