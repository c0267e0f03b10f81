//! End-to-end coverage over real sockets: handshake, framing, timeouts
//! and teardown, driven the way an actual protocol client would.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use wirehead::budget::MemBudget;
use wirehead::cdp::{Dispatcher, DispatcherFactory, FrameSink, PageWait};
use wirehead::config::DEFAULT_MAX_MESSAGE_SIZE;
use wirehead::http::FetcherPool;
use wirehead::ws::handshake::json_version_response;
use wirehead::ws::{encode_frame, FrameReader, MessageKind, Opcode};
use wirehead::{Server, ServerConfig, Session};

const UPGRADE_REQUEST: &[u8] = b"GET / HTTP/1.1\r\n\
Host: 127.0.0.1\r\n\
Upgrade: websocket\r\n\
Connection: keep-alive, Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";

/// Echoes data messages; "quit" ends the session.
struct EchoDispatcher;

impl Dispatcher for EchoDispatcher {
    fn handle_message(&mut self, msg: &[u8], sink: &mut dyn FrameSink) -> std::io::Result<bool> {
        if msg == b"quit" {
            return Ok(false);
        }
        let buf = sink.start_text();
        buf.extend_from_slice(msg);
        sink.finish_text()?;
        Ok(true)
    }

    fn page_wait(&mut self, _timeout_ms: u64) -> PageWait {
        PageWait::NoPage
    }
}

struct EchoFactory;

impl DispatcherFactory for EchoFactory {
    fn create(&self) -> Box<dyn Dispatcher> {
        Box::new(EchoDispatcher)
    }
}

/// A masked client key from the OS RNG, as a real client would send.
fn mask_key() -> [u8; 4] {
    let mut key = [0u8; 4];
    getrandom::fill(&mut key).expect("OS RNG unavailable");
    key
}

fn spawn_session(timeout: Duration) -> (TcpStream, Session) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (accepted, _) = listener.accept().unwrap();

    let config = Arc::new(ServerConfig {
        timeout,
        ..ServerConfig::default()
    });
    let session = Session::spawn(
        accepted,
        config,
        Arc::new(FetcherPool::new()),
        Arc::new(EchoFactory),
        json_version_response("127.0.0.1", 9222),
    )
    .unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    (peer, session)
}

/// Client-role reader over the peer socket: decodes the server's
/// unmasked frames.
struct TestClient {
    stream: TcpStream,
    reader: FrameReader,
}

impl TestClient {
    fn new(stream: TcpStream) -> Self {
        let budget = Rc::new(MemBudget::new(16 * 1024 * 1024));
        Self {
            stream,
            reader: FrameReader::client(budget, DEFAULT_MAX_MESSAGE_SIZE).unwrap(),
        }
    }

    fn upgrade(&mut self) {
        self.stream.write_all(UPGRADE_REQUEST).unwrap();
        let mut response = vec![0u8; 129];
        self.stream.read_exact(&mut response).unwrap();
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-Websocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    }

    fn send(&mut self, opcode: Opcode, payload: &[u8]) {
        self.stream
            .write_all(&encode_frame(opcode, true, Some(mask_key()), payload))
            .unwrap();
    }

    /// Block until one complete message arrives.
    fn recv(&mut self) -> (MessageKind, Vec<u8>) {
        loop {
            if let Some(msg) = self.reader.next().unwrap() {
                let decoded = (msg.kind, msg.payload.to_vec());
                self.reader.compact();
                return decoded;
            }
            self.reader.ensure_spare(4096).unwrap();
            let n = self.stream.read(self.reader.spare_mut()).unwrap();
            assert_ne!(n, 0, "server closed before a full message arrived");
            self.reader.extend_filled(n);
        }
    }
}

#[test]
fn upgrade_then_echo_roundtrip() {
    let (peer, session) = spawn_session(Duration::from_secs(5));
    let mut client = TestClient::new(peer);
    client.upgrade();

    client.send(Opcode::Text, b"hello over the wire");
    let (kind, payload) = client.recv();
    assert_eq!(kind, MessageKind::Text);
    assert_eq!(payload, b"hello over the wire");

    session.shutdown();
    session.join();
}

#[test]
fn fragmented_message_is_reassembled() {
    let (peer, session) = spawn_session(Duration::from_secs(5));
    let mut client = TestClient::new(peer);
    client.upgrade();

    client
        .stream
        .write_all(&encode_frame(Opcode::Text, false, Some(mask_key()), b"mask"))
        .unwrap();
    client
        .stream
        .write_all(&encode_frame(
            Opcode::Continuation,
            true,
            Some(mask_key()),
            b"d",
        ))
        .unwrap();

    let (kind, payload) = client.recv();
    assert_eq!(kind, MessageKind::Text);
    assert_eq!(payload, b"maskd");

    session.shutdown();
    session.join();
}

#[test]
fn oversized_message_gets_close_1009() {
    let (peer, session) = spawn_session(Duration::from_secs(5));
    let mut client = TestClient::new(peer);
    client.upgrade();

    let mut header = vec![0x81u8, 0x80 | 127];
    header.extend_from_slice(&(DEFAULT_MAX_MESSAGE_SIZE as u64 + 1).to_be_bytes());
    client.stream.write_all(&header).unwrap();

    let (kind, payload) = client.recv();
    assert_eq!(kind, MessageKind::Close);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1009);

    session.join();
}

#[test]
fn unmasked_frame_gets_close_1002() {
    let (peer, session) = spawn_session(Duration::from_secs(5));
    let mut client = TestClient::new(peer);
    client.upgrade();

    client
        .stream
        .write_all(&encode_frame(Opcode::Text, true, None, b"bare"))
        .unwrap();

    let (kind, payload) = client.recv();
    assert_eq!(kind, MessageKind::Close);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1002);

    session.join();
}

#[test]
fn ping_gets_pong_with_same_payload() {
    let (peer, session) = spawn_session(Duration::from_secs(5));
    let mut client = TestClient::new(peer);
    client.upgrade();

    client.send(Opcode::Ping, b"heartbeat");
    let (kind, payload) = client.recv();
    assert_eq!(kind, MessageKind::Pong);
    assert_eq!(payload, b"heartbeat");

    session.shutdown();
    session.join();
}

#[test]
fn dispatcher_ending_session_sends_close_1000() {
    let (peer, session) = spawn_session(Duration::from_secs(5));
    let mut client = TestClient::new(peer);
    client.upgrade();

    client.send(Opcode::Text, b"quit");
    let (kind, payload) = client.recv();
    assert_eq!(kind, MessageKind::Close);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1000);

    session.join();
}

#[test]
fn json_version_has_exact_content_length_and_closes() {
    let (mut peer, session) = spawn_session(Duration::from_secs(5));

    peer.write_all(b"GET /json/version HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .unwrap();

    let mut response = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        match peer.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
        if let Some(split) = response.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = std::str::from_utf8(&response[..split]).unwrap();
            let content_length: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .unwrap()
                .parse()
                .unwrap();
            if response.len() >= split + 4 + content_length {
                break;
            }
        }
    }

    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    let (head, body) = text.split_once("\r\n\r\n").unwrap();
    assert!(head.contains(&format!("Content-Length: {}", body.len())));
    assert!(head.contains("Connection: Close"));
    assert_eq!(body, "{\"webSocketDebuggerUrl\": \"ws://127.0.0.1:9222/\"}");

    // The read side is closed: anything we send now just surfaces EOF in
    // the session, which tears down and closes the socket fully. The
    // write may race the final close and draw a reset, which is equally
    // conclusive.
    let _ = peer.write_all(b"probe again");
    let mut buf = [0u8; 16];
    match peer.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {n} bytes after /json/version"),
    }

    session.join();
}

#[test]
fn bad_path_gets_404() {
    let (mut peer, session) = spawn_session(Duration::from_secs(5));

    peer.write_all(b"GET /json/list HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let mut response = vec![0u8; 16];
    peer.read_exact(&mut response).unwrap();
    assert!(response.starts_with(b"HTTP/1.1 404 \r\n"));

    session.join();
}

#[test]
fn quiet_connection_is_closed_after_timeout() {
    let (mut peer, session) = spawn_session(Duration::from_millis(200));

    let mut buf = [0u8; 16];
    let n = peer.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected EOF from server-side timeout");

    session.join();
}

#[test]
fn accept_loop_replaces_previous_session() {
    let config = ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    };
    let server = Server::bind(config, Arc::new(EchoFactory)).unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || {
        let _ = server.run();
    });

    let first = TcpStream::connect(addr).unwrap();
    first
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut first_client = TestClient::new(first);
    first_client.upgrade();

    // A second connection displaces the first.
    let second = TcpStream::connect(addr).unwrap();
    second
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut buf = [0u8; 16];
    let n = first_client.stream.read(&mut buf).unwrap();
    assert_eq!(n, 0, "first connection should be shut down");

    let mut second_client = TestClient::new(second);
    second_client.upgrade();
    second_client.send(Opcode::Text, b"still serving");
    let (_, payload) = second_client.recv();
    assert_eq!(payload, b"still serving");
}
