//! End-to-end exercises of the session layer over real sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use portico::{
    AppError, Connection, InboundMessage, ListenerConfig, MessageHandler, MessageHandlerFactory,
    OutboundMessage, Protocol, ServerConfig, ServerRuntime, SessionConfig,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

/// Application that echoes every message back on the connection it arrived
/// on and counts session deaths.
struct EchoApp {
    received: Mutex<Vec<Value>>,
    deaths: AtomicUsize,
}

struct EchoFactory {
    app: Arc<EchoApp>,
}

impl MessageHandlerFactory for EchoFactory {
    fn provide_handler(
        &self,
        connection: Option<&Arc<dyn Connection>>,
    ) -> Option<Arc<dyn MessageHandler>> {
        connection?;
        Some(self.app.clone())
    }
}

impl MessageHandler for EchoApp {
    fn receive_msg(&self, connection: &Arc<dyn Connection>, message: InboundMessage) {
        if let InboundMessage::Json(value) = message {
            self.received.lock().push(value.clone());
            connection.send(OutboundMessage::Json(value));
        }
    }

    fn connection_died(&self, _connection: &Arc<dyn Connection>, _reason: &AppError) {
        self.deaths.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        session: SessionConfig {
            inactivity_timeout_secs: 60,
            disconnected_timeout_secs: 20,
            backlog_limit_bytes: 64 * 1024,
            startup_grace_secs: 20,
            select_timeout_secs: 25,
        },
        ..ServerConfig::default()
    }
}

fn listener(protocol: Protocol) -> ListenerConfig {
    ListenerConfig {
        label: "test".to_string(),
        addr: "127.0.0.1:0".to_string(),
        protocol,
        secure: false,
        root_uri: "portico".to_string(),
    }
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> String {
    let mut line = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("timed out waiting for a reply line")
        .expect("read failed");
    line.trim_end_matches('\n').trim_end_matches('\r').to_string()
}

/// Read one RTCP message delivery: the sequence line, the message text, and
/// the blank terminator line.
async fn read_delivery(reader: &mut BufReader<OwnedReadHalf>) -> (u64, u64, Value) {
    let seq_line = read_line(reader).await;
    let mut parts = seq_line.split(' ');
    let server_seq: u64 = parts.next().unwrap().parse().expect("server seq");
    let client_seq: u64 = parts.next().unwrap().parse().expect("client seq");
    let message_line = read_line(reader).await;
    let blank = read_line(reader).await;
    assert_eq!(blank, "");
    let value = serde_json::from_str(&message_line).expect("delivery payload");
    (server_seq, client_seq, value)
}

#[tokio::test]
async fn rtcp_session_resumes_across_tcp_reconnect() {
    let app = Arc::new(EchoApp {
        received: Mutex::new(Vec::new()),
        deaths: AtomicUsize::new(0),
    });
    let runtime = ServerRuntime::new(Arc::new(test_config()));
    let factory: Arc<dyn MessageHandlerFactory> = Arc::new(EchoFactory { app: app.clone() });
    let addr = runtime
        .listen(&listener(Protocol::Rtcp), factory)
        .await
        .expect("listen failed");

    // open the session with no prior ID
    let socket = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(b"start\n").await.unwrap();
    let start_reply = read_line(&mut reader).await;
    let session_id = start_reply
        .strip_prefix("start ")
        .expect("start reply")
        .to_string();

    // deliver request seq=1 with one JSON message; the app echoes it
    write_half
        .write_all(b"1 0\n{\"op\":\"probe\",\"n\":1}\n\n")
        .await
        .unwrap();
    let (server_seq, client_seq, value) = read_delivery(&mut reader).await;
    assert_eq!(server_seq, 1);
    assert_eq!(client_seq, 1);
    assert_eq!(value, json!({"op":"probe","n":1}));
    assert_eq!(app.received.lock().len(), 1);

    // drop the TCP connection outright
    drop(write_half);
    drop(reader);

    // reconnect within the disconnect timeout, presenting the session ID and
    // acknowledging the echo we already received
    let socket = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    write_half
        .write_all(format!("resume {} 1\n", session_id).as_bytes())
        .await
        .unwrap();
    let resume_reply = read_line(&mut reader).await;
    assert_eq!(resume_reply, format!("resume {} 1", session_id));

    // same logical session: the next bundle must be seq 2, and nothing
    // already acknowledged is redelivered
    write_half
        .write_all(b"2 1\n{\"op\":\"probe\",\"n\":2}\n\n")
        .await
        .unwrap();
    let (server_seq, client_seq, value) = read_delivery(&mut reader).await;
    assert_eq!(server_seq, 2);
    assert_eq!(client_seq, 2);
    assert_eq!(value, json!({"op":"probe","n":2}));

    // the session never died through all of that
    assert_eq!(app.deaths.load(Ordering::SeqCst), 0);
    assert_eq!(app.received.lock().len(), 2);
}

#[tokio::test]
async fn rtcp_sequence_gap_gets_error_reply() {
    let app = Arc::new(EchoApp {
        received: Mutex::new(Vec::new()),
        deaths: AtomicUsize::new(0),
    });
    let runtime = ServerRuntime::new(Arc::new(test_config()));
    let factory: Arc<dyn MessageHandlerFactory> = Arc::new(EchoFactory { app: app.clone() });
    let addr = runtime
        .listen(&listener(Protocol::Rtcp), factory)
        .await
        .expect("listen failed");

    let socket = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(b"start\n").await.unwrap();
    let _ = read_line(&mut reader).await;

    // seq 5 when 1 was expected
    write_half
        .write_all(b"5 0\n{\"op\":\"probe\"}\n\n")
        .await
        .unwrap();
    let reply = read_line(&mut reader).await;
    assert_eq!(reply, "error sequenceError");
    assert!(app.received.lock().is_empty());
}

#[tokio::test]
async fn plain_json_port_round_trips_messages() {
    let app = Arc::new(EchoApp {
        received: Mutex::new(Vec::new()),
        deaths: AtomicUsize::new(0),
    });
    let runtime = ServerRuntime::new(Arc::new(test_config()));
    let factory: Arc<dyn MessageHandlerFactory> = Arc::new(EchoFactory { app: app.clone() });
    let addr = runtime
        .listen(&listener(Protocol::Json), factory)
        .await
        .expect("listen failed");

    let socket = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(b"{\"op\":\"echo\",\"text\":\"hi\"}\n\n")
        .await
        .unwrap();
    let reply_line = read_line(&mut reader).await;
    let value: Value = serde_json::from_str(&reply_line).unwrap();
    assert_eq!(value, json!({"op":"echo","text":"hi"}));
    let blank = read_line(&mut reader).await;
    assert_eq!(blank, "");
}

#[tokio::test]
async fn http_port_serves_connect_and_xmit() {
    let app = Arc::new(EchoApp {
        received: Mutex::new(Vec::new()),
        deaths: AtomicUsize::new(0),
    });
    let runtime = ServerRuntime::new(Arc::new(test_config()));
    let factory: Arc<dyn MessageHandlerFactory> = Arc::new(EchoFactory { app: app.clone() });
    let addr = runtime
        .listen(&listener(Protocol::Http), factory)
        .await
        .expect("listen failed");

    let socket = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(b"GET /portico/connect HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .unwrap();

    // status line, headers, blank, then the JSON body
    let status = read_line(&mut reader).await;
    assert_eq!(status, "HTTP/1.1 200 OK");
    let mut content_length = 0usize;
    loop {
        let line = read_line(&mut reader).await;
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length: ") {
            content_length = value.parse().unwrap();
        }
    }
    assert!(content_length > 0);
    let body = read_line(&mut reader).await;
    let parsed: Value = serde_json::from_str(&body).unwrap();
    let session_id = parsed["sessionid"].as_str().unwrap().to_string();

    // deliver one message on the same keep-alive connection
    let bundle = "{\"op\":\"probe\"}";
    let request = format!(
        "POST /portico/xmit/{}/1 HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
        session_id,
        bundle.len(),
        bundle
    );
    write_half.write_all(request.as_bytes()).await.unwrap();

    let status = read_line(&mut reader).await;
    assert_eq!(status, "HTTP/1.1 200 OK");
    loop {
        let line = read_line(&mut reader).await;
        if line.is_empty() {
            break;
        }
    }
    let body = read_line(&mut reader).await;
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["seq"], json!(2));
    assert_eq!(*app.received.lock(), vec![json!({"op":"probe"})]);
}
