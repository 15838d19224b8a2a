//! End-to-end tests for the SockJS URL surface and session semantics,
//! driven over real sockets against a bound listener.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use inlet::{App, Conn, Endpoint, Payload, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

#[derive(Clone, Default)]
struct Probe {
    transport: Arc<Mutex<Option<Transport>>>,
    seen: Arc<Mutex<Vec<String>>>,
}

struct ProbeEndpoint {
    shared: Probe,
}

#[async_trait]
impl Endpoint for ProbeEndpoint {
    async fn on_connect(&mut self, conn: &Conn) {
        *self.shared.transport.lock().unwrap() = Some(conn.transport().clone());
    }

    async fn on_message(&mut self, _conn: &Conn, msg: Payload) {
        if let Payload::Text(text) = msg {
            self.shared.seen.lock().unwrap().push(text);
        }
    }
}

async fn start(probe: Probe) -> SocketAddr {
    let app = App::new()
        .sockjs("/chat", move || ProbeEndpoint {
            shared: probe.clone(),
        })
        .sockjs_no_websocket("/quiet", || ProbeEndpoint {
            shared: Probe::default(),
        });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(app.serve_listener(listener));
    addr
}

async fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if buf.windows(needle.len()).any(|w| w == needle) {
            return buf;
        }
        let n = timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("timed out waiting for response bytes")
            .unwrap();
        assert!(n > 0, "connection closed before {:?} arrived", needle);
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("timed out waiting for connection close")
        .unwrap();
    buf
}

async fn one_shot(addr: SocketAddr, raw: &[u8], needle: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    String::from_utf8(read_until(&mut stream, needle).await).unwrap()
}

#[tokio::test]
async fn the_welcome_page_greets() {
    let addr = start(Probe::default()).await;
    let out = one_shot(addr, b"GET /chat HTTP/1.1\r\n\r\n", b"Welcome").await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.ends_with("Welcome to SockJS!\n"));

    let out = one_shot(addr, b"GET /chat/ HTTP/1.1\r\n\r\n", b"Welcome").await;
    assert!(out.ends_with("Welcome to SockJS!\n"));
}

#[tokio::test]
async fn xhr_poll_sequence_opens_delivers_and_receives() {
    let probe = Probe::default();
    let addr = start(probe.clone()).await;

    // first poll creates the session and answers the open frame
    let out = one_shot(addr, b"POST /chat/abc/s1/xhr HTTP/1.1\r\n\r\n", b"\r\n\r\no\n").await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Access-Control-Allow-Origin: *\r\n"));

    // the endpoint pushes a message; the next poll drains it
    let transport = probe.transport.lock().unwrap().clone().unwrap();
    transport.send("hi");
    let out = one_shot(
        addr,
        b"POST /chat/abc/s1/xhr HTTP/1.1\r\n\r\n",
        b"a[\"hi\"]\n",
    )
    .await;
    assert!(out.contains("a[\"hi\"]\n"));

    // inbound via xhr_send reaches on_message and answers 204
    let out = one_shot(
        addr,
        b"POST /chat/abc/s1/xhr_send HTTP/1.1\r\nContent-Length: 9\r\n\r\n[\"world\"]",
        b"\r\n\r\n",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 204 No Content\r\n"));
    assert_eq!(*probe.seen.lock().unwrap(), ["world"]);
}

#[tokio::test]
async fn xhr_send_without_a_session_is_not_found() {
    let addr = start(Probe::default()).await;
    let out = one_shot(
        addr,
        b"POST /chat/abc/nosession/xhr_send HTTP/1.1\r\nContent-Length: 6\r\n\r\n[\"x\"]!",
        b"\r\n\r\n",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[tokio::test]
async fn send_transport_error_bodies() {
    let probe = Probe::default();
    let addr = start(probe).await;
    one_shot(addr, b"POST /chat/abc/s2/xhr HTTP/1.1\r\n\r\n", b"\r\n\r\no\n").await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST /chat/abc/s2/xhr_send HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let out = String::from_utf8(read_to_end(&mut stream).await).unwrap();
    assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(out.ends_with("Payload expected."));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST /chat/abc/s2/xhr_send HTTP/1.1\r\nContent-Length: 8\r\n\r\nnot json")
        .await
        .unwrap();
    let out = String::from_utf8(read_to_end(&mut stream).await).unwrap();
    assert!(out.ends_with("Broken JSON encoding."));
}

#[tokio::test]
async fn closing_the_session_delivers_go_away() {
    let probe = Probe::default();
    let addr = start(probe.clone()).await;
    one_shot(addr, b"POST /chat/abc/s3/xhr HTTP/1.1\r\n\r\n", b"\r\n\r\no\n").await;

    let transport = probe.transport.lock().unwrap().clone().unwrap();
    transport.close();

    let out = one_shot(
        addr,
        b"POST /chat/abc/s3/xhr HTTP/1.1\r\n\r\n",
        b"c[3000,\"Go away!\"]\n",
    )
    .await;
    assert!(out.contains("c[3000,\"Go away!\"]\n"));
}

#[tokio::test]
async fn concurrent_streaming_polls_fence_the_session() {
    let addr = start(Probe::default()).await;

    // the first poll attaches and receives the prelude and open frame
    let mut first = TcpStream::connect(addr).await.unwrap();
    first
        .write_all(b"POST /chat/abc/s4/xhr_streaming HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let opening = read_until(&mut first, b"2\r\no\n\r\n").await;
    let opening = String::from_utf8(opening).unwrap();
    assert!(opening.contains("Transfer-Encoding: chunked"));
    assert!(opening.contains(&"h".repeat(2048)));

    // a second initiating poll interrupts: it is refused outright...
    let mut second = TcpStream::connect(addr).await.unwrap();
    second
        .write_all(b"POST /chat/abc/s4/xhr_streaming HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let refused = String::from_utf8(read_to_end(&mut second).await).unwrap();
    assert!(refused.contains("c[1002,\"Connection interrupted\"]"));

    // ...and the attached poll is torn down with the lock frame
    let torn_down = String::from_utf8(read_to_end(&mut first).await).unwrap();
    assert!(torn_down.contains("c[2010,\"Another connection still open\"]"));
    assert!(torn_down.ends_with("0\r\n\r\n"));

    // later initiating polls keep seeing the interrupted frame
    let out = one_shot(
        addr,
        b"POST /chat/abc/s4/xhr HTTP/1.1\r\n\r\n",
        b"c[1002,\"Connection interrupted\"]\n",
    )
    .await;
    assert!(out.contains("c[1002,\"Connection interrupted\"]\n"));
}

#[tokio::test]
async fn dropping_a_parked_poll_releases_the_attachment() {
    let probe = Probe::default();
    let addr = start(probe.clone()).await;
    one_shot(addr, b"POST /chat/abc/s9/xhr HTTP/1.1\r\n\r\n", b"\r\n\r\no\n").await;

    // park a poll on the empty session, then abandon it
    let mut parked = TcpStream::connect(addr).await.unwrap();
    parked
        .write_all(b"POST /chat/abc/s9/xhr HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(parked);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the session detached, so a fresh poll attaches instead of
    // tripping the one-attached-poll fence
    let transport = probe.transport.lock().unwrap().clone().unwrap();
    transport.send("later");
    let out = one_shot(
        addr,
        b"POST /chat/abc/s9/xhr HTTP/1.1\r\n\r\n",
        b"a[\"later\"]\n",
    )
    .await;
    assert!(out.contains("a[\"later\"]\n"));
}

#[tokio::test]
async fn info_reports_websocket_capability() {
    let addr = start(Probe::default()).await;
    let out = one_shot(addr, b"GET /chat/info HTTP/1.1\r\n\r\n", b"entropy").await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    let body = &out[out.find("\r\n\r\n").unwrap() + 4..];
    let doc: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(doc["websocket"], serde_json::Value::Bool(true));
    assert_eq!(doc["origins"][0], "*:*");

    let out = one_shot(addr, b"GET /quiet/info HTTP/1.1\r\n\r\n", b"entropy").await;
    let body = &out[out.find("\r\n\r\n").unwrap() + 4..];
    let doc: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(doc["websocket"], serde_json::Value::Bool(false));
}

#[tokio::test]
async fn transport_preflight_and_method_enforcement() {
    let addr = start(Probe::default()).await;

    let out = one_shot(
        addr,
        b"OPTIONS /chat/abc/s5/xhr HTTP/1.1\r\nOrigin: http://example.com\r\n\r\n",
        b"\r\n\r\n",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 204 No Content\r\n"));
    assert!(out.contains("Access-Control-Allow-Methods: OPTIONS, POST\r\n"));
    assert!(out.contains("Access-Control-Allow-Origin: http://example.com\r\n"));
    assert!(out.contains("Access-Control-Max-Age: 31536000\r\n"));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /chat/abc/s5/xhr HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let out = String::from_utf8(read_to_end(&mut stream).await).unwrap();
    assert!(out.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
    assert!(out.contains("Allow: OPTIONS, POST\r\n"));
}

#[tokio::test]
async fn malformed_session_paths_are_not_found() {
    let addr = start(Probe::default()).await;
    for raw in [
        &b"POST /chat/abc/s6/teleport HTTP/1.1\r\n\r\n"[..],
        &b"POST /chat/only/two HTTP/1.1\r\n\r\n"[..],
        &b"POST /chat/a.b/s6/xhr HTTP/1.1\r\n\r\n"[..],
    ] {
        let out = one_shot(addr, raw, b"\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", out);
    }

    // websocket transport is refused when forbidden on the endpoint
    let out = one_shot(addr, b"GET /quiet/abc/s6/websocket HTTP/1.1\r\n\r\n", b"\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[tokio::test]
async fn jsonp_polls_wrap_frames_in_the_callback() {
    let probe = Probe::default();
    let addr = start(probe.clone()).await;

    let out = one_shot(
        addr,
        b"GET /chat/abc/s7/jsonp?c=cb HTTP/1.1\r\n\r\n",
        b"cb(\"o\");",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));

    let transport = probe.transport.lock().unwrap().clone().unwrap();
    transport.send("hi");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /chat/abc/s7/jsonp?c=cb HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let out = String::from_utf8(read_to_end(&mut stream).await).unwrap();
    assert!(out.contains("cb(\"a[\\\"hi\\\"]\");"));

    // jsonp_send accepts a form-encoded `d` field
    let body = b"d=%5B%22formed%22%5D";
    let mut raw = Vec::new();
    raw.extend_from_slice(b"POST /chat/abc/s7/jsonp_send HTTP/1.1\r\n");
    raw.extend_from_slice(b"Content-Type: application/x-www-form-urlencoded\r\n");
    raw.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    raw.extend_from_slice(body);
    let out = one_shot(addr, &raw, b"ok").await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(probe
        .seen
        .lock()
        .unwrap()
        .iter()
        .any(|m| m == "formed"));
}

#[tokio::test]
async fn eventsource_streams_data_frames() {
    let probe = Probe::default();
    let addr = start(probe.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST /chat/abc/s8/eventsource HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    read_until(&mut stream, b"data: o\r\n").await;

    let transport = probe.transport.lock().unwrap().clone().unwrap();
    transport.send("tick");
    read_until(&mut stream, b"data: a[\"tick\"]\r\n").await;
}

#[tokio::test]
async fn sockjs_websocket_subpath_upgrades_with_the_endpoint() {
    let probe = Probe::default();
    let addr = start(probe.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /chat/websocket HTTP/1.1\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();
    let out = String::from_utf8(read_until(&mut stream, b"\r\n\r\n").await).unwrap();
    assert!(out.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));

    let frame = inlet::ws::FrameBuilder::build(true, inlet::ws::OpCode::Text, b"over-ws", true);
    stream.write_all(&frame).await.unwrap();

    // wait until the receive loop has delivered the message
    timeout(Duration::from_secs(5), async {
        loop {
            if probe.seen.lock().unwrap().iter().any(|m| m == "over-ws") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("endpoint never observed the websocket message");
}

#[tokio::test]
async fn iframe_page_is_cacheable() {
    let addr = start(Probe::default()).await;
    let out = one_shot(addr, b"GET /chat/iframe.html HTTP/1.1\r\n\r\n", b"</html>").await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("ETag: \"0"));
    assert!(out.contains("SockJS.bootstrap_iframe();"));
}
