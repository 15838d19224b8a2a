//! Per-transport framings, the info/iframe/welcome documents, and the
//! CORS plumbing shared by all of them.

use std::sync::Arc;

use http::{Method, StatusCode};
use md5::{Digest, Md5};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::endpoint::Conn;
use crate::error::Error;
use crate::http::{Request, ResponseWriter};
use crate::stream::SocketReader;
use crate::sockjs::{Session, SockJsRoute, TransportKind, CLOSE_GO_AWAY, CLOSE_STILL_OPEN};

const NO_CACHE: &str = "no-store, no-cache, must-revalidate, max-age=0";
const CACHE_ONE_YEAR: &str = "public, max-age=31536000";
const JS_CONTENT_TYPE: &str = "application/javascript;charset=UTF-8";

/// Streaming responses end once this many payload bytes went out, so
/// long-lived transports recycle their connections.
const STREAM_LIMIT: usize = 4096;

const IFRAME_CONTENT: &str = "<!DOCTYPE html>\n\
<html>\n\
<head>\n\
  <meta http-equiv=\"X-UA-Compatible\" content=\"IE=edge\" />\n\
  <meta http-equiv=\"Content-Type\" content=\"text/html; charset=UTF-8\" />\n\
  <script>\n\
    document.domain = document.domain;\n\
    _sockjs_onload = function(){SockJS.bootstrap_iframe();};\n\
  </script>\n\
  <script src=\"//cdn.sockjs.org/sockjs-0.3.min.js\"></script>\n\
</head>\n\
<body>\n\
  <h2>Don't panic!</h2>\n\
  <p>This is a SockJS hidden iframe. It's used for cross domain magic.</p>\n\
</body>\n\
</html>";

const HTMLFILE_SHELL: &str = "<!doctype html>\n\
<html><head>\n\
  <meta http-equiv=\"X-UA-Compatible\" content=\"IE=edge\" />\n\
  <meta http-equiv=\"Content-Type\" content=\"text/html; charset=UTF-8\" />\n\
</head><body><h2>Don't panic!</h2>\n\
  <script>\n\
    document.domain = document.domain;\n\
    var c = parent.{callback};\n\
    c.start();\n\
    function p(d) {c.message(d);};\n\
    window.onload = function() {c.stop();};\n\
  </script>";

/// Echo the request's `Origin`, mapping missing or `null` to `*`.
fn origin(req: &Request) -> String {
    match req.header("origin") {
        None => "*".to_owned(),
        Some("null") => "*".to_owned(),
        Some(origin) => origin.to_owned(),
    }
}

fn a_frame(msgs: &[String]) -> String {
    format!("a{}", serde_json::to_string(msgs).expect("strings encode"))
}

fn json_string(value: &str) -> String {
    serde_json::to_string(value).expect("string encodes")
}

pub(crate) async fn welcome<W>(writer: &mut ResponseWriter<W>) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let content = b"Welcome to SockJS!\n";
    writer.add_headers(vec![
        ("Content-Type", "text/plain;charset=UTF-8".to_owned()),
        ("Content-Length", content.len().to_string()),
    ]);
    writer.write_body(content).await
}

pub(crate) async fn not_found<W>(writer: &mut ResponseWriter<W>) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let content = b"404 Not Found!\n";
    writer.set_status(StatusCode::NOT_FOUND);
    writer.add_headers(vec![
        ("Content-Type", "text/plain; charset=UTF-8".to_owned()),
        ("Content-Length", content.len().to_string()),
    ]);
    writer.write_body(content).await
}

pub(crate) async fn not_allowed<W>(
    writer: &mut ResponseWriter<W>,
    allow: &str,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    writer.set_status(StatusCode::METHOD_NOT_ALLOWED);
    writer.add_headers(vec![
        ("Allow", allow.to_owned()),
        ("Content-Length", "0".to_owned()),
    ]);
    writer.write_body(b"").await?;
    writer.close().await
}

async fn send_500<W>(writer: &mut ResponseWriter<W>, reason: &str) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let body = reason.as_bytes();
    writer.set_status(StatusCode::INTERNAL_SERVER_ERROR);
    writer.set_header("Content-Length", body.len().to_string());
    writer.write_body(body).await?;
    writer.close().await
}

/// The CORS preflight answered for `OPTIONS` on any transport.
pub(crate) async fn preflight<W>(
    req: &Request,
    writer: &mut ResponseWriter<W>,
    allow: &str,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    writer.set_status(StatusCode::NO_CONTENT);
    writer.add_headers(vec![
        ("Content-Type", "application/json;charset=UTF-8".to_owned()),
        ("Cache-Control", CACHE_ONE_YEAR.to_owned()),
        ("Content-Length", "0".to_owned()),
        ("Access-Control-Allow-Origin", origin(req)),
        ("Access-Control-Allow-Credentials", "true".to_owned()),
        ("Access-Control-Allow-Methods", allow.to_owned()),
        ("Access-Control-Max-Age", "31536000".to_owned()),
    ]);
    writer.write_body(b"").await
}

pub(crate) async fn info<W>(
    route: &Arc<SockJsRoute>,
    req: &Request,
    writer: &mut ResponseWriter<W>,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    if req.method() == Method::GET {
        let doc = serde_json::json!({
            "websocket": route.websocket_enabled,
            "cookie_needed": false,
            "origins": ["*:*"],
            "entropy": rand::thread_rng().gen::<u32>(),
        });
        let content = doc.to_string();
        writer.add_headers(vec![
            ("Content-Type", "application/json;charset=UTF-8".to_owned()),
            ("Cache-Control", NO_CACHE.to_owned()),
            ("Content-Length", content.len().to_string()),
            ("Access-Control-Allow-Origin", origin(req)),
            ("Access-Control-Allow-Credentials", "true".to_owned()),
        ]);
        writer.write_body(content.as_bytes()).await
    } else if req.method() == Method::OPTIONS {
        preflight(req, writer, "OPTIONS, GET").await
    } else {
        not_allowed(writer, "OPTIONS, GET").await
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) async fn iframe<W>(
    req: &Request,
    writer: &mut ResponseWriter<W>,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    if req.method() != Method::GET {
        return not_allowed(writer, "GET").await;
    }

    let etag = format!("\"0{}\"", hex(&Md5::digest(IFRAME_CONTENT.as_bytes())));
    if req.header("If-None-Match") == Some(etag.as_str()) {
        writer.set_status(StatusCode::NOT_MODIFIED);
        writer.write_body(b"").await?;
        return writer.close().await;
    }

    writer.add_headers(vec![
        ("Content-Type", "text/html;charset=UTF-8".to_owned()),
        ("Cache-Control", CACHE_ONE_YEAR.to_owned()),
        ("ETag", etag),
        ("Content-Length", IFRAME_CONTENT.len().to_string()),
    ]);
    writer.write_body(IFRAME_CONTENT.as_bytes()).await
}

/// One poll-style response carrying a single frame, with the CORS
/// headers every xhr transport shares.
async fn poll_frame<W>(
    req: &Request,
    writer: &mut ResponseWriter<W>,
    body: &[u8],
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    writer.add_headers(vec![
        ("Content-Type", JS_CONTENT_TYPE.to_owned()),
        ("Content-Length", body.len().to_string()),
        ("Access-Control-Allow-Origin", origin(req)),
        ("Access-Control-Allow-Credentials", "true".to_owned()),
        ("Cache-Control", NO_CACHE.to_owned()),
    ]);
    if let Some(allow) = req.header("access-control-request-headers") {
        let allow = allow.to_owned();
        writer.add_header("Access-Control-Allow-Headers", allow);
    }
    writer.write_body(body).await
}

/// Take and clear the `is_new` flag.
fn take_is_new(session: &Session) -> bool {
    let mut state = session.state();
    let new = state.is_new;
    state.is_new = false;
    new
}

enum PollStep {
    Terminated,
    Closed,
    Drain(Vec<String>),
    Park,
}

#[derive(PartialEq)]
enum Parked {
    Woken,
    Abandoned,
}

/// Park on the session waiter, watching the connection so a vanished
/// or idle peer releases the attachment instead of holding it forever.
async fn park<R>(session: &Session, reader: &mut SocketReader<R>) -> Parked
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        _ = session.wait() => Parked::Woken,
        _ = reader.wait_disconnect() => Parked::Abandoned,
    }
}

fn next_step(session: &Session) -> PollStep {
    let mut state = session.state();
    if state.terminated {
        PollStep::Terminated
    } else if state.closed {
        PollStep::Closed
    } else if !state.outbound.is_empty() {
        PollStep::Drain(state.outbound.drain(..).collect())
    } else {
        PollStep::Park
    }
}

/// The xhr long poll: one framed body per request.
pub(crate) async fn xhr<R, W>(
    route: &Arc<SockJsRoute>,
    req: &Request,
    reader: &mut SocketReader<R>,
    writer: &mut ResponseWriter<W>,
    session: &Arc<Session>,
    conn: &Conn,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if take_is_new(session) {
        session.connect(conn).await;
        return poll_frame(req, writer, b"o\n").await;
    }

    loop {
        match next_step(session) {
            PollStep::Terminated => {
                poll_frame(req, writer, format!("{}\n", CLOSE_STILL_OPEN).as_bytes()).await?;
                session.deliver_close(None).await;
                return Ok(());
            }
            PollStep::Closed => {
                poll_frame(req, writer, format!("{}\n", CLOSE_GO_AWAY).as_bytes()).await?;
                return finish(route, session).await;
            }
            PollStep::Drain(msgs) => {
                let body = format!("{}\n", a_frame(&msgs));
                return poll_frame(req, writer, body.as_bytes()).await;
            }
            PollStep::Park => {
                if park(session, reader).await == Parked::Abandoned {
                    return writer.close().await;
                }
            }
        }
    }
}

/// The jsonp long poll: frames wrapped in the client-supplied callback.
pub(crate) async fn jsonp<R, W>(
    route: &Arc<SockJsRoute>,
    req: &mut Request,
    reader: &mut SocketReader<R>,
    writer: &mut ResponseWriter<W>,
    session: &Arc<Session>,
    conn: &Conn,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let callback = match req.query_pairs().get("c") {
        Some(cb) if !cb.is_empty() => cb.to_owned(),
        _ => return send_500(writer, "\"callback\" parameter required").await,
    };

    if take_is_new(session) {
        session.connect(conn).await;
        let body = format!("{}(\"o\");\r\n", callback);
        return jsonp_body(writer, &body).await;
    }

    loop {
        match next_step(session) {
            PollStep::Terminated => {
                let body = format!("{}({});\r\n", callback, json_string(CLOSE_STILL_OPEN));
                jsonp_body(writer, &body).await?;
                session.deliver_close(None).await;
                return Ok(());
            }
            PollStep::Closed => {
                let body = format!("{}({});\r\n", callback, json_string(CLOSE_GO_AWAY));
                jsonp_body(writer, &body).await?;
                return finish(route, session).await;
            }
            PollStep::Drain(msgs) => {
                let body = format!("{}({});\r\n", callback, json_string(&a_frame(&msgs)));
                jsonp_body(writer, &body).await?;
                return writer.close().await;
            }
            PollStep::Park => {
                if park(session, reader).await == Parked::Abandoned {
                    return writer.close().await;
                }
            }
        }
    }
}

async fn jsonp_body<W>(writer: &mut ResponseWriter<W>, body: &str) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    writer.add_headers(vec![
        ("Content-Type", JS_CONTENT_TYPE.to_owned()),
        ("Content-Length", body.len().to_string()),
        ("Cache-Control", NO_CACHE.to_owned()),
    ]);
    writer.write_body(body.as_bytes()).await
}

/// Streaming transports: a prelude, then framed flushes on the same
/// response until the byte limit recycles the connection.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn streaming<R, W>(
    kind: TransportKind,
    route: &Arc<SockJsRoute>,
    req: &mut Request,
    reader: &mut SocketReader<R>,
    writer: &mut ResponseWriter<W>,
    session: &Arc<Session>,
    conn: &Conn,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let callback = if kind == TransportKind::HtmlFile {
        match req.query_pairs().get("c") {
            Some(cb) if !cb.is_empty() => Some(cb.to_owned()),
            _ => return send_500(writer, "\"callback\" parameter required").await,
        }
    } else {
        None
    };

    let new = take_is_new(session);
    if new {
        session.connect(conn).await;
    }

    open_stream(kind, req, writer, new, callback.as_deref()).await?;

    let mut written = 0usize;
    let mut has_parked = false;
    loop {
        match next_step(session) {
            PollStep::Terminated => {
                frame_chunk(kind, writer, CLOSE_STILL_OPEN).await?;
                end_stream(writer).await?;
                session.deliver_close(None).await;
                return Ok(());
            }
            PollStep::Closed => {
                frame_chunk(kind, writer, CLOSE_GO_AWAY).await?;
                end_stream(writer).await?;
                return finish(route, session).await;
            }
            PollStep::Drain(msgs) => {
                written += flush_messages(kind, writer, &msgs).await?;
                // the opening flush goes out whole; the limit applies
                // once the poll has parked at least once
                if has_parked && written >= STREAM_LIMIT {
                    return end_stream(writer).await;
                }
            }
            PollStep::Park => {
                if park(session, reader).await == Parked::Abandoned {
                    return writer.close().await;
                }
                has_parked = true;
            }
        }
    }
}

async fn open_stream<W>(
    kind: TransportKind,
    req: &Request,
    writer: &mut ResponseWriter<W>,
    new: bool,
    callback: Option<&str>,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    match kind {
        TransportKind::XhrStreaming => {
            writer.add_headers(vec![
                ("Content-Type", JS_CONTENT_TYPE.to_owned()),
                ("Access-Control-Allow-Origin", origin(req)),
                ("Access-Control-Allow-Credentials", "true".to_owned()),
                ("Transfer-Encoding", "chunked".to_owned()),
                ("Cache-Control", NO_CACHE.to_owned()),
            ]);
            let mut prelude = "h".repeat(2048);
            prelude.push('\n');
            write_chunk(writer, prelude.as_bytes()).await?;
            if new {
                write_chunk(writer, b"o\n").await?;
            }
        }
        TransportKind::EventSource => {
            writer.add_headers(vec![
                ("Content-Type", "text/event-stream;charset=UTF-8".to_owned()),
                ("Access-Control-Allow-Origin", origin(req)),
                ("Access-Control-Allow-Credentials", "true".to_owned()),
                ("Transfer-Encoding", "chunked".to_owned()),
                ("Cache-Control", NO_CACHE.to_owned()),
            ]);
            write_chunk(writer, b"\r\n").await?;
            if new {
                write_chunk(writer, b"data: o\r\n\r\n").await?;
            }
        }
        TransportKind::HtmlFile => {
            writer.add_headers(vec![
                ("Content-Type", "text/html;charset=UTF-8".to_owned()),
                ("Transfer-Encoding", "chunked".to_owned()),
                ("Cache-Control", NO_CACHE.to_owned()),
            ]);
            let mut shell = HTMLFILE_SHELL.replace("{callback}", callback.unwrap_or(""));
            shell.push_str(&"\n".repeat(1024));
            write_chunk(writer, shell.as_bytes()).await?;
            if new {
                write_chunk(writer, b"<script>\np(\"o\");\n</script>\r\n").await?;
            }
        }
        _ => unreachable!("not a streaming transport"),
    }
    Ok(())
}

/// Write one flush of drained messages; returns the payload bytes
/// counted against the stream limit.
async fn flush_messages<W>(
    kind: TransportKind,
    writer: &mut ResponseWriter<W>,
    msgs: &[String],
) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    match kind {
        TransportKind::HtmlFile => {
            // one script block per message
            let mut written = 0;
            for msg in msgs {
                let frame = a_frame(std::slice::from_ref(msg));
                let content =
                    format!("<script>\np({});\n</script>\r\n", json_string(&frame));
                write_chunk(writer, content.as_bytes()).await?;
                written += content.len();
            }
            Ok(written)
        }
        _ => frame_chunk(kind, writer, &a_frame(msgs)).await,
    }
}

/// Write a single frame in the transport's chunked encoding.
async fn frame_chunk<W>(
    kind: TransportKind,
    writer: &mut ResponseWriter<W>,
    frame: &str,
) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    let content = match kind {
        TransportKind::XhrStreaming => format!("{}\n", frame),
        TransportKind::EventSource => format!("data: {}\r\n\r\n", frame),
        TransportKind::HtmlFile => format!(
            "<script>\np({});\n</script>\r\n",
            json_string(frame)
        ),
        _ => unreachable!("not a streaming transport"),
    };
    write_chunk(writer, content.as_bytes()).await?;
    Ok(content.len())
}

async fn write_chunk<W>(writer: &mut ResponseWriter<W>, data: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(data.len() + 8);
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    writer.write_body(&out).await
}

async fn end_stream<W>(writer: &mut ResponseWriter<W>) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    writer.write_body(b"0\r\n\r\n").await?;
    writer.close().await
}

/// The close frame delivered to a poll that never attached: the second
/// and later session-initiating polls of a busy or torn-down session.
pub(crate) async fn standalone_close<W>(
    kind: TransportKind,
    req: &mut Request,
    writer: &mut ResponseWriter<W>,
    frame: &str,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    match kind {
        TransportKind::Xhr => poll_frame(req, writer, format!("{}\n", frame).as_bytes()).await,
        TransportKind::Jsonp => {
            let callback = match req.query_pairs().get("c") {
                Some(cb) if !cb.is_empty() => cb.to_owned(),
                _ => return send_500(writer, "\"callback\" parameter required").await,
            };
            let body = format!("{}({});\r\n", callback, json_string(frame));
            jsonp_body(writer, &body).await
        }
        TransportKind::XhrStreaming | TransportKind::EventSource | TransportKind::HtmlFile => {
            let callback = if kind == TransportKind::HtmlFile {
                match req.query_pairs().get("c") {
                    Some(cb) if !cb.is_empty() => Some(cb.to_owned()),
                    _ => return send_500(writer, "\"callback\" parameter required").await,
                }
            } else {
                None
            };
            open_stream(kind, req, writer, false, callback.as_deref()).await?;
            frame_chunk(kind, writer, frame).await?;
            end_stream(writer).await
        }
        _ => poll_frame(req, writer, format!("{}\n", frame).as_bytes()).await,
    }
}

/// Inbound delivery over `xhr_send` / `jsonp_send`.
pub(crate) async fn receive<W>(
    kind: TransportKind,
    req: &mut Request,
    writer: &mut ResponseWriter<W>,
    session: &Arc<Session>,
    conn: &Conn,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let raw = if kind == TransportKind::JsonpSend {
        match req.form().get("d") {
            Some(d) if !d.is_empty() => d.to_owned(),
            _ => String::from_utf8_lossy(req.body()).into_owned(),
        }
    } else {
        String::from_utf8_lossy(req.body()).into_owned()
    };

    if raw.is_empty() {
        return send_500(writer, &Error::PayloadRequired.to_string()).await;
    }
    let msgs: Vec<String> = match serde_json::from_str(&raw) {
        Ok(msgs) => msgs,
        Err(_) => return send_500(writer, &Error::BrokenJson.to_string()).await,
    };

    session.push_inbound(msgs);
    session.consume(conn).await;

    match kind {
        TransportKind::JsonpSend => {
            writer.add_headers(vec![
                ("Content-Type", "text/plain;charset=UTF-8".to_owned()),
                ("Access-Control-Allow-Credentials", "true".to_owned()),
                ("Content-Length", "2".to_owned()),
                ("Cache-Control", NO_CACHE.to_owned()),
            ]);
            writer.write_body(b"ok").await
        }
        _ => {
            writer.set_status(StatusCode::NO_CONTENT);
            writer.add_headers(vec![
                ("Content-Type", "text/plain;charset=UTF-8".to_owned()),
                ("Access-Control-Allow-Origin", origin(req)),
                ("Access-Control-Allow-Credentials", "true".to_owned()),
                ("Cache-Control", NO_CACHE.to_owned()),
            ]);
            writer.write_body(b"").await
        }
    }
}

/// Terminal close has been delivered: run `on_close` and drop the
/// session from the store.
async fn finish(route: &Arc<SockJsRoute>, session: &Arc<Session>) -> Result<(), Error> {
    session.deliver_close(None).await;
    route.sessions.remove(session.id());
    Ok(())
}
