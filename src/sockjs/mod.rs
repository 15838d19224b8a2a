//! The SockJS layer: one registered prefix absorbs the welcome page,
//! `/info`, the iframe page, the native `/websocket` upgrade and the
//! `/<server>/<session>/<transport>` tree.

mod session;
mod transports;

pub(crate) use session::{AttachGuard, Session, SessionStore};

use std::sync::Arc;

use http::{Method, StatusCode};
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::endpoint::{Bag, Conn, EndpointFactory, Transport};
use crate::error::Error;
use crate::http::{Request, ResponseWriter};
use crate::routing::PathParams;
use crate::stream::SocketReader;

/// Capture name the router uses for the sub-path under a SockJS
/// prefix.
pub(crate) const TAIL_PARAM: &str = "sockjs_tail";

pub(crate) const CLOSE_GO_AWAY: &str = "c[3000,\"Go away!\"]";
pub(crate) const CLOSE_STILL_OPEN: &str = "c[2010,\"Another connection still open\"]";
pub(crate) const CLOSE_INTERRUPTED: &str = "c[1002,\"Connection interrupted\"]";

pub(crate) struct SockJsRoute {
    pub(crate) factory: EndpointFactory,
    pub(crate) websocket_enabled: bool,
    pub(crate) sessions: SessionStore,
    iframe_re: Regex,
}

impl SockJsRoute {
    pub(crate) fn new(factory: EndpointFactory, websocket_enabled: bool) -> SockJsRoute {
        SockJsRoute {
            factory,
            websocket_enabled,
            sessions: SessionStore::new(),
            iframe_re: Regex::new(r"^/iframe[0-9\-.a-z_]*\.html$").expect("iframe path regex"),
        }
    }
}

/// The SockJS endpoints reachable under a registered prefix.
#[derive(Debug, PartialEq)]
pub(crate) enum Target {
    Welcome,
    Info,
    Iframe,
    /// Native WebSocket upgrade; the supervisor hands the socket over.
    Websocket,
    Transport {
        session_id: String,
        kind: TransportKind,
    },
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportKind {
    Xhr,
    XhrSend,
    XhrStreaming,
    EventSource,
    HtmlFile,
    Jsonp,
    JsonpSend,
}

impl TransportKind {
    fn from_name(name: &str) -> Option<TransportKind> {
        match name {
            "xhr" => Some(TransportKind::Xhr),
            "xhr_send" => Some(TransportKind::XhrSend),
            "xhr_streaming" => Some(TransportKind::XhrStreaming),
            "eventsource" => Some(TransportKind::EventSource),
            "htmlfile" => Some(TransportKind::HtmlFile),
            "jsonp" => Some(TransportKind::Jsonp),
            "jsonp_send" => Some(TransportKind::JsonpSend),
            _ => None,
        }
    }

    fn method(self) -> Method {
        match self {
            TransportKind::HtmlFile | TransportKind::Jsonp => Method::GET,
            _ => Method::POST,
        }
    }

    /// Whether an unknown session id creates a session on this
    /// transport.
    fn initiates_session(self) -> bool {
        !matches!(self, TransportKind::XhrSend | TransportKind::JsonpSend)
    }

    fn allow_header(self) -> &'static str {
        if self.method() == Method::GET {
            "OPTIONS, GET"
        } else {
            "OPTIONS, POST"
        }
    }
}

/// Decide what the sub-path under the prefix addresses.
pub(crate) fn classify(route: &SockJsRoute, tail: &str) -> Target {
    if tail.is_empty() || tail == "/" {
        return Target::Welcome;
    }
    if tail == "/info" {
        return Target::Info;
    }
    if route.iframe_re.is_match(tail) {
        return Target::Iframe;
    }
    if tail == "/websocket" {
        return Target::Websocket;
    }

    let parts: Vec<&str> = match tail.strip_prefix('/') {
        Some(rest) => rest.split('/').collect(),
        None => return Target::NotFound,
    };
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Target::NotFound;
    }
    let (server, session_id, transport) = (parts[0], parts[1], parts[2]);
    if server.contains('.') || session_id.contains('.') {
        return Target::NotFound;
    }
    if transport == "websocket" {
        return if route.websocket_enabled {
            Target::Websocket
        } else {
            Target::NotFound
        };
    }
    match TransportKind::from_name(transport) {
        Some(kind) => Target::Transport {
            session_id: session_id.to_owned(),
            kind,
        },
        None => Target::NotFound,
    }
}

pub(crate) fn tail<'a>(params: &'a PathParams) -> &'a str {
    params.get(TAIL_PARAM).map(String::as_str).unwrap_or("")
}

/// Serve every SockJS target except the native WebSocket upgrade,
/// which the connection supervisor handles because it moves socket
/// ownership. The reader is only watched, never consumed: a poll
/// parked on the session waiter must notice its peer going away so
/// the session detaches.
pub(crate) async fn serve<R, W>(
    route: &Arc<SockJsRoute>,
    bag: &Bag,
    target: Target,
    req: &mut Request,
    reader: &mut SocketReader<R>,
    writer: &mut ResponseWriter<W>,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match target {
        Target::Welcome => transports::welcome(writer).await,
        Target::Info => transports::info(route, req, writer).await,
        Target::Iframe => transports::iframe(req, writer).await,
        Target::NotFound | Target::Websocket => transports::not_found(writer).await,
        Target::Transport { session_id, kind } => {
            handle_transport(route, bag, session_id, kind, req, reader, writer).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_transport<R, W>(
    route: &Arc<SockJsRoute>,
    bag: &Bag,
    session_id: String,
    kind: TransportKind,
    req: &mut Request,
    reader: &mut SocketReader<R>,
    writer: &mut ResponseWriter<W>,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if req.method() == Method::OPTIONS {
        return transports::preflight(req, writer, kind.allow_header()).await;
    }
    if req.method() != kind.method() {
        return transports::not_allowed(writer, kind.allow_header()).await;
    }

    let session = match route.sessions.get(&session_id) {
        None => {
            if !kind.initiates_session() {
                return transports::not_found(writer).await;
            }
            // authorize on the endpoint before any session exists
            let mut endpoint = (route.factory)();
            if !endpoint.authorize(req).await {
                writer.set_status(StatusCode::UNAUTHORIZED);
                writer.set_header("Content-Length", "0");
                return writer.write_body(b"").await;
            }
            let session = Session::new(session_id.clone(), endpoint);
            session.state().attached = true;
            route.sessions.insert(session_id, session.clone());
            session
        }
        Some(session) => {
            if kind.initiates_session() {
                enum Disposition {
                    Terminated,
                    AlreadyAttached,
                    Ok,
                }
                let disposition = {
                    let mut state = session.state();
                    if state.terminated {
                        Disposition::Terminated
                    } else if state.attached {
                        // a poll already holds the stream: tear it down and
                        // refuse this one
                        state.terminated = true;
                        Disposition::AlreadyAttached
                    } else {
                        state.attached = true;
                        Disposition::Ok
                    }
                };
                match disposition {
                    Disposition::Terminated => {
                        return transports::standalone_close(kind, req, writer, CLOSE_INTERRUPTED)
                            .await;
                    }
                    Disposition::AlreadyAttached => {
                        session.notify();
                        return transports::standalone_close(kind, req, writer, CLOSE_INTERRUPTED)
                            .await;
                    }
                    Disposition::Ok => {}
                }
            }
            session
        }
    };

    let conn = Conn::new(Transport::session(session.clone()), bag.clone());

    match kind {
        TransportKind::XhrSend | TransportKind::JsonpSend => {
            transports::receive(kind, req, writer, &session, &conn).await
        }
        TransportKind::Xhr => {
            let _guard = AttachGuard::new(session.clone());
            transports::xhr(route, req, reader, writer, &session, &conn).await
        }
        TransportKind::Jsonp => {
            let _guard = AttachGuard::new(session.clone());
            transports::jsonp(route, req, reader, writer, &session, &conn).await
        }
        TransportKind::XhrStreaming | TransportKind::EventSource | TransportKind::HtmlFile => {
            let _guard = AttachGuard::new(session.clone());
            transports::streaming(kind, route, req, reader, writer, &session, &conn).await
        }
    }
}
