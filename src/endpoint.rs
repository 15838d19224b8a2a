//! The user-facing surface of bidirectional routes: the [`Endpoint`]
//! lifecycle trait, the duplex [`Transport`] handle and the per-route
//! shared [`Bag`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::http::Request;
use crate::sockjs::Session;

/// Builds a fresh endpoint instance per connection or SockJS session.
pub(crate) type EndpointFactory = Arc<dyn Fn() -> Box<dyn Endpoint> + Send + Sync>;

/// A message delivered to [`Endpoint::on_message`]: UTF-8 text for text
/// frames and SockJS messages, raw bytes for binary frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            Payload::Binary(_) => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Text(s) => s.into_bytes(),
            Payload::Binary(b) => b,
        }
    }
}

/// Lifecycle hooks for a bidirectional route.
///
/// One instance exists per connection (native WebSocket) or per session
/// (SockJS). Hooks run on the connection's task and are awaited in
/// order: `on_connect` strictly precedes any `on_message`, messages are
/// delivered FIFO, and `on_close` follows the last message the endpoint
/// will observe.
#[async_trait]
pub trait Endpoint: Send + 'static {
    /// Gate the upgrade. Runs before any session or socket state is
    /// created; returning `false` answers `401 Unauthorized`.
    async fn authorize(&mut self, _request: &Request) -> bool {
        true
    }

    async fn on_connect(&mut self, _conn: &Conn) {}

    async fn on_message(&mut self, _conn: &Conn, _msg: Payload) {}

    async fn on_close(&mut self, _err: Option<&Error>) {}
}

/// What a connected endpoint sees: its transport and the route's bag.
#[derive(Clone)]
pub struct Conn {
    transport: Transport,
    bag: Bag,
}

impl Conn {
    pub(crate) fn new(transport: Transport, bag: Bag) -> Conn {
        Conn { transport, bag }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn bag(&self) -> &Bag {
        &self.bag
    }

    /// Shorthand for `transport().send(..)`.
    pub fn send(&self, msg: impl Into<String>) {
        self.transport.send(msg);
    }

    /// Shorthand for `transport().close()`.
    pub fn close(&self) {
        self.transport.close();
    }
}

pub(crate) enum WsCommand {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Vec<u8>),
    /// Stop the writer task and shut the socket down, without a close
    /// frame. Sent once the receive loop has finished.
    Shutdown,
}

#[derive(Clone)]
pub(crate) struct WsSender {
    pub(crate) tx: mpsc::UnboundedSender<WsCommand>,
    closing: Arc<AtomicBool>,
}

impl WsSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<WsCommand>) -> WsSender {
        WsSender {
            tx,
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
enum TransportKind {
    Ws(WsSender),
    Session(Arc<Session>),
}

/// The outbound half of a duplex route, selected at upgrade time:
/// frames written straight to the socket for native WebSocket, or
/// messages queued into the session for SockJS.
///
/// The handle is cheap to clone and may be stashed (for example in the
/// route [`Bag`]) to push messages from other connections.
#[derive(Clone)]
pub struct Transport {
    kind: TransportKind,
}

impl Transport {
    pub(crate) fn websocket(sender: WsSender) -> Transport {
        Transport {
            kind: TransportKind::Ws(sender),
        }
    }

    pub(crate) fn session(session: Arc<Session>) -> Transport {
        Transport {
            kind: TransportKind::Session(session),
        }
    }

    /// Queue a text message for the peer.
    pub fn send(&self, msg: impl Into<String>) {
        match &self.kind {
            TransportKind::Ws(ws) => {
                let _ = ws.tx.send(WsCommand::Text(msg.into()));
            }
            TransportKind::Session(session) => {
                session.push_outbound(msg.into());
            }
        }
    }

    /// Queue a binary message. SockJS framing is text-only, so on a
    /// session transport the payload is dropped with a warning.
    pub fn send_binary(&self, data: Vec<u8>) {
        match &self.kind {
            TransportKind::Ws(ws) => {
                let _ = ws.tx.send(WsCommand::Binary(data));
            }
            TransportKind::Session(_) => {
                tracing::warn!("binary payload dropped: sockjs transports carry text only");
            }
        }
    }

    /// Close the peer connection: a close frame for WebSocket, the
    /// `c[3000,"Go away!"]` sequence on the next poll for SockJS.
    pub fn close(&self) {
        match &self.kind {
            TransportKind::Ws(ws) => {
                ws.closing.store(true, Ordering::SeqCst);
                let _ = ws.tx.send(WsCommand::Close(Vec::new()));
            }
            TransportKind::Session(session) => {
                session.close();
            }
        }
    }

    pub(crate) fn is_ws_closing(&self) -> bool {
        match &self.kind {
            TransportKind::Ws(ws) => ws.is_closing(),
            TransportKind::Session(_) => false,
        }
    }
}

/// The per-route shared context: a string-keyed map of arbitrary values
/// visible to every endpoint instance of the route.
///
/// Access goes through [`lock`](Bag::lock); the critical section must
/// not be held across await points, which the guard's non-`Send` type
/// enforces naturally.
#[derive(Clone, Default)]
pub struct Bag {
    inner: Arc<Mutex<Registry>>,
}

impl Bag {
    pub fn new() -> Bag {
        Bag::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The typed map held by a [`Bag`].
#[derive(Default)]
pub struct Registry {
    items: HashMap<String, Box<dyn Any + Send>>,
}

impl Registry {
    pub fn insert<T: Send + 'static>(&mut self, key: impl Into<String>, value: T) {
        self.items.insert(key.into(), Box::new(value));
    }

    pub fn get<T: 'static>(&self, key: &str) -> Option<&T> {
        self.items.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn get_mut<T: 'static>(&mut self, key: &str) -> Option<&mut T> {
        self.items.get_mut(key).and_then(|v| v.downcast_mut())
    }

    pub fn remove<T: 'static>(&mut self, key: &str) -> Option<T> {
        let value = self.items.remove(key)?;
        match value.downcast::<T>() {
            Ok(boxed) => Some(*boxed),
            Err(value) => {
                // type mismatch: put it back untouched
                self.items.insert(key.to_owned(), value);
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }
}
