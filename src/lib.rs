//! inlet is a small tokio web server with first-class bidirectional
//! routes: it terminates HTTP/1.x itself, speaks RFC 6455 WebSocket,
//! and emulates WebSocket semantics over SockJS's HTTP transports
//! (xhr polling and streaming, eventsource, htmlfile, jsonp).
//!
//! Applications register plain request/response callbacks next to
//! long-lived endpoints; an endpoint sees the same [`Endpoint`]
//! lifecycle regardless of whether the peer arrived over a real
//! WebSocket or a sequence of SockJS polls.
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use inlet::{App, Conn, Endpoint, Payload};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Endpoint for Echo {
//!     async fn on_message(&mut self, conn: &Conn, msg: Payload) {
//!         if let Payload::Text(text) = msg {
//!             conn.send(text);
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     App::new()
//!         .route("/", &["GET"], |_req, _params| async { "<h1>It works!</h1>" })
//!         .endpoint("/echo", || Echo)
//!         .sockjs("/echo-sockjs", || Echo)
//!         .port(3000)
//!         .serve()
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! Endpoints of one route share a [`Bag`], a typed map for cross-
//! connection state such as a roster of connected peers; clone a
//! [`Transport`] into it to push messages to other connections.

pub mod endpoint;
pub mod error;
pub mod http;
pub mod response;
pub mod routing;
pub mod server;
pub mod ws;

mod handler;
mod sockjs;
mod stream;
mod util;

pub use crate::endpoint::{Bag, Conn, Endpoint, Payload, Registry, Transport};
pub use crate::error::Error;
pub use crate::http::{Headers, Request, ResponseWriter};
pub use crate::response::{CookieOptions, IntoResponse, Json, Response};
pub use crate::routing::PathParams;
pub use crate::server::{App, ServerConfig};
pub use crate::util::MultiMap;

// re-exported so endpoint implementations don't need their own copy
pub use async_trait::async_trait;
