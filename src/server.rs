//! The application surface and the per-connection supervisor.
//!
//! An [`App`] collects routes and configuration, binds a listener and
//! runs one cooperative task per accepted connection. Within a
//! connection requests are served strictly in order; a successful
//! WebSocket upgrade moves socket ownership to the WebSocket handler
//! and the HTTP loop never resumes on that socket.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use http::{StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::endpoint::{Bag, Endpoint, EndpointFactory};
use crate::error::Error;
use crate::handler;
use crate::http::{Request, ResponseWriter};
use crate::response::IntoResponse;
use crate::routing::{MethodSet, PathParams, PathPattern, Route, RouteKind, Router};
use crate::sockjs::{self, SockJsRoute, Target};
use crate::stream::SocketReader;
use crate::ws::{self, WsOutcome};

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(20);

/// Listener and connection settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Idle deadline and keep-alive window. `None` closes the
    /// connection after every response.
    pub keep_alive: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            host: "0.0.0.0".to_owned(),
            port: 3000,
            keep_alive: Some(DEFAULT_KEEP_ALIVE),
        }
    }
}

/// Builder for a server: routes, endpoints and configuration.
#[derive(Default)]
pub struct App {
    router: Router,
    config: ServerConfig,
}

impl App {
    pub fn new() -> App {
        App {
            router: Router::new(),
            config: ServerConfig::default(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> App {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> App {
        self.config.port = port;
        self
    }

    /// Set the keep-alive/idle window; `None` disables keep-alive.
    pub fn keep_alive(mut self, keep_alive: Option<Duration>) -> App {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Register a request/response callback for a path pattern and a
    /// method list (`"*"` matches any method).
    pub fn route<F, Fut, T>(mut self, pattern: &str, methods: &[&str], callback: F) -> App
    where
        F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: IntoResponse + Send + 'static,
    {
        let callback = Arc::new(move |req: Request, params: PathParams| {
            let fut = callback(req, params);
            async move { fut.await.into_response() }.boxed()
        });
        self.router.push(Route {
            pattern: PathPattern::new(pattern),
            methods: MethodSet::from_strs(methods),
            kind: RouteKind::Callback(callback),
            bag: Bag::new(),
        });
        self
    }

    /// Register a native WebSocket endpoint. `factory` builds one
    /// endpoint instance per connection.
    pub fn endpoint<E, F>(mut self, pattern: &str, factory: F) -> App
    where
        E: Endpoint,
        F: Fn() -> E + Send + Sync + 'static,
    {
        let factory: EndpointFactory =
            Arc::new(move || -> Box<dyn Endpoint> { Box::new(factory()) });
        self.router.push(Route {
            pattern: PathPattern::new(pattern),
            methods: MethodSet::any(),
            kind: RouteKind::WebSocket { factory },
            bag: Bag::new(),
        });
        self
    }

    /// Register a SockJS endpoint under a prefix. The prefix absorbs
    /// `/info`, the iframe page, `/websocket` and the whole
    /// `/<server>/<session>/<transport>` tree.
    pub fn sockjs<E, F>(self, pattern: &str, factory: F) -> App
    where
        E: Endpoint,
        F: Fn() -> E + Send + Sync + 'static,
    {
        self.sockjs_inner(pattern, factory, true)
    }

    /// Like [`sockjs`](Self::sockjs), but refuses the websocket
    /// transport; `/info` reports `websocket: false`.
    pub fn sockjs_no_websocket<E, F>(self, pattern: &str, factory: F) -> App
    where
        E: Endpoint,
        F: Fn() -> E + Send + Sync + 'static,
    {
        self.sockjs_inner(pattern, factory, false)
    }

    fn sockjs_inner<E, F>(mut self, pattern: &str, factory: F, websocket: bool) -> App
    where
        E: Endpoint,
        F: Fn() -> E + Send + Sync + 'static,
    {
        let factory: EndpointFactory =
            Arc::new(move || -> Box<dyn Endpoint> { Box::new(factory()) });
        let base = pattern.strip_suffix('/').unwrap_or(pattern);
        let full = format!("{}{{{}:.*}}", base, sockjs::TAIL_PARAM);
        self.router.push(Route {
            pattern: PathPattern::new(&full),
            methods: MethodSet::any(),
            kind: RouteKind::SockJs(Arc::new(SockJsRoute::new(factory, websocket))),
            bag: Bag::new(),
        });
        self
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn serve(self) -> Result<(), Error> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        tracing::info!(host = %self.config.host, port = self.config.port, "listening");
        self.serve_listener(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve_listener(self, listener: TcpListener) -> Result<(), Error> {
        let shared = Arc::new(Shared {
            router: self.router,
            keep_alive: self.config.keep_alive,
        });
        loop {
            let (socket, peer) = listener.accept().await?;
            let shared = shared.clone();
            tokio::spawn(async move {
                handle_socket(socket, peer, shared).await;
            });
        }
    }
}

pub(crate) struct Shared {
    pub(crate) router: Router,
    pub(crate) keep_alive: Option<Duration>,
}

/// Run one connection to completion, isolating failures: errors are
/// logged, and a panicking handler takes down only its own connection.
pub(crate) async fn handle_socket<S>(socket: S, peer: SocketAddr, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    match AssertUnwindSafe(serve_connection(socket, peer, shared))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::debug!(%peer, error = %err, "connection closed on error");
        }
        Err(_) => {
            tracing::error!(%peer, "handler panicked; dropping the connection");
        }
    }
}

pub(crate) async fn serve_connection<S>(
    socket: S,
    peer: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(socket);
    let mut reader = SocketReader::new(read_half);
    reader.set_idle(shared.keep_alive);
    let mut writer = ResponseWriter::new(write_half);

    loop {
        let mut req = match crate::http::parse(&mut reader, peer, false).await {
            Ok(Some(req)) => req,
            // clean EOF between requests
            Ok(None) => return Ok(()),
            Err(Error::IdleTimeout) => {
                tracing::debug!(%peer, "closing idle connection");
                let _ = writer.close().await;
                return Ok(());
            }
            Err(err @ Error::BadRequest(_)) => {
                bad_request(&mut writer, &err).await?;
                writer.close().await?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let keep = keep_alive_after(&req, shared.keep_alive);

        match shared.router.dispatch(req.method(), req.path()) {
            None => not_found(&mut writer).await?,
            Some((route, params)) => match &route.kind {
                RouteKind::Callback(callback) => {
                    handler::respond(callback, req, params, &mut writer, keep).await?;
                }
                RouteKind::WebSocket { factory } => {
                    let served = ws::serve(
                        req,
                        reader,
                        writer,
                        factory,
                        route.bag.clone(),
                        shared.keep_alive,
                    )
                    .await?;
                    match served {
                        WsOutcome::Done => return Ok(()),
                        WsOutcome::Declined(r, w) => {
                            reader = r;
                            writer = w;
                        }
                    }
                }
                RouteKind::SockJs(sockjs_route) => {
                    let tail = sockjs::tail(&params).to_owned();
                    match sockjs::classify(sockjs_route, &tail) {
                        Target::Websocket => {
                            let served = ws::serve(
                                req,
                                reader,
                                writer,
                                &sockjs_route.factory,
                                route.bag.clone(),
                                shared.keep_alive,
                            )
                            .await?;
                            match served {
                                WsOutcome::Done => return Ok(()),
                                WsOutcome::Declined(r, w) => {
                                    reader = r;
                                    writer = w;
                                }
                            }
                        }
                        target => {
                            sockjs::serve(
                                sockjs_route,
                                &route.bag,
                                target,
                                &mut req,
                                &mut reader,
                                &mut writer,
                            )
                            .await?;
                        }
                    }
                }
            },
        }

        if writer.is_closed() {
            return Ok(());
        }
        if !keep {
            writer.close().await?;
            return Ok(());
        }
        writer.restore();
    }
}

/// The keep-alive decision for the turn that just completed.
fn keep_alive_after(req: &Request, keep_alive: Option<Duration>) -> bool {
    if keep_alive.is_none() {
        return false;
    }
    let mut keep = req.version() != Version::HTTP_10;
    if let Some(connection) = req.header("connection") {
        let connection = connection.to_ascii_lowercase();
        if connection == "keep-alive" {
            keep = true;
        } else if connection == "close" {
            keep = false;
        }
    }
    keep
}

async fn not_found<W>(writer: &mut ResponseWriter<W>) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let body = b"Not found";
    writer.set_status(StatusCode::NOT_FOUND);
    writer.add_headers(vec![
        ("Content-Type", "text/plain".to_owned()),
        ("Content-Length", body.len().to_string()),
    ]);
    writer.write_body(body).await
}

async fn bad_request<W>(writer: &mut ResponseWriter<W>, err: &Error) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let body = err.to_string();
    writer.set_status(StatusCode::BAD_REQUEST);
    writer.add_headers(vec![
        ("Content-Type", "text/plain".to_owned()),
        ("Content-Length", body.len().to_string()),
    ]);
    writer.write_body(body.as_bytes()).await
}
