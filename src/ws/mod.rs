//! WebSocket connection handling: handshake, the frame writer task and
//! the receive loop driving endpoint lifecycle hooks.

mod frame;
mod handshake;

pub use frame::{Frame, FrameBuilder, Message, OpCode};

pub(crate) use frame::MessageParser;

use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::endpoint::{Bag, Conn, EndpointFactory, Payload, Transport, WsCommand, WsSender};
use crate::error::Error;
use crate::http::{Request, ResponseWriter};
use crate::stream::SocketReader;

/// What became of a request routed to a WebSocket endpoint.
pub(crate) enum WsOutcome<R, W> {
    /// The socket was upgraded and the connection has finished.
    Done,
    /// No upgrade happened (401/400 was written); the supervisor gets
    /// its halves back and keep-alive rules apply as usual.
    Declined(SocketReader<R>, ResponseWriter<W>),
}

/// Serve a request routed to a WebSocket endpoint.
///
/// On a successful handshake this takes ownership of the socket: the
/// write half moves to a frame writer task, the read half stays here
/// for the receive loop, and the function only returns once the
/// connection is finished.
pub(crate) async fn serve<R, W>(
    req: Request,
    mut reader: SocketReader<R>,
    mut writer: ResponseWriter<W>,
    factory: &EndpointFactory,
    bag: Bag,
    keep_alive: Option<Duration>,
) -> Result<WsOutcome<R, W>, Error>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut endpoint = factory();

    if !endpoint.authorize(&req).await {
        writer.set_status(StatusCode::UNAUTHORIZED);
        writer.set_header("Content-Length", "0");
        writer.write_body(b"").await?;
        return Ok(WsOutcome::Declined(reader, writer));
    }

    let accept = match handshake::check(&req) {
        Ok(accept) => accept,
        Err(reason) => {
            tracing::debug!(%reason, "rejecting websocket upgrade");
            writer.set_status(StatusCode::BAD_REQUEST);
            writer.set_header("Content-Length", "0");
            writer.write_body(b"").await?;
            return Ok(WsOutcome::Declined(reader, writer));
        }
    };

    writer.set_status(StatusCode::SWITCHING_PROTOCOLS);
    writer.add_headers(vec![
        ("Upgrade", "websocket".to_owned()),
        ("Connection", "Upgrade".to_owned()),
        ("Sec-WebSocket-Accept", accept),
    ]);
    writer.write_body(b"").await?;
    tracing::debug!(path = req.path(), "switched protocols to websocket");

    // The write half now belongs to the frame writer task; the HTTP
    // codec is done with this socket.
    let socket = writer.into_inner();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(socket, rx));

    let conn = Conn::new(Transport::websocket(WsSender::new(tx.clone())), bag);

    // From here on idleness means "send a ping", not "close".
    reader.set_idle(None);
    if let Some(interval) = keep_alive {
        let activity = reader.activity();
        let ping_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                let idle = activity.idle_for();
                if idle >= interval {
                    if ping_tx.send(WsCommand::Ping(Vec::new())).is_err() {
                        break;
                    }
                    tokio::time::sleep(interval).await;
                } else {
                    tokio::time::sleep(interval - idle).await;
                }
            }
        });
    }

    endpoint.on_connect(&conn).await;

    let mut parser = MessageParser::new();
    let result = loop {
        match parser.next_message(&mut reader).await {
            Ok(None) => break Ok(()),
            Ok(Some(Message::Close(_))) => {
                if !conn.transport().is_ws_closing() {
                    let _ = tx.send(WsCommand::Close(Vec::new()));
                }
                break Ok(());
            }
            Ok(Some(Message::Ping(payload))) => {
                let _ = tx.send(WsCommand::Pong(payload));
            }
            Ok(Some(Message::Pong(_))) => {}
            Ok(Some(Message::Text(text))) => {
                endpoint.on_message(&conn, Payload::Text(text)).await;
            }
            Ok(Some(Message::Binary(data))) => {
                endpoint.on_message(&conn, Payload::Binary(data)).await;
            }
            Err(err) => break Err(err),
        }
    };

    // Stop the writer even if the endpoint stashed a transport clone.
    let _ = tx.send(WsCommand::Shutdown);
    drop(tx);
    let _ = writer_task.await;

    match result {
        Ok(()) => {
            endpoint.on_close(None).await;
            Ok(WsOutcome::Done)
        }
        Err(err) => {
            endpoint.on_close(Some(&err)).await;
            match err {
                Error::Format(reason) => {
                    // protocol violation: socket closed without a close frame
                    tracing::debug!(%reason, "closing websocket after framing violation");
                    Ok(WsOutcome::Done)
                }
                other => Err(other),
            }
        }
    }
}

async fn write_loop<W>(mut socket: W, mut rx: mpsc::UnboundedReceiver<WsCommand>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(cmd) = rx.recv().await {
        let wire = match cmd {
            WsCommand::Text(text) => FrameBuilder::text(&text),
            WsCommand::Binary(data) => FrameBuilder::binary(&data),
            WsCommand::Ping(payload) => FrameBuilder::ping(&payload),
            WsCommand::Pong(payload) => FrameBuilder::pong(&payload),
            WsCommand::Close(body) => {
                let _ = socket.write_all(&FrameBuilder::close_with_body(&body)).await;
                break;
            }
            WsCommand::Shutdown => break,
        };
        if socket.write_all(&wire).await.is_err() {
            break;
        }
    }
    let _ = socket.shutdown().await;
}
