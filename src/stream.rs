//! Buffered socket reading with idle-deadline accounting.
//!
//! Every read that actually touches the socket rearms the connection's
//! idle deadline, so a slowly trickling peer stays alive while a silent
//! one is cut off. Clean EOF is reported as `None` rather than an error.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout, Instant};

use crate::error::Error;

/// Shared record of when the last byte arrived on a connection.
///
/// Cloned into the WebSocket ping task so it can tell how long the peer
/// has been quiet without owning the reader.
#[derive(Clone)]
pub(crate) struct Activity(Arc<Mutex<Instant>>);

impl Activity {
    fn new() -> Activity {
        Activity(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last byte was received.
    pub(crate) fn idle_for(&self) -> Duration {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

pub(crate) struct SocketReader<R> {
    inner: R,
    buf: BytesMut,
    idle: Option<Duration>,
    eof: bool,
    activity: Activity,
}

impl<R: AsyncRead + Unpin> SocketReader<R> {
    pub(crate) fn new(inner: R) -> SocketReader<R> {
        SocketReader {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            idle: None,
            eof: false,
            activity: Activity::new(),
        }
    }

    /// Arm (or disarm) the idle deadline applied while waiting on the
    /// socket. Expiry surfaces as [`Error::IdleTimeout`].
    pub(crate) fn set_idle(&mut self, idle: Option<Duration>) {
        self.idle = idle;
    }

    pub(crate) fn activity(&self) -> Activity {
        self.activity.clone()
    }

    /// Pull more bytes from the socket into the buffer. Returns `false`
    /// once the peer has shut down its write side.
    async fn fill(&mut self) -> Result<bool, Error> {
        if self.eof {
            return Ok(false);
        }
        let n = match self.idle {
            Some(deadline) => timeout(deadline, self.inner.read_buf(&mut self.buf))
                .await
                .map_err(|_| Error::IdleTimeout)??,
            None => self.inner.read_buf(&mut self.buf).await?,
        };
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.activity.touch();
        Ok(true)
    }

    /// Read one line, stripping the trailing `\r\n` (or bare `\n`).
    ///
    /// `None` means the stream ended before a full line arrived; partial
    /// input is discarded, never returned.
    pub(crate) async fn read_line(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(Some(line.freeze()));
            }
            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    /// Read exactly `n` bytes, or `None` if the stream ends first.
    pub(crate) async fn read_exact(&mut self, n: usize) -> Result<Option<Bytes>, Error> {
        while self.buf.len() < n {
            if !self.fill().await? {
                return Ok(None);
            }
        }
        Ok(Some(self.buf.split_to(n).freeze()))
    }

    /// Watch for the peer abandoning the connection while a response
    /// is parked on it. Completes on EOF, the idle deadline, or a
    /// transport error; pipelined bytes instead park the watch, since
    /// that peer is clearly alive.
    pub(crate) async fn wait_disconnect(&mut self) {
        loop {
            if !self.buf.is_empty() {
                std::future::pending::<()>().await;
            }
            match self.fill().await {
                Ok(true) => continue,
                Ok(false) => return,
                Err(_) => return,
            }
        }
    }

    /// Read up to `n` bytes, stopping early only at EOF. Used for
    /// `Content-Length`-bounded bodies where a short peer write should
    /// still deliver what arrived.
    pub(crate) async fn read_up_to(&mut self, n: usize) -> Result<Bytes, Error> {
        while self.buf.len() < n {
            if !self.fill().await? {
                break;
            }
        }
        let take = n.min(self.buf.len());
        Ok(self.buf.split_to(take).freeze())
    }
}
