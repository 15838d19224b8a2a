use bytes::{BufMut, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Writes responses to the socket and is restored between keep-alive
/// turns.
///
/// The status and headers are mutable until [`commit`](Self::commit)
/// sends them; changing them afterwards is a programmer error and
/// aborts. Body bytes stream straight to the socket once committed.
pub struct ResponseWriter<W> {
    inner: W,
    status: StatusCode,
    headers: Vec<(String, String)>,
    committed: bool,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    pub fn new(inner: W) -> ResponseWriter<W> {
        ResponseWriter {
            inner,
            status: StatusCode::OK,
            headers: Vec::new(),
            committed: false,
            closed: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        assert!(!self.committed, "status cannot change once committed");
        self.status = status;
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace any existing values for `name`.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove_header(&name);
        self.add_header(name, value);
    }

    /// Append a header without displacing existing values for the same
    /// name (`Set-Cookie` needs this).
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        assert!(!self.committed, "headers are frozen once committed");
        self.headers.push((name.into(), value.into()));
    }

    pub fn add_headers<I, N, V>(&mut self, headers: I)
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self.add_header(name, value);
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        assert!(!self.committed, "headers are frozen once committed");
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Send the status line and headers. Idempotent.
    pub async fn commit(&mut self) -> Result<(), Error> {
        if self.committed {
            return Ok(());
        }
        self.committed = true;
        if self.closed {
            return Ok(());
        }
        let mut head = BytesMut::with_capacity(256);
        head.put_slice(b"HTTP/1.1 ");
        head.put_slice(self.status.as_str().as_bytes());
        head.put_u8(b' ');
        head.put_slice(self.status.canonical_reason().unwrap_or("Unknown").as_bytes());
        head.put_slice(b"\r\n");
        for (name, value) in &self.headers {
            head.put_slice(name.as_bytes());
            head.put_slice(b": ");
            head.put_slice(value.as_bytes());
            head.put_slice(b"\r\n");
        }
        head.put_slice(b"\r\n");
        self.inner.write_all(&head).await?;
        Ok(())
    }

    /// Commit if necessary, then write body bytes.
    pub async fn write_body(&mut self, data: &[u8]) -> Result<(), Error> {
        self.commit().await?;
        if self.closed {
            return Ok(());
        }
        self.inner.write_all(data).await?;
        Ok(())
    }

    /// Commit, then write each chunk in order.
    pub async fn write_lines<I, B>(&mut self, chunks: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        self.commit().await?;
        for chunk in chunks {
            if self.closed {
                return Ok(());
            }
            self.inner.write_all(chunk.as_ref()).await?;
        }
        Ok(())
    }

    /// Flush and shut down the write side. Further writes are ignored.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reset status, headers and the committed flag for the next
    /// keep-alive turn on the same socket.
    pub fn restore(&mut self) {
        self.status = StatusCode::OK;
        self.headers.clear();
        self.committed = false;
    }

    pub(crate) fn into_inner(self) -> W {
        self.inner
    }
}
