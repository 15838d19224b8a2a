use std::net::SocketAddr;

use http::{Method, Version};
use tokio::io::AsyncRead;

use crate::error::Error;
use crate::http::{Headers, Request};
use crate::stream::SocketReader;

/// Parse one request from the stream.
///
/// `Ok(None)` means the peer closed the connection cleanly before a
/// complete header block arrived; a partial request is never produced.
/// Malformed input raises [`Error::BadRequest`].
///
/// The body is consumed here, bounded by `Content-Length`: a missing or
/// non-integer value counts as zero, so nothing is left on the stream
/// for the next keep-alive turn to drain.
pub(crate) async fn parse<R>(
    reader: &mut SocketReader<R>,
    peer: SocketAddr,
    secure: bool,
) -> Result<Option<Request>, Error>
where
    R: AsyncRead + Unpin,
{
    let line = match reader.read_line().await? {
        Some(line) => line,
        None => return Ok(None),
    };
    let line = String::from_utf8_lossy(&line).into_owned();

    let parts: Vec<&str> = line.split(' ').collect();
    let (method, uri, version) = match parts.as_slice() {
        [m, u, v] if !m.is_empty() && !u.is_empty() => (*m, *u, *v),
        _ => return Err(Error::bad_request(format!("malformed request line {:?}", line))),
    };

    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| Error::bad_request(format!("invalid method {:?}", method)))?;

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => {
            return Err(Error::bad_request(format!(
                "unsupported http version {:?}",
                other
            )))
        }
    };

    let mut headers = Headers::new();
    loop {
        let line = match reader.read_line().await? {
            Some(line) => line,
            // EOF before the blank line that ends the header block
            None => return Ok(None),
        };
        if line.is_empty() {
            break;
        }
        let line = String::from_utf8_lossy(&line).into_owned();
        if line.starts_with(' ') || line.starts_with('\t') {
            if !headers.join_continuation(line.trim()) {
                return Err(Error::bad_request(
                    "continuation line before any header".to_owned(),
                ));
            }
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) => headers.append(name.trim(), value.trim()),
            None => {
                return Err(Error::bad_request(format!("malformed header line {:?}", line)));
            }
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let body = reader.read_up_to(content_length).await?;

    Ok(Some(Request::new(
        method,
        uri.to_owned(),
        version,
        headers,
        peer,
        secure,
        body,
    )))
}
