//! Adapts route callbacks to the response writer.

use tokio::io::AsyncWrite;

use crate::error::Error;
use crate::http::{Request, ResponseWriter};
use crate::response::Response;
use crate::routing::{CallbackFn, PathParams};

/// Run a callback route and write its response. The writer is fully
/// committed and flushed before this returns, so the supervisor never
/// re-enters a handler mid-response.
pub(crate) async fn respond<W>(
    callback: &CallbackFn,
    req: Request,
    params: PathParams,
    writer: &mut ResponseWriter<W>,
    keep_alive: bool,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let response = callback(req, params).await;
    write_response(writer, &response, keep_alive).await
}

pub(crate) async fn write_response<W>(
    writer: &mut ResponseWriter<W>,
    response: &Response,
    keep_alive: bool,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    writer.set_status(response.status());
    for (name, value) in response.headers() {
        writer.set_header(name.clone(), value.clone());
    }
    if writer.header("content-length").is_none() {
        writer.set_header("Content-Length", response.body().len().to_string());
    }
    for cookie in response.cookies() {
        writer.add_header("Set-Cookie", cookie.clone());
    }
    if keep_alive {
        writer.set_header("Connection", "Keep-Alive");
    }
    writer.write_body(response.body()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::IntoResponse;
    use http::StatusCode;

    #[tokio::test]
    async fn responses_carry_length_and_keep_alive() {
        let response = "hi".into_response();
        let mut writer = ResponseWriter::new(Vec::new());
        write_response(&mut writer, &response, true).await.unwrap();
        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 2\r\n"));
        assert!(out.contains("Connection: Keep-Alive\r\n"));
        assert!(out.ends_with("\r\n\r\nhi"));
    }

    #[tokio::test]
    async fn explicit_status_and_headers_survive() {
        let response = (StatusCode::CREATED, "made".to_owned())
            .into_response()
            .with_content_type("text/plain");
        let mut writer = ResponseWriter::new(Vec::new());
        write_response(&mut writer, &response, false).await.unwrap();
        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert!(out.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(out.contains("Content-Type: text/plain\r\n"));
        assert!(!out.contains("Connection:"));
    }
}
