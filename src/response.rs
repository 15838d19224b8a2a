//! Response values returned from route callbacks.

use bytes::Bytes;
use http::StatusCode;
use serde::Serialize;

/// A buffered response: status, headers and body, assembled by a
/// callback and written out by the connection supervisor once the
/// callback returns.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Vec<(String, String)>,
    cookies: Vec<String>,
    body: Bytes,
}

/// Attributes for [`Response::set_cookie`].
#[derive(Debug, Clone, Default)]
pub struct CookieOptions {
    pub max_age: Option<u64>,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
}

impl Response {
    /// A `200` response with `Content-Type: text/html; charset=utf-8`.
    pub fn new(body: impl Into<Bytes>) -> Response {
        Response {
            status: StatusCode::OK,
            headers: vec![(
                "Content-Type".to_owned(),
                "text/html; charset=utf-8".to_owned(),
            )],
            cookies: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Response {
        self.status = status;
        self
    }

    pub fn with_content_type(self, content_type: &str) -> Response {
        self.with_header("Content-Type", content_type)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Response {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn set_cookie(&mut self, name: &str, value: &str, opts: CookieOptions) {
        let mut cookie = format!("{}={}", name, value);
        if let Some(max_age) = opts.max_age {
            cookie.push_str(&format!("; Max-Age={}", max_age));
            if max_age == 0 {
                cookie.push_str("; Expires=Thu, 01 Jan 1970 00:00:00 GMT");
            }
        }
        let path = opts.path.as_deref().unwrap_or("/");
        cookie.push_str(&format!("; Path={}", path));
        if let Some(domain) = &opts.domain {
            cookie.push_str(&format!("; Domain={}", domain));
        }
        if opts.secure {
            cookie.push_str("; Secure");
        }
        if opts.http_only {
            cookie.push_str("; HttpOnly");
        }
        self.cookies.push(cookie);
    }

    /// Expire a cookie on the client.
    pub fn delete_cookie(&mut self, name: &str, path: Option<&str>, domain: Option<&str>) {
        self.set_cookie(
            name,
            "",
            CookieOptions {
                max_age: Some(0),
                path: path.map(str::to_owned),
                domain: domain.map(str::to_owned),
                ..CookieOptions::default()
            },
        );
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub(crate) fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub(crate) fn cookies(&self) -> &[String] {
        &self.cookies
    }
}

/// Conversion of callback return values into a [`Response`].
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response {
        self
    }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Response {
        Response::new(Bytes::from_static(self.as_bytes()))
    }
}

impl IntoResponse for String {
    fn into_response(self) -> Response {
        Response::new(Bytes::from(self.into_bytes()))
    }
}

impl IntoResponse for Vec<u8> {
    fn into_response(self) -> Response {
        Response::new(Bytes::from(self))
    }
}

impl IntoResponse for Bytes {
    fn into_response(self) -> Response {
        Response::new(self)
    }
}

impl<T: IntoResponse> IntoResponse for (StatusCode, T) {
    fn into_response(self) -> Response {
        self.1.into_response().with_status(self.0)
    }
}

/// JSON response body: serializes the wrapped value and sets
/// `Content-Type: application/json`.
///
/// A serialization failure becomes a `500` carrying the serializer's
/// message, so callbacks stay infallible.
#[derive(Debug, Clone, Copy)]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Response {
        match serde_json::to_vec(&self.0) {
            Ok(body) => Response::new(body).with_content_type("application/json"),
            Err(err) => Response::new(err.to_string())
                .with_status(StatusCode::INTERNAL_SERVER_ERROR)
                .with_content_type("text/plain"),
        }
    }
}
