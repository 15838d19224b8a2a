use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use http::{Method, Version};

use crate::http::Headers;
use crate::util::MultiMap;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// A parsed HTTP request.
///
/// The request line, headers and body are fixed once parsing completes.
/// Query parameters, cookies and the form body are derived lazily and
/// cached, so repeated access does not re-parse.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: String,
    path: String,
    query: String,
    version: Version,
    headers: Headers,
    peer: SocketAddr,
    secure: bool,
    body: Bytes,
    query_cache: Option<MultiMap>,
    cookie_cache: Option<HashMap<String, String>>,
    form_cache: Option<MultiMap>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: Method,
        uri: String,
        version: Version,
        headers: Headers,
        peer: SocketAddr,
        secure: bool,
        body: Bytes,
    ) -> Request {
        let (raw_path, query) = match uri.split_once('?') {
            Some((p, q)) => (p.to_owned(), q.to_owned()),
            None => (uri.clone(), String::new()),
        };
        let path = percent_encoding::percent_decode_str(&raw_path)
            .decode_utf8_lossy()
            .into_owned();
        Request {
            method,
            uri,
            path,
            query,
            version,
            headers,
            peer,
            secure,
            body,
            query_cache: None,
            cookie_cache: None,
            form_cache: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The raw request target as received.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The percent-decoded path component.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string, without the leading `?`.
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of the named header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// The request body, bounded by `Content-Length` at parse time.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Decoded query parameters. Blank values (`?flag`) are kept.
    pub fn query_pairs(&mut self) -> &MultiMap {
        if self.query_cache.is_none() {
            let pairs: Vec<(String, String)> =
                serde_urlencoded::from_str(&self.query).unwrap_or_default();
            self.query_cache = Some(pairs.into_iter().collect());
        }
        self.query_cache.as_ref().unwrap()
    }

    /// Cookies from the `Cookie` header.
    pub fn cookies(&mut self) -> &HashMap<String, String> {
        if self.cookie_cache.is_none() {
            let mut cookies = HashMap::new();
            if let Some(raw) = self.headers.get("cookie") {
                for piece in raw.split(';') {
                    if let Some((name, value)) = piece.split_once('=') {
                        cookies.insert(name.trim().to_owned(), value.trim().to_owned());
                    }
                }
            }
            self.cookie_cache = Some(cookies);
        }
        self.cookie_cache.as_ref().unwrap()
    }

    /// The form body, parsed at most once and only when the request
    /// carries `Content-Type: application/x-www-form-urlencoded`.
    pub fn form(&mut self) -> &MultiMap {
        if self.form_cache.is_none() {
            let is_form = self
                .headers
                .get("content-type")
                .map(|ct| ct.eq_ignore_ascii_case(FORM_URLENCODED))
                .unwrap_or(false);
            let map = if is_form {
                let pairs: Vec<(String, String)> =
                    serde_urlencoded::from_bytes(&self.body).unwrap_or_default();
                pairs.into_iter().collect()
            } else {
                MultiMap::new()
            };
            self.form_cache = Some(map);
        }
        self.form_cache.as_ref().unwrap()
    }
}
