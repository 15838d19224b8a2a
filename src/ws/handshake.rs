//! RFC 6455 opening handshake.

use sha1::{Digest, Sha1};

use crate::http::Request;

const MAGIC: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Validate the upgrade request and derive the `Sec-WebSocket-Accept`
/// value. `Err` carries the reason a `400 Bad Request` is due.
pub(crate) fn check(req: &Request) -> Result<String, &'static str> {
    let upgrade_ok = req
        .header("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !upgrade_ok {
        return Err("`Upgrade` header did not include 'websocket'");
    }

    let connection_ok = req
        .header("connection")
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    if !connection_ok {
        return Err("`Connection` header did not include 'upgrade'");
    }

    if req.header("sec-websocket-version") != Some("13") {
        return Err("`Sec-WebSocket-Version` header did not include '13'");
    }

    match req.header("sec-websocket-key") {
        Some(key) if !key.is_empty() => Ok(accept_key(key)),
        _ => Err("`Sec-WebSocket-Key` header missing"),
    }
}

pub(crate) fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::default();
    sha1.update(key.as_bytes());
    sha1.update(MAGIC);
    base64::encode(sha1.finalize())
}
