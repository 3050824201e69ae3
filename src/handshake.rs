//! WebSocket opening handshake (client side)
//!
//! This module builds the HTTP/1.1 upgrade request and parses the server's
//! response:
//! - `build_request` writes the GET request with the upgrade headers
//! - `parse_response` accepts only a complete `101` carrying a
//!   `Sec-WebSocket-Accept` value
//! - `generate_accept_key` / `validate_accept_key` implement the
//!   Base64(SHA-1(key + GUID)) check

use std::fmt;

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::WS_GUID;
use crate::error::{Error, Result};
use crate::mask::generate_mask;

/// Maximum HTTP header size accepted in the upgrade response
pub const MAX_HEADER_SIZE: usize = 8192;

/// URL scheme of a WebSocket endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain `ws://`
    Ws,
    /// TLS `wss://`
    Wss,
}

impl Scheme {
    /// Parse `ws` or `wss` (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("ws") {
            Some(Scheme::Ws)
        } else if s.eq_ignore_ascii_case("wss") {
            Some(Scheme::Wss)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }

    /// Port implied when a URL does not name one
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }

    #[inline]
    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Wss)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint fields needed to build the upgrade request
#[derive(Debug, Clone, Copy)]
pub struct HandshakeParams<'a> {
    pub scheme: Scheme,
    pub host: &'a str,
    pub port: u16,
    pub path: &'a str,
    /// Optional `Sec-WebSocket-Protocol` value
    pub subprotocol: Option<&'a str>,
}

/// Build a WebSocket upgrade request
///
/// The `Host` header carries `:port` only when the port differs from the
/// scheme's default.
pub fn build_request(params: &HandshakeParams<'_>, key: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);

    buf.put_slice(b"GET ");
    buf.put_slice(params.path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    buf.put_slice(b"Host: ");
    buf.put_slice(params.host.as_bytes());
    if params.port != params.scheme.default_port() {
        buf.put_slice(format!(":{}", params.port).as_bytes());
    }
    buf.put_slice(b"\r\n");

    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");

    buf.put_slice(b"Origin: ");
    buf.put_slice(params.scheme.as_str().as_bytes());
    buf.put_slice(b"://");
    buf.put_slice(params.host.as_bytes());
    buf.put_slice(b"\r\n");

    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(proto) = params.subprotocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Generate a random WebSocket key (base64 of 16 random bytes)
pub fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    for chunk in bytes.chunks_exact_mut(4) {
        chunk.copy_from_slice(&generate_mask());
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Validate the server's accept key
pub fn validate_accept_key(sent_key: &str, received_accept: &str) -> bool {
    generate_accept_key(sent_key) == received_accept.trim()
}

/// Parsed upgrade response
#[derive(Debug)]
pub struct HandshakeResponse<'a> {
    /// HTTP status code (always 101 once parsed)
    pub status: u16,
    /// The Sec-WebSocket-Accept header
    pub accept: &'a str,
    /// The Sec-WebSocket-Protocol header
    pub protocol: Option<&'a str>,
}

/// Parse a WebSocket upgrade response
///
/// Returns `Ok(None)` while the header block is incomplete. On success the
/// second tuple element is the length of the header block; any bytes after
/// it already belong to the frame stream.
pub fn parse_response(buf: &[u8]) -> Result<Option<(HandshakeResponse<'_>, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let status = res.code.unwrap_or(0);
            if status != 101 {
                return Err(Error::HandshakeFailed("HTTP code not found or non 101"));
            }

            let mut accept = None;
            let mut protocol = None;

            for header in res.headers.iter() {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| Error::InvalidHttp("invalid header value"))?;

                if header.name.eq_ignore_ascii_case("sec-websocket-accept") {
                    accept = Some(value.trim());
                } else if header.name.eq_ignore_ascii_case("sec-websocket-protocol") {
                    protocol = Some(value.trim());
                }
            }

            let accept = accept
                .filter(|v| !v.is_empty())
                .ok_or(Error::HandshakeFailed("Accept key not found"))?;

            Ok(Some((
                HandshakeResponse {
                    status,
                    accept,
                    protocol,
                },
                len,
            )))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEADER_SIZE {
                return Err(Error::InvalidHttp("response too large"));
            }
            Ok(None)
        }
        Err(_) => Err(Error::InvalidHttp("failed to parse HTTP response")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(scheme: Scheme, port: u16) -> HandshakeParams<'static> {
        HandshakeParams {
            scheme,
            host: "example.com",
            port,
            path: "/chat",
            subprotocol: None,
        }
    }

    #[test]
    fn test_generate_accept_key() {
        // Test vector from RFC 6455
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let accept = generate_accept_key(key);
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_validate_accept_key() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        assert!(validate_accept_key(key, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(!validate_accept_key(key, "invalid"));
    }

    #[test]
    fn test_generate_key_is_16_bytes() {
        let key = generate_key();
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&key)
            .unwrap();
        assert_eq!(raw.len(), 16);
    }

    #[test]
    fn test_build_request_default_port() {
        let request = build_request(&params(Scheme::Ws, 80), "abc==");
        let text = std::str::from_utf8(&request).unwrap();

        assert!(text.starts_with("GET /chat HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Origin: ws://example.com\r\n"));
        assert!(text.contains("Sec-WebSocket-Key: abc==\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(!text.contains("Sec-WebSocket-Protocol"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_build_request_non_default_port() {
        let request = build_request(&params(Scheme::Ws, 8080), "abc==");
        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.contains("Host: example.com:8080\r\n"));

        let request = build_request(&params(Scheme::Wss, 443), "abc==");
        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Origin: wss://example.com\r\n"));

        let request = build_request(&params(Scheme::Wss, 80), "abc==");
        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.contains("Host: example.com:80\r\n"));
    }

    #[test]
    fn test_build_request_subprotocol() {
        let mut p = params(Scheme::Ws, 80);
        p.subprotocol = Some("chat, superchat");
        let request = build_request(&p, "abc==");
        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.contains("Sec-WebSocket-Protocol: chat, superchat\r\n"));
    }

    #[test]
    fn test_parse_response_accepts_101() {
        let response = b"HTTP/1.1 101 Switching Protocols\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Accept: abc123\r\n\
            \r\n";

        let (res, len) = parse_response(response).unwrap().unwrap();
        assert_eq!(res.status, 101);
        assert_eq!(res.accept, "abc123");
        assert_eq!(len, response.len());
    }

    #[test]
    fn test_parse_response_header_name_case() {
        let response = b"HTTP/1.1 101 Switching Protocols\r\n\
            sec-websocket-accept: abc123\r\n\
            \r\n\x81\x00";

        let (res, len) = parse_response(response).unwrap().unwrap();
        assert_eq!(res.accept, "abc123");
        assert_eq!(&response[len..], b"\x81\x00");
    }

    #[test]
    fn test_parse_response_rejects_non_101() {
        let response = b"HTTP/1.1 400 Bad Request\r\n\r\n";
        assert!(matches!(
            parse_response(response),
            Err(Error::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_parse_response_requires_accept() {
        let response = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n";
        assert!(matches!(
            parse_response(response),
            Err(Error::HandshakeFailed("Accept key not found"))
        ));

        let response = b"HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: \r\n\r\n";
        assert!(parse_response(response).is_err());
    }

    #[test]
    fn test_parse_response_partial() {
        let response = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n";
        assert!(parse_response(response).unwrap().is_none());
    }

    #[test]
    fn test_scheme() {
        assert_eq!(Scheme::parse("WSS"), Some(Scheme::Wss));
        assert_eq!(Scheme::parse("http"), None);
        assert_eq!(Scheme::Ws.default_port(), 80);
        assert!(Scheme::Wss.is_secure());
    }
}
