//! The HTTP/1.1 upgrade handshake.
//!
//! [`client`] sends the upgrade request and validates the answer, following redirects,
//! answering authentication challenges and tunnelling through proxies. [`server`] validates
//! upgrade requests and answers them.
pub mod client;
mod proxy;
pub mod server;

use bytes::Bytes;
use http::{header, HeaderMap, Response};
use http_body_util::Empty;
use sha1::{Digest, Sha1};

use crate::Result;

/// The GUID appended to the key before hashing (RFC 6455, Section 1.3).
const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Type alias for HTTP responses used during WebSocket upgrade.
///
/// This alias represents the HTTP response sent back to clients after a WebSocket upgrade
/// request. The response has an empty body.
pub type HttpResponse = Response<Empty<Bytes>>;

/// The result of [`WebSocket::upgrade`](crate::WebSocket::upgrade): the response to send and a
/// future resolving to the session once the connection is upgraded.
pub type UpgradeResult = Result<(HttpResponse, server::UpgradeFut)>;

/// Computes the `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
pub fn accept_key(key: &[u8]) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(ACCEPT_GUID);
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub(crate) fn generate_key() -> String {
    use base64::prelude::*;
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// The value of a header as a string, if present and visible ASCII.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Whether a comma-separated header contains `token`, ignoring case.
pub(crate) fn has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// The comma-separated items of all the values of a header.
pub(crate) fn list(headers: &HeaderMap, name: header::HeaderName) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
