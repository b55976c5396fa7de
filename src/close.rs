//! # Close
//!
//! Close status codes ([RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4))
//! and the payload carried by a close frame.
//!
//! A close frame payload is either empty ("no status", reported as [`CloseCode::Status`]) or a
//! big-endian 16-bit code followed by an optional UTF-8 reason of at most
//! [`MAX_REASON_LEN`] bytes.
use bytes::{BufMut, Bytes, BytesMut};

use crate::{Role, WebSocketError};

/// The largest reason, in bytes, that fits in a control frame next to the status code.
pub const MAX_REASON_LEN: usize = 123;

/// Status code indicating why a WebSocket connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001: an endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002: the peer violated the protocol.
    Protocol,
    /// 1003: the peer sent a type of data this endpoint cannot accept.
    Unsupported,
    /// 1005: no status code was present. Never sent on the wire.
    Status,
    /// 1006: the connection was dropped without a close frame. Never sent on the wire.
    Abnormal,
    /// 1007: a message contained data inconsistent with its type (e.g. invalid UTF-8).
    Invalid,
    /// 1008: a message violated the endpoint's policy.
    Policy,
    /// 1009: a message was too big to process.
    Size,
    /// 1010: the client expected the server to negotiate an extension. Sent by clients only.
    Extension,
    /// 1011: the server hit an unexpected condition. Sent by servers only.
    Error,
    /// 1012: the service is restarting.
    Restart,
    /// 1013: the service is overloaded, try again later.
    Again,
    /// 1015: the TLS handshake failed. Never sent on the wire.
    Tls,
    /// 1004 and 1016..=2999: reserved by the protocol.
    Reserved(u16),
    /// 3000..=3999: registered with IANA.
    Iana(u16),
    /// 4000..=4999: private use by applications.
    Library(u16),
    /// Anything outside the valid ranges.
    Bad(u16),
}

impl CloseCode {
    /// Returns `true` if a peer may legitimately put this code in a close frame.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            Self::Bad(_) | Self::Reserved(_) | Self::Status | Self::Abnormal | Self::Tls
        )
    }

    /// Returns `true` for the codes that must never appear in a transmitted close frame:
    /// 1004, 1005, 1006 and 1015.
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            Self::Reserved(1004) | Self::Status | Self::Abnormal | Self::Tls
        )
    }

    /// Returns `true` if an endpoint with `role` may initiate a close with this code.
    pub fn is_sendable_by(self, role: Role) -> bool {
        match self {
            Self::Extension => role == Role::Client,
            Self::Error => role == Role::Server,
            // an empty close frame is the wire form of "no status"
            Self::Status => true,
            other => other.is_allowed(),
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            1012 => Self::Restart,
            1013 => Self::Again,
            1015 => Self::Tls,
            1004 | 1014 | 1016..=2999 => Self::Reserved(code),
            3000..=3999 => Self::Iana(code),
            4000..=4999 => Self::Library(code),
            _ => Self::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// The decoded payload of a close frame: a status code and a reason.
///
/// `PayloadData::no_status()` stands for an empty payload. Its [`code`](Self::code) reads as
/// [`CloseCode::Status`] (1005) and it encodes to zero bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadData {
    code: Option<CloseCode>,
    reason: String,
}

impl PayloadData {
    /// Creates a payload from a code and a reason, rejecting reasons longer than
    /// [`MAX_REASON_LEN`] bytes and a reason attached to "no status".
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Result<Self, WebSocketError> {
        let reason = reason.into();
        if reason.len() > MAX_REASON_LEN {
            return Err(WebSocketError::ReasonTooLong(reason.len()));
        }

        if code == CloseCode::Status {
            if !reason.is_empty() {
                return Err(WebSocketError::InvalidArgument(
                    "a reason cannot be sent without a status code",
                ));
            }
            return Ok(Self::no_status());
        }

        Ok(Self {
            code: Some(code),
            reason,
        })
    }

    /// Builds a payload from an internal error message, truncating the reason on a character
    /// boundary so that it always fits in a control frame.
    pub(crate) fn lossy(code: CloseCode, reason: &str) -> Self {
        let mut end = reason.len().min(MAX_REASON_LEN);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }

        Self {
            code: Some(code),
            reason: reason[..end].to_string(),
        }
    }

    /// The empty payload ("no status").
    pub fn no_status() -> Self {
        Self {
            code: None,
            reason: String::new(),
        }
    }

    /// The status code, or [`CloseCode::Status`] when the payload was empty.
    pub fn code(&self) -> CloseCode {
        self.code.unwrap_or(CloseCode::Status)
    }

    /// The close reason; empty when none was given.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Whether the code must never be transmitted.
    pub fn has_reserved_code(&self) -> bool {
        self.code.is_some_and(CloseCode::is_reserved)
    }

    /// Encodes the payload as it appears in a close frame.
    pub fn encode(&self) -> Bytes {
        match self.code {
            None | Some(CloseCode::Status) => Bytes::new(),
            Some(code) => {
                let mut buf = BytesMut::with_capacity(2 + self.reason.len());
                buf.put_u16(u16::from(code));
                buf.extend_from_slice(self.reason.as_bytes());
                buf.freeze()
            }
        }
    }

    /// Decodes a received close frame payload.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidCloseFrame`] for a 1-byte payload
    /// - [`WebSocketError::InvalidCloseCode`] for a code a peer may not send
    /// - [`WebSocketError::InvalidUTF8`] if the reason is not UTF-8
    pub fn decode(payload: &[u8]) -> Result<Self, WebSocketError> {
        match payload {
            [] => Ok(Self::no_status()),
            [_] => Err(WebSocketError::InvalidCloseFrame),
            [hi, lo, reason @ ..] => {
                let code = CloseCode::from(u16::from_be_bytes([*hi, *lo]));
                if !code.is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode);
                }

                let reason = std::str::from_utf8(reason)
                    .map_err(|_| WebSocketError::InvalidUTF8)?
                    .to_string();

                Ok(Self {
                    code: Some(code),
                    reason,
                })
            }
        }
    }
}
