//! # wsengine
//! A WebSocket (RFC 6455) session engine with permessage-deflate (RFC 7692) negotiation.
//!
//! A [`WebSocket`] turns a bidirectional byte stream into a message-oriented session, in either
//! the client or the server role. The engine takes care of:
//!
//! - the HTTP/1.1 upgrade handshake, including redirects, Basic/Digest authentication, proxies
//!   (`CONNECT` tunnels) and cookies on the client side, and request validation on the server side
//! - framing, masking and fragmentation in both directions
//! - ping/pong, keepalive and the two-phase close handshake
//! - ordered, panic-isolated delivery of events to a [`Handler`]
//!
//! # Features
//! - `logging` (default): debug logging of negotiation, state transitions and the close
//!   handshake through the `log` crate.
//! - `simd`: UTF-8 validation of text messages with `simdutf8`.
//!
//! # Client Example
//! ```no_run
//! use wsengine::{CloseEvent, Handler, Message, WebSocket};
//!
//! struct Printer;
//!
//! impl Handler for Printer {
//!     fn on_message(&self, _ws: &WebSocket, message: Message) {
//!         println!("{:?}", message.as_str());
//!     }
//!
//!     fn on_close(&self, _ws: &WebSocket, event: CloseEvent) {
//!         println!("closed with {}", event.code);
//!     }
//! }
//!
//! async fn client() -> wsengine::Result<()> {
//!     let ws = WebSocket::connect("wss://echo.websocket.org".parse()?)
//!         .with_handler(Printer)
//!         .await?;
//!
//!     ws.send_text("hello").await?;
//!     ws.close().await
//! }
//! ```
//!
//! # Server Example
//! ```no_run
//! use tokio::net::TcpListener;
//! use wsengine::{Options, WebSocket};
//!
//! async fn server() -> wsengine::Result<()> {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     loop {
//!         let (stream, _) = listener.accept().await?;
//!         let (handler, mut events) = wsengine::events::channel();
//!         tokio::spawn(async move {
//!             if let Ok(ws) = WebSocket::accept(stream, Options::default(), handler).await {
//!                 while let Some(event) = events.recv().await {
//!                     if let wsengine::Event::Message(message) = event {
//!                         let _ = ws.send(message.opcode, message.payload).await;
//!                     }
//!                 }
//!             }
//!         });
//!     }
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod auth;
pub mod close;
pub mod codec;
mod compression;
pub mod events;
pub mod extensions;
pub mod frame;
pub mod handshake;
mod mask;
mod options;
mod session;
pub mod stream;

use close::CloseCode;
use thiserror::Error;

pub use auth::Credentials;
pub use events::{CloseEvent, Event, Handler};
pub use frame::{Message, OpCode};
pub use handshake::{
    client::WebSocketBuilder,
    server::{HandshakeRequest, UpgradeFut},
    HttpResponse, UpgradeResult,
};
pub use options::{CompressionLevel, Delivery, Options, ProxyConfig, Validator};
pub use session::{ReadyState, Role, WebSocket};

/// The maximum allowed payload size for reading, set to 1 MiB.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// The maximum allowed read buffer size for fragmented and decompressed messages, set to 2 MiB.
pub const MAX_READ_BUFFER: usize = 2 * 1024 * 1024;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The errors fall into a few groups, each mapped to a close code by
/// [`close_code`](WebSocketError::close_code):
///
/// - Protocol errors: the peer broke the framing or sequencing rules (1002).
/// - Data errors: invalid UTF-8 (1007) or oversized messages (1009).
/// - Handshake errors: the upgrade failed and the session never opened.
/// - Transport errors: I/O failures and timeouts, reported as an abnormal closure (1006).
/// - Argument errors: invalid input to a public API, rejected before any state changes.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A new data frame arrived while a fragmented message was still being assembled.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// A text message or close reason contains invalid UTF-8 data.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// A continuation frame arrived while no fragmented message was in progress.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// The handshake response carried an unexpected HTTP status code.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// The "Upgrade" header is missing or is not "websocket".
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The "Connection" header is missing or does not contain "upgrade".
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// The connection is not open, or was closed while the operation was in flight.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The peer closed the transport without a close handshake.
    #[error("Connection closed abnormally")]
    AbnormalClosure,

    /// A close frame with a 1-byte payload.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close frame with a status code a peer may not send.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// RSV bits set without a negotiated extension that defines them.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame with the FIN bit cleared.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame whose payload exceeds 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// A 64-bit payload length with its most significant bit set.
    #[error("Invalid frame length")]
    InvalidFrameLength,

    /// A server received a frame without a masking key.
    #[error("Client frames must be masked")]
    UnmaskedFrame,

    /// A client received a frame with a masking key.
    #[error("Server frames must not be masked")]
    MaskedFrame,

    /// A frame payload exceeds the configured maximum.
    #[error("Frame too large")]
    FrameTooLarge,

    /// A reassembled or decompressed message exceeds the read buffer limit.
    #[error("Message too big")]
    MessageTooBig,

    /// "Sec-WebSocket-Version" is missing or is not 13.
    #[error("Sec-Websocket-Version must be 13")]
    InvalidSecWebsocketVersion,

    /// A frame with a reserved opcode.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// "Sec-WebSocket-Key" is missing or empty.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// "Sec-WebSocket-Accept" does not match the key that was sent.
    #[error("Sec-WebSocket-Accept does not match the key")]
    InvalidAcceptKey,

    /// The server selected a subprotocol the client did not offer.
    #[error("Invalid subprotocol: {0}")]
    InvalidSubprotocol(String),

    /// The server's extension selection is not acceptable.
    #[error("Invalid extension: {0}")]
    InvalidExtension(String),

    /// The handshake request did not use GET.
    #[error("Handshake request method must be GET")]
    InvalidMethod,

    /// The handshake request used HTTP/1.0 or older.
    #[error("Handshake request must use HTTP/1.1 or newer")]
    InvalidHttpVersion,

    /// The handshake request has no Host header.
    #[error("Host header is missing")]
    MissingHost,

    /// The server-side validation hook rejected the request.
    #[error("Handshake rejected: {0}")]
    Rejected(String),

    /// The handshake did not complete within the allowed number of attempts.
    #[error("Too many connection attempts ({0})")]
    TooManyAttempts(usize),

    /// A redirect response without a usable Location header.
    #[error("Invalid redirect location")]
    InvalidRedirect,

    /// The server still required authentication after the authenticated retry.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The proxy refused to open a tunnel.
    #[error("Proxy CONNECT failed with status {0}")]
    ProxyConnectFailed(u16),

    /// A handshake step or a close wait exceeded its time limit.
    #[error("Operation timed out")]
    Timeout,

    /// Received a compressed frame on a connection where compression was not negotiated.
    #[error("Received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// The compressed payload could not be inflated.
    #[error("Decompression failed: {0}")]
    Decompression(String),

    /// A close reason longer than 123 bytes.
    #[error("Close reason is too long ({0} bytes)")]
    ReasonTooLong(usize),

    /// A close code the local endpoint may not send.
    #[error("Close code {0} cannot be sent by this endpoint")]
    UnsendableCloseCode(CloseCode),

    /// Invalid input to a public API.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Only "ws://" and "wss://" URLs are accepted.
    #[error("Invalid http scheme")]
    InvalidHttpScheme,

    /// A callback of the [`Handler`] panicked.
    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    /// Wraps errors from URL parsing.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps I/O errors of the transport.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Wraps errors from the hyper HTTP library during the handshake.
    #[error(transparent)]
    HTTPError(#[from] hyper::Error),

    /// Wraps errors building HTTP requests or responses.
    #[error(transparent)]
    Http(#[from] http::Error),
}

impl WebSocketError {
    /// Returns `true` for errors caused by the peer breaking the framing or sequencing rules.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFragment
                | Self::InvalidContinuationFrame
                | Self::InvalidCloseFrame
                | Self::InvalidCloseCode
                | Self::ReservedBitsNotZero
                | Self::ControlFrameFragmented
                | Self::ControlFrameTooLarge
                | Self::InvalidFrameLength
                | Self::UnmaskedFrame
                | Self::MaskedFrame
                | Self::InvalidOpCode(_)
                | Self::CompressionNotSupported
                | Self::Decompression(_)
        )
    }

    /// Returns `true` for errors that prevent the session from opening.
    pub fn is_handshake_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidStatusCode(_)
                | Self::InvalidUpgradeHeader
                | Self::InvalidConnectionHeader
                | Self::InvalidSecWebsocketVersion
                | Self::MissingSecWebSocketKey
                | Self::InvalidAcceptKey
                | Self::InvalidSubprotocol(_)
                | Self::InvalidExtension(_)
                | Self::InvalidMethod
                | Self::InvalidHttpVersion
                | Self::MissingHost
                | Self::Rejected(_)
                | Self::TooManyAttempts(_)
                | Self::InvalidRedirect
                | Self::AuthenticationFailed
                | Self::ProxyConnectFailed(_)
                | Self::InvalidHttpScheme
                | Self::HTTPError(_)
                | Self::Http(_)
        )
    }

    /// Returns `true` for argument errors raised by public APIs.
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            Self::ReasonTooLong(_) | Self::UnsendableCloseCode(_) | Self::InvalidArgument(_)
        )
    }

    /// The close code a session uses when this error ends it.
    ///
    /// [`CloseCode::Abnormal`] means no close frame is sent.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::InvalidUTF8 => CloseCode::Invalid,
            Self::FrameTooLarge | Self::MessageTooBig => CloseCode::Size,
            err if err.is_protocol_error() => CloseCode::Protocol,
            _ => CloseCode::Abnormal,
        }
    }

    /// A copy of the error for [`Handler::on_error`] while the original goes back to the
    /// caller. Wrapped library errors keep their message but lose their source.
    pub(crate) fn reported(&self) -> Self {
        use std::io::Error;

        match self {
            Self::InvalidFragment => Self::InvalidFragment,
            Self::InvalidUTF8 => Self::InvalidUTF8,
            Self::InvalidContinuationFrame => Self::InvalidContinuationFrame,
            Self::InvalidStatusCode(code) => Self::InvalidStatusCode(*code),
            Self::InvalidUpgradeHeader => Self::InvalidUpgradeHeader,
            Self::InvalidConnectionHeader => Self::InvalidConnectionHeader,
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::AbnormalClosure => Self::AbnormalClosure,
            Self::InvalidCloseFrame => Self::InvalidCloseFrame,
            Self::InvalidCloseCode => Self::InvalidCloseCode,
            Self::ReservedBitsNotZero => Self::ReservedBitsNotZero,
            Self::ControlFrameFragmented => Self::ControlFrameFragmented,
            Self::ControlFrameTooLarge => Self::ControlFrameTooLarge,
            Self::InvalidFrameLength => Self::InvalidFrameLength,
            Self::UnmaskedFrame => Self::UnmaskedFrame,
            Self::MaskedFrame => Self::MaskedFrame,
            Self::FrameTooLarge => Self::FrameTooLarge,
            Self::MessageTooBig => Self::MessageTooBig,
            Self::InvalidSecWebsocketVersion => Self::InvalidSecWebsocketVersion,
            Self::InvalidOpCode(byte) => Self::InvalidOpCode(*byte),
            Self::MissingSecWebSocketKey => Self::MissingSecWebSocketKey,
            Self::InvalidAcceptKey => Self::InvalidAcceptKey,
            Self::InvalidSubprotocol(protocol) => Self::InvalidSubprotocol(protocol.clone()),
            Self::InvalidExtension(reason) => Self::InvalidExtension(reason.clone()),
            Self::InvalidMethod => Self::InvalidMethod,
            Self::InvalidHttpVersion => Self::InvalidHttpVersion,
            Self::MissingHost => Self::MissingHost,
            Self::Rejected(reason) => Self::Rejected(reason.clone()),
            Self::TooManyAttempts(attempts) => Self::TooManyAttempts(*attempts),
            Self::InvalidRedirect => Self::InvalidRedirect,
            Self::AuthenticationFailed => Self::AuthenticationFailed,
            Self::ProxyConnectFailed(status) => Self::ProxyConnectFailed(*status),
            Self::Timeout => Self::Timeout,
            Self::CompressionNotSupported => Self::CompressionNotSupported,
            Self::Decompression(reason) => Self::Decompression(reason.clone()),
            Self::ReasonTooLong(len) => Self::ReasonTooLong(*len),
            Self::UnsendableCloseCode(code) => Self::UnsendableCloseCode(*code),
            Self::InvalidArgument(reason) => Self::InvalidArgument(reason),
            Self::InvalidHttpScheme => Self::InvalidHttpScheme,
            Self::HandlerPanic(reason) => Self::HandlerPanic(reason.clone()),
            Self::UrlParseError(err) => Self::UrlParseError(*err),
            Self::IoError(err) => Self::IoError(Error::new(err.kind(), err.to_string())),
            Self::HTTPError(err) => Self::IoError(Error::other(err.to_string())),
            Self::Http(err) => Self::IoError(Error::other(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_mapping() {
        assert_eq!(
            WebSocketError::InvalidContinuationFrame.close_code(),
            CloseCode::Protocol
        );
        assert_eq!(WebSocketError::UnmaskedFrame.close_code(), CloseCode::Protocol);
        assert_eq!(WebSocketError::InvalidUTF8.close_code(), CloseCode::Invalid);
        assert_eq!(WebSocketError::MessageTooBig.close_code(), CloseCode::Size);
        assert_eq!(WebSocketError::FrameTooLarge.close_code(), CloseCode::Size);
        assert_eq!(
            WebSocketError::IoError(std::io::ErrorKind::BrokenPipe.into()).close_code(),
            CloseCode::Abnormal
        );
        assert_eq!(WebSocketError::Timeout.close_code(), CloseCode::Abnormal);
    }

    #[test]
    fn test_classification() {
        assert!(WebSocketError::InvalidAcceptKey.is_handshake_error());
        assert!(!WebSocketError::InvalidAcceptKey.is_protocol_error());
        assert!(WebSocketError::MaskedFrame.is_protocol_error());
        assert!(WebSocketError::ReasonTooLong(124).is_argument_error());
    }
}
