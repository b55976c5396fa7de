//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! Two types live here:
//!
//! - [`Frame`]: one unit on the wire, with its FIN bit, RSV1 (compressed) bit and masking key.
//! - [`Message`]: a complete, reassembled and decompressed message as handed to the application.
use bytes::{Bytes, BytesMut};

use crate::{mask, WebSocketError};

/// WebSocket operation code (OpCode) that determines the semantic meaning and handling of a frame.
///
/// The numeric values are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    ///
    /// Control frames cannot be fragmented, carry at most 125 bytes and are never compressed.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for the opcodes that start a data message.
    pub fn is_data(&self) -> bool {
        matches!(*self, OpCode::Text | OpCode::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A complete message delivered to the application.
///
/// `opcode` is [`OpCode::Text`] or [`OpCode::Binary`] for data messages, and [`OpCode::Ping`]
/// when pings are surfaced (see [`Options::with_emit_on_ping`](crate::Options::with_emit_on_ping)).
/// The payload is already unmasked, reassembled and decompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The kind of message.
    pub opcode: OpCode,
    /// The message data.
    pub payload: Bytes,
}

impl Message {
    /// Creates a text message.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Text,
            payload: payload.into(),
        }
    }

    /// Creates a binary message.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Binary,
            payload: payload.into(),
        }
    }

    /// Creates a ping message, as surfaced when `emit_on_ping` is set.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Ping,
            payload: payload.into(),
        }
    }

    /// Returns `true` for text messages.
    #[inline]
    pub fn is_text(&self) -> bool {
        self.opcode == OpCode::Text
    }

    /// Returns the payload as a string slice if it is valid UTF-8.
    ///
    /// Text messages are always valid UTF-8 when UTF-8 checking is enabled.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl From<Message> for (OpCode, Bytes) {
    fn from(val: Message) -> Self {
        (val.opcode, val.payload)
    }
}

impl From<(OpCode, Bytes)> for Message {
    fn from((opcode, payload): (OpCode, Bytes)) -> Self {
        Self { opcode, payload }
    }
}

/// Represents a WebSocket frame, encapsulating the data and metadata for message transmission.
///
/// **This low-level struct should rarely be used directly.** The session encodes and decodes
/// frames on behalf of the application; frames are public so that tests and tools can speak
/// the raw protocol through [`Codec`](crate::codec::Codec).
#[derive(Debug, Clone)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// RSV1: the payload is compressed with permessage-deflate.
    pub(crate) is_compressed: bool,
    /// The masking key for the frame, if any.
    mask: Option<[u8; 4]>,
    /// The payload of the frame.
    pub payload: BytesMut,
}

pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// The largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

impl Frame {
    /// Creates a new WebSocket `Frame`.
    ///
    /// `mask` is normally left as `None`: a client-side encoder picks a fresh key for every
    /// frame. A key given here is used by client encoders; server encoders drop it.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
            is_compressed: false,
        }
    }

    /// Creates a new frame carrying a payload compressed with permessage-deflate (RSV1 set).
    pub fn compress(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
            is_compressed: true,
        }
    }

    /// Creates a final text frame.
    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Text, None, BytesMut::from(payload.as_ref()))
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Binary, None, BytesMut::from(payload.as_ref()))
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Ping, None, BytesMut::from(payload.as_ref()))
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Pong, None, BytesMut::from(payload.as_ref()))
    }

    /// Creates a close frame with a raw payload.
    ///
    /// This method does not validate the payload; see [`PayloadData`](crate::close::PayloadData).
    pub fn close_raw(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Close, None, BytesMut::from(payload.as_ref()))
    }

    /// Returns whether RSV1 (the compressed flag) is set.
    #[inline(always)]
    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    /// Returns whether the frame carries a masking key.
    #[inline(always)]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Masks the payload, generating a key if none was set.
    pub(crate) fn mask(&mut self) {
        let key = *self.mask.get_or_insert_with(mask::generate_key);
        mask::apply_mask(&mut self.payload, key);
    }

    /// Drops the key without touching the payload.
    pub(crate) fn clear_mask(&mut self) {
        self.mask = None;
    }

    /// Removes the masking from the payload using the frame's key.
    pub(crate) fn unmask(&mut self) {
        if let Some(key) = self.mask.take() {
            mask::apply_mask(&mut self.payload, key);
        }
    }

    /// Formats the frame header into `head` and returns its size.
    ///
    /// The 7-bit length is used below 126 bytes, the 16-bit extended length below 65536 and
    /// the 64-bit extended length otherwise.
    pub(crate) fn fmt_head(&self, head: &mut [u8; MAX_HEAD_SIZE]) -> usize {
        let compression = u8::from(self.is_compressed);
        head[0] = (self.fin as u8) << 7 | compression << 6 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

impl From<Message> for Frame {
    fn from(value: Message) -> Self {
        Frame::new(true, value.opcode, None, BytesMut::from(&value.payload[..]))
    }
}
