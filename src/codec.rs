//! Frame codec for [`tokio_util::codec`].
//!
//! The [`Decoder`] enforces the framing rules that do not depend on session state: reserved
//! bits, opcode legality, control frame limits, masking direction and the payload size limit.
//! The [`Encoder`] writes the header and masks client frames.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    Role, WebSocketError,
};

/// Represents the reading state of a WebSocket frame.
enum ReadState {
    /// The first two bytes were read; waiting for the extended length and mask.
    Header(Header),
    /// Waiting for the payload.
    Payload(HeaderAndMask),
}

/// Represents the initial header fields of a WebSocket frame.
struct Header {
    fin: bool,
    rsv1: bool,
    masked: bool,
    opcode: OpCode,
    /// Size of the extended length field (0, 2 or 8 bytes).
    extra: usize,
    /// The 7-bit length code.
    length_code: u8,
    /// Extended length plus masking key, in bytes.
    header_size: usize,
}

/// Contains header and mask data after decoding the bytes before the payload.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A combined codec that provides both encoding and decoding functionality for WebSocket frames.
///
/// Useful to drive one side of a connection with raw frames.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates a codec for an endpoint with `role`.
    pub fn new(role: Role, max_payload_size: usize, compression: bool) -> Self {
        Self {
            decoder: Decoder::new(role, max_payload_size, compression),
            encoder: Encoder::new(role),
        }
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// A decoder for WebSocket frames.
///
/// Frames are returned unmasked.
pub struct Decoder {
    /// Current reading state (header or payload).
    state: Option<ReadState>,
    /// Role of the local endpoint; decides which masking direction is legal.
    role: Role,
    /// Maximum allowed size for a frame payload.
    max_payload_size: usize,
    /// Whether permessage-deflate was negotiated, allowing RSV1.
    compression: bool,
}

impl Decoder {
    /// Creates a new `Decoder` for an endpoint with `role`.
    ///
    /// # Parameters
    /// - `role`: servers require masked frames, clients reject them.
    /// - `max_payload_size`: the maximum allowed payload size, in bytes.
    /// - `compression`: whether RSV1 may be set on the first frame of a data message.
    pub fn new(role: Role, max_payload_size: usize, compression: bool) -> Self {
        Self {
            state: None,
            role,
            max_payload_size,
            compression,
        }
    }

    fn check_first_bytes(&self, first: u8, second: u8) -> Result<Header, WebSocketError> {
        let fin = first & 0b1000_0000 != 0;
        let rsv1 = first & 0b0100_0000 != 0;

        if first & 0b0011_0000 != 0 {
            return Err(WebSocketError::ReservedBitsNotZero);
        }

        let opcode = OpCode::try_from(first & 0b0000_1111)?;
        let masked = second & 0b1000_0000 != 0;
        let length_code = second & 0x7F;

        if rsv1 {
            if !self.compression {
                return Err(WebSocketError::CompressionNotSupported);
            }
            // only the first frame of a data message carries RSV1
            if !opcode.is_data() {
                return Err(WebSocketError::ReservedBitsNotZero);
            }
        }

        if opcode.is_control() && !fin {
            return Err(WebSocketError::ControlFrameFragmented);
        }

        match self.role {
            Role::Server if !masked => return Err(WebSocketError::UnmaskedFrame),
            Role::Client if masked => return Err(WebSocketError::MaskedFrame),
            _ => {}
        }

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };

        Ok(Header {
            fin,
            rsv1,
            masked,
            opcode,
            extra,
            length_code,
            header_size: extra + masked as usize * 4,
        })
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes one frame from `src`.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a complete, unmasked frame.
    /// - `Ok(None)`: more data is needed.
    /// - `Err(WebSocketError)`: the bytes violate the framing rules.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let header = self.check_first_bytes(src[0], src[1])?;
                    src.advance(2);

                    self.state = Some(ReadState::Header(header));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len = match header.extra {
                        0 => u64::from(header.length_code),
                        2 => u64::from(src.get_u16()),
                        _ => src.get_u64(),
                    };

                    // the most significant bit of a 64-bit length must be 0
                    if payload_len & (1 << 63) != 0 {
                        return Err(WebSocketError::InvalidFrameLength);
                    }

                    let payload_len =
                        usize::try_from(payload_len).map_err(|_| WebSocketError::FrameTooLarge)?;

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if header.opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD {
                        return Err(WebSocketError::ControlFrameTooLarge);
                    }
                    if payload_len > self.max_payload_size {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        src.reserve(header_and_mask.payload_len - src.remaining());
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    } = header_and_mask;

                    let payload = src.split_to(payload_len);
                    let mut frame = Frame::new(header.fin, header.opcode, mask, payload);
                    frame.is_compressed = header.rsv1;
                    frame.unmask();

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// WebSocket frame encoder.
///
/// A client encoder masks every frame, with the frame's key or a fresh one. A server encoder
/// never masks and drops any key the frame carries.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    /// Creates an encoder for an endpoint with `role`.
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() as u64 >= 1 << 63 {
            return Err(WebSocketError::FrameTooLarge);
        }

        match self.role {
            Role::Client => frame.mask(),
            Role::Server => frame.clear_mask(),
        }

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
