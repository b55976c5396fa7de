//! Reassembly of fragmented messages.
use bytes::{Bytes, BytesMut};

use crate::{
    frame::{Frame, OpCode},
    Result, WebSocketError,
};

/// A complete data message, still compressed if its first frame had RSV1 set.
#[derive(Debug)]
pub(super) struct Assembled {
    pub opcode: OpCode,
    pub compressed: bool,
    pub payload: Bytes,
}

struct Partial {
    opcode: OpCode,
    compressed: bool,
    buf: BytesMut,
}

/// Accumulates the frames of at most one fragmented message.
///
/// Only data frames are pushed; control frames may be interleaved on the wire and are
/// handled before they get here.
pub(super) struct Reassembler {
    partial: Option<Partial>,
    limit: usize,
}

impl Reassembler {
    /// `limit` bounds the size of an assembled message.
    pub(super) fn new(limit: usize) -> Self {
        Self {
            partial: None,
            limit,
        }
    }

    /// Consumes a data frame, returning the message it completes, if any.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidFragment`]: a text or binary frame while a message is in
    ///   progress.
    /// - [`WebSocketError::InvalidContinuationFrame`]: a continuation frame while none is.
    /// - [`WebSocketError::MessageTooBig`]: the message exceeds the limit.
    pub(super) fn push(&mut self, frame: Frame) -> Result<Option<Assembled>> {
        if frame.opcode == OpCode::Continuation {
            let Some(partial) = self.partial.as_mut() else {
                return Err(WebSocketError::InvalidContinuationFrame);
            };

            if partial.buf.len() + frame.payload.len() > self.limit {
                self.partial = None;
                return Err(WebSocketError::MessageTooBig);
            }
            partial.buf.extend_from_slice(&frame.payload);

            if !frame.fin {
                return Ok(None);
            }

            return Ok(self.partial.take().map(|partial| Assembled {
                opcode: partial.opcode,
                compressed: partial.compressed,
                payload: partial.buf.freeze(),
            }));
        }

        if self.partial.is_some() {
            return Err(WebSocketError::InvalidFragment);
        }
        if frame.payload.len() > self.limit {
            return Err(WebSocketError::MessageTooBig);
        }

        let compressed = frame.is_compressed();
        if frame.fin {
            Ok(Some(Assembled {
                opcode: frame.opcode,
                compressed,
                payload: frame.payload.freeze(),
            }))
        } else {
            self.partial = Some(Partial {
                opcode: frame.opcode,
                compressed,
                buf: frame.payload,
            });
            Ok(None)
        }
    }

    /// Whether a fragmented message is in progress.
    #[cfg(test)]
    fn is_accumulating(&self) -> bool {
        self.partial.is_some()
    }
}
