//! permessage-deflate payload transforms.
//!
//! Context takeover is never negotiated, so every message is compressed and decompressed with
//! a fresh LZ77 window: the codec state is reset before each message.
use bytes::Bytes;
use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};

use crate::{CompressionLevel, WebSocketError};

/// The empty stored block that terminates a sync flush (RFC 7692, Section 7.2.1).
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Initial output reservation for a message.
const CHUNK: usize = 1024;

/// Compresses outgoing message payloads.
pub(crate) struct Deflater {
    compress: Compress,
}

impl Deflater {
    pub(crate) fn new(level: CompressionLevel) -> Self {
        Self {
            compress: Compress::new(level, false),
        }
    }

    /// Compresses one complete message.
    ///
    /// The output ends at a byte boundary without the trailing `00 00 ff ff`.
    pub(crate) fn compress(&mut self, mut input: &[u8]) -> Result<Bytes, WebSocketError> {
        self.compress.reset();

        let mut output = Vec::with_capacity(input.len() / 2 + CHUNK);
        loop {
            if output.len() == output.capacity() {
                output.reserve(CHUNK);
            }

            let before_in = self.compress.total_in();
            self.compress
                .compress_vec(input, &mut output, FlushCompress::Sync)
                .map_err(std::io::Error::other)?;

            let consumed = (self.compress.total_in() - before_in) as usize;
            input = &input[consumed..];

            // a sync flush is complete once the input is drained and there was room to spare
            if input.is_empty() && output.len() < output.capacity() {
                break;
            }
        }

        if output.ends_with(&DEFLATE_TAIL) {
            output.truncate(output.len() - DEFLATE_TAIL.len());
        }

        Ok(Bytes::from(output))
    }
}

/// Decompresses incoming message payloads.
pub(crate) struct Inflater {
    decompress: Decompress,
}

impl Inflater {
    pub(crate) fn new() -> Self {
        Self {
            decompress: Decompress::new(false),
        }
    }

    /// Decompresses one complete message, failing with [`WebSocketError::MessageTooBig`] as
    /// soon as the output would exceed `limit` bytes.
    pub(crate) fn decompress(
        &mut self,
        input: &[u8],
        limit: usize,
    ) -> Result<Bytes, WebSocketError> {
        self.decompress.reset(false);

        let mut output = Vec::with_capacity((input.len() * 2).clamp(CHUNK, limit.max(CHUNK)));
        self.feed(input, &mut output, limit)?;
        self.feed(&DEFLATE_TAIL, &mut output, limit)?;

        Ok(Bytes::from(output))
    }

    fn feed(
        &mut self,
        mut input: &[u8],
        output: &mut Vec<u8>,
        limit: usize,
    ) -> Result<(), WebSocketError> {
        loop {
            if output.len() == output.capacity() {
                output.reserve(CHUNK);
            }

            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress_vec(input, output, FlushDecompress::Sync)
                .map_err(|err| WebSocketError::Decompression(err.to_string()))?;

            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = self.decompress.total_out() - before_out;
            input = &input[consumed..];

            if output.len() > limit {
                return Err(WebSocketError::MessageTooBig);
            }

            match status {
                Status::StreamEnd => return Ok(()),
                Status::Ok | Status::BufError => {
                    // done once the input is drained and the last call left output space unused
                    if input.is_empty() && output.len() < output.capacity() {
                        return Ok(());
                    }
                    if consumed == 0 && produced == 0 && output.len() < output.capacity() {
                        return Err(WebSocketError::Decompression(
                            "corrupt deflate stream".to_string(),
                        ));
                    }
                }
            }
        }
    }
}
