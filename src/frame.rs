//! Length-prefixed message framing.
//!
//! Messages cross the in-process transport in the usual gRPC framing:
//! - 1 byte: compressed flag (0 = uncompressed, 1 = compressed)
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: message payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;

/// Size of the frame header (1 byte flag + 4 bytes length).
pub const HEADER_SIZE: usize = 5;

/// Default maximum message size (4MB).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Encode an uncompressed message with its length prefix.
///
/// Fails if the payload does not fit the 32-bit length field.
pub fn encode_message(data: &[u8]) -> io::Result<Bytes> {
    let length = frame_length(data.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + data.len());
    buf.put_u8(0);
    buf.put_u32(length);
    buf.put_slice(data);
    Ok(buf.freeze())
}

fn frame_length(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message too large to frame: {} bytes", len),
        )
    })
}

/// Incremental decoder for framed messages.
#[derive(Debug)]
pub struct MessageDecoder {
    buffer: BytesMut,
    max_message_size: usize,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_MESSAGE_SIZE)
    }
}

impl MessageDecoder {
    /// Create a decoder rejecting messages larger than `max_message_size`.
    pub fn with_limit(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_message_size,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next message.
    ///
    /// Returns `Ok(Some((message, compressed)))` once a complete message is
    /// buffered and `Ok(None)` if more data is needed.
    pub fn decode(&mut self) -> io::Result<Option<(Bytes, bool)>> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let compressed = self.buffer[0] != 0;
        let length = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;

        if length > self.max_message_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "message too large: {} bytes (limit {})",
                    length, self.max_message_size
                ),
            ));
        }

        if self.buffer.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        self.buffer.advance(HEADER_SIZE);
        let message = self.buffer.split_to(length).freeze();
        Ok(Some((message, compressed)))
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
