//! Binary frame format.
//!
//! Frame layout:
//!
//! ```text
//! +----------+--------------------+------------------+
//! |  length  |       header       |       body       |
//! | 3 bytes  | 19 bytes (request) | length - header  |
//! |          | 27+ bytes (resp.)  |                  |
//! +----------+--------------------+------------------+
//! ```
//!
//! `length` is big-endian and counts every byte after itself.

use crate::error::ProtocolError;
use crate::header::REQUEST_HEADER_SIZE;
use crate::MAX_FRAME_LENGTH;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix in bytes.
pub const LENGTH_FIELD_SIZE: usize = 3;

/// Reads the 3-byte big-endian length at the start of `buf`.
fn read_length(buf: &[u8]) -> u32 {
    u32::from_be_bytes([0, buf[0], buf[1], buf[2]])
}

/// A reserved, not yet written, length prefix inside an output buffer.
///
/// The encoder reserves the prefix, writes header and body, then backpatches
/// the measured span.
#[derive(Debug)]
#[must_use = "a reserved length prefix must be backpatched"]
pub struct LengthPlaceholder {
    offset: usize,
}

impl LengthPlaceholder {
    /// Reserves the length field at the current end of `buf`.
    pub fn reserve(buf: &mut BytesMut) -> Self {
        let offset = buf.len();
        buf.put_bytes(0, LENGTH_FIELD_SIZE);
        Self { offset }
    }

    /// Overwrites the reserved bytes with the number of bytes written since
    /// the reservation. Returns the frame length.
    pub fn backpatch(self, buf: &mut BytesMut, max_frame_length: u32) -> Result<u32, ProtocolError> {
        let span = buf.len() - self.offset - LENGTH_FIELD_SIZE;
        let max = max_frame_length.min(MAX_FRAME_LENGTH);
        if span > max as usize {
            // Drop the partially written frame so the buffer stays usable.
            buf.truncate(self.offset);
            return Err(ProtocolError::FrameTooLarge {
                size: u32::try_from(span).unwrap_or(u32::MAX),
                max,
            });
        }

        let len = span as u32;
        buf[self.offset..self.offset + LENGTH_FIELD_SIZE].copy_from_slice(&len.to_be_bytes()[1..]);
        Ok(len)
    }
}

/// One complete frame with the length prefix stripped.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Header bytes followed by body bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a frame around already-encoded header and body bytes.
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self, max_frame_length: u32) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(LENGTH_FIELD_SIZE + self.payload.len());
        let placeholder = LengthPlaceholder::reserve(&mut buf);
        buf.put_slice(&self.payload);
        placeholder.backpatch(&mut buf, max_frame_length)?;
        Ok(buf)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` if the length prefix is
    /// unacceptable. Bytes of an incomplete frame are left in `buf`.
    pub fn decode(buf: &mut BytesMut, max_frame_length: u32) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        let len = read_length(&buf[..LENGTH_FIELD_SIZE]);
        let max = max_frame_length.min(MAX_FRAME_LENGTH);
        if len > max {
            return Err(ProtocolError::FrameTooLarge { size: len, max });
        }
        if (len as usize) < REQUEST_HEADER_SIZE {
            return Err(ProtocolError::InvalidLength(len));
        }

        let total_len = LENGTH_FIELD_SIZE + len as usize;
        if buf.len() < total_len {
            // Avoid repeated reallocation while the rest of the frame arrives.
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_FIELD_SIZE);
        let payload = buf.split_to(len as usize).freeze();
        Ok(Some(Self { payload }))
    }
}
