//! Command header.
//!
//! Request header layout (19 bytes):
//!
//! ```text
//! +------+---------+---------+------------+--------------+--------------+
//! | type | needAck | version | command_id | command_type | command_time |
//! |  1B  |   1B    |   1B    |     4B     |      4B      |      8B      |
//! +------+---------+---------+------------+--------------+--------------+
//! ```
//!
//! A response header appends `status (4B) | error_len (4B) | error (UTF-8)`.
//! An empty error string is the "no error" encoding.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of an encoded request header.
pub const REQUEST_HEADER_SIZE: usize = 1 + 1 + 1 + 4 + 4 + 8;

/// Size of an encoded response header with empty error text.
pub const RESPONSE_HEADER_MIN_SIZE: usize = REQUEST_HEADER_SIZE + 4 + 4;

/// Response status codes.
///
/// A response is successful iff its status is [`SUCCESS`](status::SUCCESS);
/// the error text is informational only.
pub mod status {
    /// Request processed successfully.
    pub const SUCCESS: i32 = 0;
    /// Request failed on the responding side.
    pub const ERROR: i32 = 1;
    /// No handler is registered for the request's command type.
    pub const NO_HANDLER: i32 = 2;
}

/// Discriminates requests from responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeaderType {
    Request = 0,
    Response = 1,
}

impl TryFrom<u8> for HeaderType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(HeaderType::Request),
            1 => Ok(HeaderType::Response),
            other => Err(ProtocolError::InvalidHeaderType(other)),
        }
    }
}

impl fmt::Display for HeaderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderType::Request => write!(f, "REQUEST"),
            HeaderType::Response => write!(f, "RESPONSE"),
        }
    }
}

/// Header shared by every command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub header_type: HeaderType,
    /// Whether the sender expects a response.
    pub need_ack: bool,
    /// Correlation id. A response carries its request's id.
    pub command_id: u32,
    /// Identifies the body schema.
    pub command_type: u32,
    pub command_version: u8,
    /// Milliseconds since the Unix epoch at construction.
    pub command_time: i64,
    /// Response only.
    pub status: i32,
    /// Response only. `None` is encoded as an empty string.
    pub error: Option<String>,
}

impl Header {
    /// Creates a request header. Requests expect an acknowledgement by default.
    pub fn request(command_id: u32, command_type: u32, command_time: i64) -> Self {
        Self {
            header_type: HeaderType::Request,
            need_ack: true,
            command_id,
            command_type,
            command_version: 0,
            command_time,
            status: status::SUCCESS,
            error: None,
        }
    }

    /// Creates a successful response header correlated with `request`.
    pub fn response_to(request: &Header, command_time: i64) -> Self {
        Self {
            header_type: HeaderType::Response,
            need_ack: false,
            command_id: request.command_id,
            command_type: request.command_type,
            command_version: request.command_version,
            command_time,
            status: status::SUCCESS,
            error: None,
        }
    }

    pub fn with_need_ack(mut self, need_ack: bool) -> Self {
        self.need_ack = need_ack;
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.command_version = version;
        self
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        let error = error.into();
        self.error = if error.is_empty() { None } else { Some(error) };
        self
    }

    pub fn is_request(&self) -> bool {
        self.header_type == HeaderType::Request
    }

    pub fn is_response(&self) -> bool {
        self.header_type == HeaderType::Response
    }

    /// Returns whether a response header reports success.
    pub fn is_success(&self) -> bool {
        self.status == status::SUCCESS
    }

    /// Returns the number of bytes `encode` writes.
    pub fn encoded_len(&self) -> usize {
        match self.header_type {
            HeaderType::Request => REQUEST_HEADER_SIZE,
            HeaderType::Response => {
                RESPONSE_HEADER_MIN_SIZE + self.error.as_ref().map_or(0, |e| e.len())
            }
        }
    }

    /// Encodes the header into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.header_type as u8);
        buf.put_u8(self.need_ack as u8);
        buf.put_u8(self.command_version);
        buf.put_u32(self.command_id);
        buf.put_u32(self.command_type);
        buf.put_i64(self.command_time);

        if self.header_type == HeaderType::Response {
            buf.put_i32(self.status);
            let error = self.error.as_deref().unwrap_or("");
            buf.put_u32(error.len() as u32);
            buf.put_slice(error.as_bytes());
        }
    }

    /// Decodes a header from the front of `buf`, leaving the body.
    pub fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        ensure_remaining(buf, REQUEST_HEADER_SIZE)?;

        let header_type = HeaderType::try_from(buf.get_u8())?;
        let need_ack = buf.get_u8() != 0;
        let command_version = buf.get_u8();
        let command_id = buf.get_u32();
        let command_type = buf.get_u32();
        let command_time = buf.get_i64();

        let mut header = Self {
            header_type,
            need_ack,
            command_id,
            command_type,
            command_version,
            command_time,
            status: status::SUCCESS,
            error: None,
        };

        if header_type == HeaderType::Response {
            ensure_remaining(buf, 8)?;
            header.status = buf.get_i32();
            let error_len = buf.get_u32() as usize;
            ensure_remaining(buf, error_len)?;
            if error_len > 0 {
                let raw = buf.split_to(error_len);
                let text = std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidUtf8)?;
                header.error = Some(text.to_string());
            }
        }

        Ok(header)
    }
}

fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::TruncatedHeader {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}
