//! Command abstraction and built-in commands.
//!
//! A command is a [`Header`] plus a body. The codec decodes the header first
//! and asks the registry for a command of the right type, which is why every
//! command is constructed from an already-known header and only decodes its
//! own body.

use crate::error::ProtocolError;
use crate::header::{Header, HeaderType};
use bytes::{BufMut, Bytes, BytesMut};
use std::any::Any;
use std::fmt;

/// A request or response travelling on the wire.
pub trait Command: Any + Send + Sync + fmt::Debug {
    /// Returns the command header.
    fn header(&self) -> &Header;

    /// Returns the command header for modification.
    fn header_mut(&mut self) -> &mut Header;

    /// Checks the command content. Runs before encode and after decode.
    fn validate(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Writes the body (everything after the header).
    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError>;

    /// Reads the body. `body` holds exactly the bytes after the header.
    fn decode_body(&mut self, body: Bytes) -> Result<(), ProtocolError>;

    /// Returns `self` as `Any` for downcasting to the concrete command.
    fn as_any(&self) -> &dyn Any;
}

impl dyn Command {
    /// Downcasts to a concrete command type.
    pub fn downcast_ref<T: Command>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Shorthand for `header().command_id`.
    pub fn command_id(&self) -> u32 {
        self.header().command_id
    }

    /// Shorthand for `header().command_type`.
    pub fn command_type(&self) -> u32 {
        self.header().command_type
    }
}

/// A command whose body is an opaque byte string.
///
/// Useful for layers that serialize their own payloads, and for tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    header: Header,
    body: Bytes,
}

impl RawCommand {
    pub fn new(header: Header, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    /// Creates an empty command for the decoder to fill in.
    pub fn from_header(header: Header) -> Self {
        Self {
            header,
            body: Bytes::new(),
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }
}

impl Command for RawCommand {
    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_slice(&self.body);
        Ok(())
    }

    fn decode_body(&mut self, body: Bytes) -> Result<(), ProtocolError> {
        self.body = body;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Keep-alive request sent on write-idle connections.
///
/// Never acknowledged, never correlated, always has an empty body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    header: Header,
}

impl Heartbeat {
    pub fn new(command_id: u32, command_type: u32, command_time: i64) -> Self {
        Self {
            header: Header::request(command_id, command_type, command_time).with_need_ack(false),
        }
    }

    /// Creates a heartbeat for the decoder to fill in.
    pub fn from_header(header: Header) -> Self {
        Self { header }
    }
}

impl Command for Heartbeat {
    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if self.header.header_type != HeaderType::Request {
            return Err(ProtocolError::validation("heartbeat must be a request"));
        }
        if self.header.need_ack {
            return Err(ProtocolError::validation("heartbeat must not need an ack"));
        }
        Ok(())
    }

    fn encode_body(&self, _buf: &mut BytesMut) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn decode_body(&mut self, body: Bytes) -> Result<(), ProtocolError> {
        if !body.is_empty() {
            return Err(ProtocolError::MalformedBody {
                command_type: self.header.command_type,
                reason: format!("heartbeat body must be empty, got {} bytes", body.len()),
            });
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_command_body() {
        let mut cmd = RawCommand::from_header(Header::request(1, 10, 0));
        assert!(cmd.body().is_empty());

        cmd.decode_body(Bytes::from_static(b"hello")).unwrap();
        let mut buf = BytesMut::new();
        cmd.encode_body(&mut buf).unwrap();
        assert_eq!(&buf[..], b"hello");
        assert_eq!(cmd.into_body(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_downcast() {
        let cmd: Box<dyn Command> = Box::new(RawCommand::new(Header::request(5, 10, 0), "x"));
        assert_eq!(cmd.command_id(), 5);
        assert_eq!(cmd.command_type(), 10);
        assert!(cmd.downcast_ref::<RawCommand>().is_some());
        assert!(cmd.downcast_ref::<Heartbeat>().is_none());
    }

    #[test]
    fn test_heartbeat_never_needs_ack() {
        let heartbeat = Heartbeat::new(1, 0, 0);
        assert!(!heartbeat.header().need_ack);
        assert!(heartbeat.validate().is_ok());

        let mut bad = heartbeat.clone();
        bad.header_mut().need_ack = true;
        assert!(matches!(bad.validate(), Err(ProtocolError::Validation(_))));
    }

    #[test]
    fn test_heartbeat_rejects_body() {
        let mut heartbeat = Heartbeat::from_header(Header::request(1, 0, 0).with_need_ack(false));
        let result = heartbeat.decode_body(Bytes::from_static(b"junk"));
        assert!(matches!(result, Err(ProtocolError::MalformedBody { .. })));
    }
}
