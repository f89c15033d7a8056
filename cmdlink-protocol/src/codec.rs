//! Encoder and decoder for commands.

use crate::command::Command;
use crate::error::ProtocolError;
use crate::frame::{Frame, LengthPlaceholder};
use crate::header::Header;
use crate::registry::CommandFactory;
use crate::MAX_FRAME_LENGTH;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

/// Encodes commands into length-prefixed frames.
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    max_frame_length: u32,
}

impl Encoder {
    pub fn new(max_frame_length: u32) -> Self {
        Self {
            max_frame_length: max_frame_length.min(MAX_FRAME_LENGTH),
        }
    }

    /// Encodes a command into a new buffer.
    pub fn encode(&self, command: &dyn Command) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(64);
        self.encode_into(command, &mut buf)?;
        Ok(buf)
    }

    /// Validates and appends one frame to `buf`: length placeholder, header,
    /// body, then the backpatched length.
    pub fn encode_into(&self, command: &dyn Command, buf: &mut BytesMut) -> Result<u32, ProtocolError> {
        command.validate()?;

        let start = buf.len();
        let placeholder = LengthPlaceholder::reserve(buf);
        command.header().encode(buf);
        if let Err(e) = command.encode_body(buf) {
            buf.truncate(start);
            return Err(e);
        }
        placeholder.backpatch(buf, self.max_frame_length)
    }

    pub fn max_frame_length(&self) -> u32 {
        self.max_frame_length
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_LENGTH)
    }
}

/// Splits buffered bytes into frames and decodes them into commands.
pub struct Decoder {
    buffer: BytesMut,
    factory: Arc<dyn CommandFactory>,
    max_frame_length: u32,
}

impl Decoder {
    pub fn new(factory: Arc<dyn CommandFactory>, max_frame_length: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            factory,
            max_frame_length: max_frame_length.min(MAX_FRAME_LENGTH),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to split the next complete frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer, self.max_frame_length)
    }

    /// Attempts to decode the next command from the buffer.
    ///
    /// Returns `Ok(None)` until a whole frame is buffered. Any error leaves
    /// the stream in an unknown position and must be treated as fatal for the
    /// connection.
    pub fn decode_command(&mut self) -> Result<Option<Box<dyn Command>>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => decode_payload(self.factory.as_ref(), frame.payload).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Decodes header then body of one frame payload.
pub fn decode_payload(
    factory: &dyn CommandFactory,
    mut payload: Bytes,
) -> Result<Box<dyn Command>, ProtocolError> {
    let header = Header::decode(&mut payload)?;
    let command_type = header.command_type;
    let mut command = factory
        .create(header)
        .ok_or(ProtocolError::UnknownCommandType(command_type))?;
    command.decode_body(payload)?;
    command.validate()?;
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Heartbeat, RawCommand};
    use crate::header::{status, REQUEST_HEADER_SIZE};
    use crate::registry::CommandRegistry;
    use crate::LENGTH_FIELD_SIZE;
    use bytes::BufMut;
    use std::any::Any;

    const ECHO: u32 = 10;

    fn decoder() -> Decoder {
        let registry = CommandRegistry::new().with_raw(ECHO).with_heartbeat(0);
        Decoder::new(Arc::new(registry), MAX_FRAME_LENGTH)
    }

    #[test]
    fn test_request_roundtrip() {
        let header = Header::request(42, ECHO, 1_700_000_000_000).with_version(2);
        let request = RawCommand::new(header.clone(), "payload");
        let encoded = Encoder::default().encode(&request).unwrap();

        assert_eq!(
            encoded.len(),
            LENGTH_FIELD_SIZE + REQUEST_HEADER_SIZE + "payload".len()
        );

        let mut decoder = decoder();
        decoder.extend(&encoded);
        let decoded = decoder.decode_command().unwrap().unwrap();

        assert_eq!(decoded.header(), &header);
        let raw = decoded.downcast_ref::<RawCommand>().unwrap();
        assert_eq!(raw.body().as_ref(), b"payload");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_response_roundtrip() {
        let request = Header::request(7, ECHO, 0);
        let header = Header::response_to(&request, 10)
            .with_status(status::ERROR)
            .with_error("no such thing");
        let response = RawCommand::new(header.clone(), Bytes::new());

        let mut decoder = decoder();
        decoder.extend(&Encoder::default().encode(&response).unwrap());
        let decoded = decoder.decode_command().unwrap().unwrap();

        assert_eq!(decoded.header(), &header);
    }

    #[test]
    fn test_partial_frame_decoding() {
        let request = RawCommand::new(Header::request(1, ECHO, 0), "abc");
        let encoded = Encoder::default().encode(&request).unwrap();

        let mut decoder = decoder();
        decoder.extend(&encoded[..10]);
        assert!(decoder.decode_command().unwrap().is_none());

        decoder.extend(&encoded[10..]);
        assert_eq!(decoder.decode_command().unwrap().unwrap().command_id(), 1);
    }

    #[test]
    fn test_one_and_a_half_frames_yield_one_command() {
        let first = Encoder::default()
            .encode(&RawCommand::new(Header::request(1, ECHO, 0), "first"))
            .unwrap();
        let second = Encoder::default()
            .encode(&RawCommand::new(Header::request(2, ECHO, 0), "second"))
            .unwrap();
        let half = second.len() / 2;

        let mut decoder = decoder();
        decoder.extend(&first);
        decoder.extend(&second[..half]);

        assert_eq!(decoder.decode_command().unwrap().unwrap().command_id(), 1);
        assert!(decoder.decode_command().unwrap().is_none());
        assert_eq!(decoder.buffered(), half);

        decoder.extend(&second[half..]);
        assert_eq!(decoder.decode_command().unwrap().unwrap().command_id(), 2);
    }

    #[test]
    fn test_unknown_command_type() {
        let request = RawCommand::new(Header::request(1, 999, 0), "x");
        let mut decoder = decoder();
        decoder.extend(&Encoder::default().encode(&request).unwrap());

        let result = decoder.decode_command();
        assert!(matches!(result, Err(ProtocolError::UnknownCommandType(999))));
    }

    #[test]
    fn test_validation_failure_after_decode() {
        // A heartbeat frame that claims to need an ack.
        let mut buf = BytesMut::new();
        let placeholder = LengthPlaceholder::reserve(&mut buf);
        Header::request(1, 0, 0).encode(&mut buf);
        placeholder.backpatch(&mut buf, MAX_FRAME_LENGTH).unwrap();

        let mut decoder = decoder();
        decoder.extend(&buf);
        let result = decoder.decode_command();
        assert!(matches!(result, Err(ProtocolError::Validation(_))));
    }

    #[test]
    fn test_validation_runs_before_encode() {
        let mut heartbeat = Heartbeat::new(1, 0, 0);
        heartbeat.header_mut().need_ack = true;
        let mut buf = BytesMut::new();
        let result = Encoder::default().encode_into(&heartbeat, &mut buf);
        assert!(matches!(result, Err(ProtocolError::Validation(_))));
        assert!(buf.is_empty());
    }

    #[derive(Debug)]
    struct Failing {
        header: Header,
    }

    impl Command for Failing {
        fn header(&self) -> &Header {
            &self.header
        }
        fn header_mut(&mut self) -> &mut Header {
            &mut self.header
        }
        fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
            buf.put_slice(b"partial");
            Err(ProtocolError::validation("cannot encode"))
        }
        fn decode_body(&mut self, _body: Bytes) -> Result<(), ProtocolError> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_body_encode_failure_leaves_buffer_untouched() {
        let mut buf = BytesMut::from(&b"keep"[..]);
        let failing = Failing {
            header: Header::request(1, ECHO, 0),
        };
        assert!(Encoder::default().encode_into(&failing, &mut buf).is_err());
        assert_eq!(&buf[..], b"keep");
    }

    #[test]
    fn test_oversized_command_rejected() {
        let request = RawCommand::new(Header::request(1, ECHO, 0), vec![0u8; 100]);
        let result = Encoder::new(64).encode(&request);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_decoder_clear() {
        let mut decoder = decoder();
        decoder.extend(b"some data");
        assert_eq!(decoder.buffered(), 9);
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }
}
