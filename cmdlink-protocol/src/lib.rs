//! # cmdlink-protocol
//!
//! Wire protocol implementation for cmdlink.
//!
//! This crate provides:
//! - Length-prefixed binary framing (3-byte big-endian length)
//! - Request/Response command headers
//! - The `Command` trait and built-in commands
//! - A command registry used by the decoder to construct commands by type

pub mod codec;
pub mod command;
pub mod error;
pub mod frame;
pub mod header;
pub mod registry;

pub use codec::{Decoder, Encoder};
pub use command::{Command, Heartbeat, RawCommand};
pub use error::ProtocolError;
pub use frame::{Frame, LengthPlaceholder, LENGTH_FIELD_SIZE};
pub use header::{status, Header, HeaderType, REQUEST_HEADER_SIZE, RESPONSE_HEADER_MIN_SIZE};
pub use registry::{CommandConstructor, CommandFactory, CommandRegistry};

/// Default port for cmdlink services.
pub const DEFAULT_PORT: u16 = 7411;

/// Largest frame length a 3-byte length field can carry (16 MiB - 1).
pub const MAX_FRAME_LENGTH: u32 = 0x00FF_FFFF;
