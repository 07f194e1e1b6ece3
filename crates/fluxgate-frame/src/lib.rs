//! Frame schema model and binary field codec.
//!
//! Operators describe device frames declaratively: a [`FrameSchema`] names a
//! byte layout (fixed, delimited, or length-prefixed), an ordered set of typed
//! fields, and an optional trailing checksum. A [`FrameParser`] turns a byte
//! buffer into a named scalar mapping according to that schema; the inverse
//! direction ([`encode_frame`]) renders a scalar mapping back into wire bytes
//! for egress over raw transports.
//!
//! Schemas are validated once at registration ([`FrameSchema::validate`]) so
//! that per-message parsing never has to re-check layout invariants.
//!
//! [`FrameSplitter`] segments a TCP byte stream into individual frames using
//! the same layout description, accumulating partial reads until a complete
//! frame is available.

#![forbid(unsafe_code)]

mod checksum;
mod encode;
mod error;
mod parser;
mod schema;
mod splitter;

pub use checksum::{crc16_modbus, crc32_ieee, sum8};
pub use encode::encode_frame;
pub use error::FrameError;
pub use parser::{FrameParser, ParsedFields};
pub use schema::{
    ByteOrder, ChecksumSpec, ChecksumType, DataType, FieldDef, FrameSchema, FrameType,
};
pub use splitter::FrameSplitter;

/// Convenience result alias for frame operations.
pub type Result<T> = std::result::Result<T, FrameError>;
