//! Frame schema and parse errors.

use thiserror::Error;

/// Errors raised while validating a schema or decoding a frame against it.
///
/// The `Schema*` variants are registration-time failures: a schema that does
/// not uphold its layout invariants is rejected before any traffic can reach
/// it. The remaining variants occur per message and decorate the envelope
/// instead of aborting the adapter that observed them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    /// Buffer is shorter than the schema's total frame length.
    #[error("insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData {
        /// Bytes required by the schema.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Recomputed checksum does not match the checksum field.
    #[error("checksum mismatch: expected {expected:#x}, calculated {calculated:#x}")]
    ChecksumMismatch {
        /// Value carried in the frame's checksum field.
        expected: u64,
        /// Value recomputed over the checksum window.
        calculated: u64,
    },

    /// Field declares a length that is invalid for its data type.
    #[error("field `{field}`: {length} bytes cannot hold {data_type}")]
    UnknownDataType {
        /// Field name from the schema.
        field: String,
        /// Declared field length.
        length: usize,
        /// Declared data type.
        data_type: String,
    },

    /// Field window extends past the end of the frame.
    #[error("field `{field}` spans [{offset}, {end}) outside frame of {total} bytes")]
    FieldOutOfBounds {
        /// Field name from the schema.
        field: String,
        /// Field start offset.
        offset: usize,
        /// Field end offset (exclusive).
        end: usize,
        /// Total frame length.
        total: usize,
    },

    /// A scalar value could not be rendered into its field window.
    #[error("field `{field}` cannot be encoded: {reason}")]
    FieldEncode {
        /// Field name from the schema.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Schema failed a registration-time invariant.
    #[error("invalid schema `{name}`: {reason}")]
    SchemaInvalid {
        /// Schema name.
        name: String,
        /// Violated invariant.
        reason: String,
    },

    /// Schema JSON import could not be deserialized.
    #[error("schema import failed: {0}")]
    SchemaImport(String),
}
