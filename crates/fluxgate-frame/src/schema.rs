//! Declarative frame layout description.
//!
//! A schema is authored as JSON by an operator, imported once, validated, and
//! then treated as immutable. The layout invariants checked here are what let
//! the parser slice buffers without per-field bounds checks at runtime.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FrameError;

/// Scalar type of a single frame field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    /// Unsigned 8-bit integer.
    Uint8,
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 16-bit integer.
    Uint16,
    /// Signed 16-bit integer.
    Int16,
    /// Unsigned 32-bit integer.
    Uint32,
    /// Signed 32-bit integer.
    Int32,
    /// Unsigned 64-bit integer.
    Uint64,
    /// Signed 64-bit integer.
    Int64,
    /// IEEE 754 single-precision float.
    Float32,
    /// IEEE 754 double-precision float.
    Float64,
    /// UTF-8 text, NUL-padded on the wire.
    String,
}

impl DataType {
    /// Wire size in bytes, or `None` for variable-length types.
    #[must_use]
    pub fn wire_size(self) -> Option<usize> {
        match self {
            Self::Uint8 | Self::Int8 => Some(1),
            Self::Uint16 | Self::Int16 => Some(2),
            Self::Uint32 | Self::Int32 | Self::Float32 => Some(4),
            Self::Uint64 | Self::Int64 | Self::Float64 => Some(8),
            Self::String => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uint8 => "UINT8",
            Self::Int8 => "INT8",
            Self::Uint16 => "UINT16",
            Self::Int16 => "INT16",
            Self::Uint32 => "UINT32",
            Self::Int32 => "INT32",
            Self::Uint64 => "UINT64",
            Self::Int64 => "INT64",
            Self::Float32 => "FLOAT32",
            Self::Float64 => "FLOAT64",
            Self::String => "STRING",
        };
        f.write_str(name)
    }
}

/// Byte order of a multi-byte field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Network byte order (most significant byte first).
    #[default]
    #[serde(rename = "BIG_ENDIAN")]
    Big,
    /// Least significant byte first.
    #[serde(rename = "LITTLE_ENDIAN")]
    Little,
}

/// Checksum algorithm guarding a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChecksumType {
    /// No integrity check.
    #[default]
    None,
    /// CRC16 MODBUS (poly 0xA001, init 0xFFFF, LSB-first).
    Crc16,
    /// CRC32 IEEE.
    Crc32,
    /// Sum of all bytes modulo 256.
    Sum8,
}

/// Location and algorithm of the frame checksum field.
///
/// The checksum is recomputed over `[0, offset)`, so the field always excludes
/// itself from its own window. The stored value is read big-endian regardless
/// of the data fields' byte orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSpec {
    /// Checksum algorithm.
    #[serde(rename = "type")]
    pub kind: ChecksumType,
    /// Byte offset of the checksum field.
    pub offset: usize,
    /// Length of the checksum field in bytes (1-8).
    pub length: usize,
}

/// Framing strategy for stream transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    /// Every frame is exactly `total_length` bytes.
    Fixed,
    /// Frames are separated by a delimiter byte sequence.
    Delimited,
    /// The first `header_length` bytes carry a big-endian length of the rest.
    LengthPrefixed,
}

/// One named field inside a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name; becomes the key in the parsed mapping.
    pub name: String,
    /// Byte offset from the start of the frame.
    pub offset: usize,
    /// Field length in bytes.
    pub length: usize,
    /// Scalar type.
    pub data_type: DataType,
    /// Byte order for multi-byte values.
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Multiplier applied to the raw value (`value = raw * scale + offset_value`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    /// Additive offset applied after scaling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_value: Option<f64>,
    /// Free-form operator note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldDef {
    fn end(&self) -> usize {
        self.offset.saturating_add(self.length)
    }
}

/// Immutable frame layout: identity, framing, fields, and integrity check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSchema {
    /// Schema identity.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Human-readable schema name.
    pub name: String,
    /// Operator-assigned version string.
    pub version: String,
    /// Source protocol the schema was authored for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_type: Option<String>,
    /// Framing strategy.
    pub frame_type: FrameType,
    /// Total frame length in bytes. For variable-length framing this is the
    /// minimum length a frame must have for all field windows to be valid.
    pub total_length: usize,
    /// Header length; for [`FrameType::LengthPrefixed`] this is also the size
    /// of the length prefix (1-8 bytes, big-endian).
    #[serde(default)]
    pub header_length: usize,
    /// Frame delimiter for [`FrameType::Delimited`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    /// Ordered field definitions.
    pub fields: Vec<FieldDef>,
    /// Optional trailing integrity check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ChecksumSpec>,
    /// Permit overlapping field windows (aliased views of the same bytes).
    #[serde(default)]
    pub allow_overlap: bool,
}

impl FrameSchema {
    /// Import a schema from its JSON description.
    ///
    /// The imported schema is validated before it is returned; an id is
    /// generated when the document does not carry one.
    ///
    /// # Errors
    ///
    /// - [`FrameError::SchemaImport`] if the document does not deserialize
    /// - [`FrameError::SchemaInvalid`] if a layout invariant fails
    pub fn from_json(json: &str) -> Result<Self, FrameError> {
        let schema: Self =
            serde_json::from_str(json).map_err(|e| FrameError::SchemaImport(e.to_string()))?;
        schema.validate()?;
        Ok(schema)
    }

    /// Check every layout invariant the parser relies on.
    ///
    /// Called at registration so that malformed schemas are rejected before
    /// any message flows against them.
    ///
    /// # Errors
    ///
    /// [`FrameError::SchemaInvalid`] naming the violated invariant.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.total_length == 0 {
            return self.invalid("total_length must be non-zero");
        }
        if self.fields.is_empty() {
            return self.invalid("schema defines no fields");
        }

        match self.frame_type {
            FrameType::Delimited => {
                if self.delimiter.as_deref().is_none_or(str::is_empty) {
                    return self.invalid("delimited framing requires a delimiter");
                }
            },
            FrameType::LengthPrefixed => {
                if !(1..=8).contains(&self.header_length) {
                    return self.invalid("length-prefixed framing requires header_length in 1..=8");
                }
            },
            FrameType::Fixed => {},
        }

        for field in &self.fields {
            if field.length == 0 {
                return self.invalid(&format!("field `{}` has zero length", field.name));
            }
            if field.end() > self.total_length {
                return self.invalid(&format!(
                    "field `{}` spans [{}, {}) outside frame of {} bytes",
                    field.name,
                    field.offset,
                    field.end(),
                    self.total_length
                ));
            }
            if let Some(size) = field.data_type.wire_size() {
                if field.length != size {
                    return self.invalid(&format!(
                        "field `{}` is {} bytes but {} requires {}",
                        field.name, field.length, field.data_type, size
                    ));
                }
            }
        }

        if !self.allow_overlap {
            let mut windows: Vec<(usize, usize, &str)> =
                self.fields.iter().map(|f| (f.offset, f.end(), f.name.as_str())).collect();
            windows.sort_unstable();
            for pair in windows.windows(2) {
                if pair[1].0 < pair[0].1 {
                    return self.invalid(&format!(
                        "fields `{}` and `{}` overlap",
                        pair[0].2, pair[1].2
                    ));
                }
            }
        }

        if let Some(spec) = &self.checksum {
            if spec.kind != ChecksumType::None {
                if !(1..=8).contains(&spec.length) {
                    return self.invalid("checksum length must be in 1..=8");
                }
                if spec.offset.saturating_add(spec.length) > self.total_length {
                    return self.invalid("checksum field extends past the frame");
                }
                if spec.offset == 0 {
                    return self.invalid("checksum window [0, offset) would be empty");
                }
            }
        }

        Ok(())
    }

    /// Checksum algorithm, or [`ChecksumType::None`] when unguarded.
    #[must_use]
    pub fn checksum_type(&self) -> ChecksumType {
        self.checksum.map_or(ChecksumType::None, |c| c.kind)
    }

    /// Delimiter as raw bytes, for stream segmentation.
    #[must_use]
    pub fn delimiter_bytes(&self) -> Option<&[u8]> {
        self.delimiter.as_deref().map(str::as_bytes)
    }

    fn invalid<T>(&self, reason: &str) -> Result<T, FrameError> {
        Err(FrameError::SchemaInvalid { name: self.name.clone(), reason: reason.to_string() })
    }
}
