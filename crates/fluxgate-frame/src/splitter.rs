//! Stream segmentation for byte-oriented transports.
//!
//! TCP delivers a byte stream, not frames. A `FrameSplitter` owns the
//! per-connection accumulation buffer and yields one complete frame at a time
//! according to the schema's framing strategy. Partial reads stay buffered
//! until the rest of the frame arrives.

use bytes::{Buf, Bytes, BytesMut};

use crate::schema::{FrameSchema, FrameType};

/// Per-connection frame boundary detector.
///
/// Feed raw reads with [`FrameSplitter::extend`], then drain complete frames
/// with [`FrameSplitter::next_frame`] until it returns `None`.
#[derive(Debug)]
pub struct FrameSplitter {
    frame_type: FrameType,
    total_length: usize,
    header_length: usize,
    delimiter: Option<Vec<u8>>,
    buffer: BytesMut,
}

impl FrameSplitter {
    /// Build a splitter for `schema`.
    #[must_use]
    pub fn new(schema: &FrameSchema) -> Self {
        Self {
            frame_type: schema.frame_type,
            total_length: schema.total_length,
            header_length: schema.header_length,
            delimiter: schema.delimiter_bytes().map(<[u8]>::to_vec),
            buffer: BytesMut::with_capacity(schema.total_length.max(1024)),
        }
    }

    /// Append a raw read to the accumulation buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes currently buffered without a complete frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, or `None` if more bytes are needed.
    ///
    /// Delimited frames are returned without their trailing delimiter;
    /// length-prefixed frames are returned whole (prefix included) so field
    /// offsets keep their meaning.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        match self.frame_type {
            FrameType::Fixed => self.next_fixed(),
            FrameType::Delimited => self.next_delimited(),
            FrameType::LengthPrefixed => self.next_length_prefixed(),
        }
    }

    fn next_fixed(&mut self) -> Option<Bytes> {
        if self.buffer.len() < self.total_length {
            return None;
        }
        Some(self.buffer.split_to(self.total_length).freeze())
    }

    fn next_delimited(&mut self) -> Option<Bytes> {
        let delimiter = self.delimiter.as_deref()?;
        let at = find(&self.buffer, delimiter)?;
        let frame = self.buffer.split_to(at).freeze();
        self.buffer.advance(delimiter.len());
        Some(frame)
    }

    fn next_length_prefixed(&mut self) -> Option<Bytes> {
        if self.buffer.len() < self.header_length {
            return None;
        }
        let body_len = self.buffer[..self.header_length]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
        let frame_len = self.header_length + body_len;
        if self.buffer.len() < frame_len {
            return None;
        }
        Some(self.buffer.split_to(frame_len).freeze())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
