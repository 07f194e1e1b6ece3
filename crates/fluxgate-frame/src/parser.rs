//! Frame decoding against a validated schema.

use serde_json::{Map, Number, Value};

use crate::{
    checksum,
    error::FrameError,
    schema::{ByteOrder, ChecksumType, DataType, FieldDef, FrameSchema},
};

/// Parsed frame content: field name to scalar value, in schema field order.
pub type ParsedFields = Map<String, Value>;

/// Decodes byte buffers into named scalar mappings per a [`FrameSchema`].
///
/// Construction validates the schema, so `parse` can slice field windows
/// without re-checking layout invariants per message.
#[derive(Debug, Clone)]
pub struct FrameParser {
    schema: FrameSchema,
}

impl FrameParser {
    /// Build a parser for `schema`.
    ///
    /// # Errors
    ///
    /// [`FrameError::SchemaInvalid`] if the schema fails validation; a parser
    /// is never constructed over an invalid layout.
    pub fn new(schema: FrameSchema) -> Result<Self, FrameError> {
        schema.validate()?;
        Ok(Self { schema })
    }

    /// The schema this parser decodes against.
    #[must_use]
    pub fn schema(&self) -> &FrameSchema {
        &self.schema
    }

    /// Decode one frame.
    ///
    /// Checks length, verifies the checksum when one is declared, then decodes
    /// every field in schema order. String fields are trimmed of trailing NUL
    /// bytes and decoded as lossy UTF-8; numeric fields honor the field's byte
    /// order and the optional `value = raw * scale + offset_value` linear map.
    ///
    /// # Errors
    ///
    /// - [`FrameError::InsufficientData`] if the buffer is short
    /// - [`FrameError::ChecksumMismatch`] if the integrity check fails
    /// - [`FrameError::FieldOutOfBounds`] if a field window cannot be sliced
    pub fn parse(&self, raw: &[u8]) -> Result<ParsedFields, FrameError> {
        if raw.len() < self.schema.total_length {
            return Err(FrameError::InsufficientData {
                expected: self.schema.total_length,
                actual: raw.len(),
            });
        }

        self.verify_checksum(raw)?;

        let mut parsed = Map::with_capacity(self.schema.fields.len());
        for field in &self.schema.fields {
            let value = self.parse_field(raw, field)?;
            parsed.insert(field.name.clone(), value);
        }

        Ok(parsed)
    }

    /// Decode a batch of frames, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// The first error any frame produces; earlier successes are discarded.
    pub fn parse_batch<B: AsRef<[u8]>>(
        &self,
        frames: &[B],
    ) -> Result<Vec<ParsedFields>, FrameError> {
        frames.iter().map(|frame| self.parse(frame.as_ref())).collect()
    }

    fn verify_checksum(&self, raw: &[u8]) -> Result<(), FrameError> {
        let Some(spec) = &self.schema.checksum else {
            return Ok(());
        };
        if spec.kind == ChecksumType::None {
            return Ok(());
        }

        let window = raw.get(spec.offset..spec.offset + spec.length).ok_or(
            FrameError::FieldOutOfBounds {
                field: "checksum".to_string(),
                offset: spec.offset,
                end: spec.offset + spec.length,
                total: raw.len(),
            },
        )?;

        // Checksum field is stored big-endian regardless of field byte orders
        let expected = window.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
        let calculated = checksum::compute(spec.kind, &raw[..spec.offset]);

        if expected != calculated {
            return Err(FrameError::ChecksumMismatch { expected, calculated });
        }

        Ok(())
    }

    fn parse_field(&self, raw: &[u8], field: &FieldDef) -> Result<Value, FrameError> {
        let end = field.offset + field.length;
        let window = raw.get(field.offset..end).ok_or(FrameError::FieldOutOfBounds {
            field: field.name.clone(),
            offset: field.offset,
            end,
            total: raw.len(),
        })?;

        if field.data_type == DataType::String {
            let trimmed = trim_trailing_nul(window);
            return Ok(Value::String(String::from_utf8_lossy(trimmed).into_owned()));
        }

        let raw_value = decode_numeric(field, window)?;
        Ok(apply_linear(field, raw_value))
    }
}

/// Raw numeric field value before the linear map is applied.
#[derive(Debug, Clone, Copy)]
enum RawNumber {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

impl RawNumber {
    fn as_f64(self) -> f64 {
        match self {
            Self::Unsigned(v) => v as f64,
            Self::Signed(v) => v as f64,
            Self::Float(v) => v,
        }
    }
}

fn decode_numeric(field: &FieldDef, window: &[u8]) -> Result<RawNumber, FrameError> {
    let mismatch = || FrameError::UnknownDataType {
        field: field.name.clone(),
        length: field.length,
        data_type: field.data_type.to_string(),
    };

    macro_rules! read {
        ($ty:ty) => {{
            let bytes: [u8; size_of::<$ty>()] = window.try_into().map_err(|_| mismatch())?;
            match field.byte_order {
                ByteOrder::Big => <$ty>::from_be_bytes(bytes),
                ByteOrder::Little => <$ty>::from_le_bytes(bytes),
            }
        }};
    }

    Ok(match field.data_type {
        DataType::Uint8 => RawNumber::Unsigned(u64::from(read!(u8))),
        DataType::Int8 => RawNumber::Signed(i64::from(read!(i8))),
        DataType::Uint16 => RawNumber::Unsigned(u64::from(read!(u16))),
        DataType::Int16 => RawNumber::Signed(i64::from(read!(i16))),
        DataType::Uint32 => RawNumber::Unsigned(u64::from(read!(u32))),
        DataType::Int32 => RawNumber::Signed(i64::from(read!(i32))),
        DataType::Uint64 => RawNumber::Unsigned(read!(u64)),
        DataType::Int64 => RawNumber::Signed(read!(i64)),
        DataType::Float32 => RawNumber::Float(f64::from(read!(f32))),
        DataType::Float64 => RawNumber::Float(read!(f64)),
        DataType::String => return Err(mismatch()),
    })
}

/// Apply `value = raw * scale + offset_value`. Integer fields stay integers
/// when neither coefficient is set.
fn apply_linear(field: &FieldDef, raw: RawNumber) -> Value {
    if field.scale.is_none() && field.offset_value.is_none() {
        return match raw {
            RawNumber::Unsigned(v) => Value::Number(Number::from(v)),
            RawNumber::Signed(v) => Value::Number(Number::from(v)),
            RawNumber::Float(v) => float_value(v),
        };
    }

    let scaled = raw.as_f64() * field.scale.unwrap_or(1.0) + field.offset_value.unwrap_or(0.0);
    float_value(scaled)
}

fn float_value(v: f64) -> Value {
    // NaN and infinity have no JSON representation
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn trim_trailing_nul(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && data[end - 1] == 0 {
        end -= 1;
    }
    &data[..end]
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::schema::{ChecksumSpec, FrameType};

    fn field(name: &str, offset: usize, length: usize, data_type: DataType) -> FieldDef {
        FieldDef {
            name: name.to_string(),
            offset,
            length,
            data_type,
            byte_order: ByteOrder::Big,
            scale: None,
            offset_value: None,
            description: None,
        }
    }

    fn schema(fields: Vec<FieldDef>, total_length: usize) -> FrameSchema {
        FrameSchema {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            version: "1".to_string(),
            protocol_type: None,
            frame_type: FrameType::Fixed,
            total_length,
            header_length: 0,
            delimiter: None,
            fields,
            checksum: None,
            allow_overlap: false,
        }
    }

    fn sensor_parser() -> FrameParser {
        let mut temperature = field("temperature", 0, 4, DataType::Float32);
        temperature.byte_order = ByteOrder::Little;
        let mut humidity = field("humidity", 4, 4, DataType::Float32);
        humidity.byte_order = ByteOrder::Little;
        FrameParser::new(schema(vec![temperature, humidity], 8)).expect("valid schema")
    }

    #[test]
    fn parses_little_endian_floats() {
        let parser = sensor_parser();
        let mut frame = Vec::new();
        frame.extend_from_slice(&25.5f32.to_le_bytes());
        frame.extend_from_slice(&60.0f32.to_le_bytes());

        let parsed = parser.parse(&frame).expect("parse");
        let temp = parsed["temperature"].as_f64().expect("number");
        let hum = parsed["humidity"].as_f64().expect("number");
        assert!((temp - 25.5).abs() < 1e-5);
        assert!((hum - 60.0).abs() < 1e-5);
    }

    #[test]
    fn short_frame_is_insufficient_data() {
        let parser = sensor_parser();
        let err = parser.parse(&[0x01, 0x02, 0x03]).expect_err("short");
        assert_eq!(err, FrameError::InsufficientData { expected: 8, actual: 3 });
    }

    #[test]
    fn integer_fields_stay_integers() {
        let parser = FrameParser::new(schema(
            vec![field("seq", 0, 2, DataType::Uint16), field("level", 2, 1, DataType::Int8)],
            3,
        ))
        .expect("valid schema");

        let parsed = parser.parse(&[0x01, 0x02, 0xFF]).expect("parse");
        assert_eq!(parsed["seq"], json!(0x0102));
        assert_eq!(parsed["level"], json!(-1));
    }

    #[test]
    fn scale_and_offset_applied() {
        let mut raw_temp = field("temp", 0, 2, DataType::Uint16);
        raw_temp.scale = Some(0.1);
        raw_temp.offset_value = Some(-40.0);
        let parser = FrameParser::new(schema(vec![raw_temp], 2)).expect("valid schema");

        // raw 650 -> 650 * 0.1 - 40.0 = 25.0
        let parsed = parser.parse(&650u16.to_be_bytes()).expect("parse");
        let value = parsed["temp"].as_f64().expect("number");
        assert!((value - 25.0).abs() < 1e-10);
    }

    #[test]
    fn string_field_trims_trailing_nul() {
        let parser = FrameParser::new(schema(vec![field("tag", 0, 8, DataType::String)], 8))
            .expect("valid schema");

        let parsed = parser.parse(b"pump\x00\x00\x00\x00").expect("parse");
        assert_eq!(parsed["tag"], json!("pump"));
    }

    #[test]
    fn crc16_guard_accepts_valid_and_rejects_corrupt() {
        let mut schema = schema(vec![field("a", 0, 4, DataType::Uint32)], 6);
        schema.checksum = Some(ChecksumSpec { kind: ChecksumType::Crc16, offset: 4, length: 2 });
        let parser = FrameParser::new(schema).expect("valid schema");

        let mut frame = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let crc = crate::checksum::crc16_modbus(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        assert!(parser.parse(&frame).is_ok());

        frame[5] ^= 0xFF;
        assert!(matches!(parser.parse(&frame), Err(FrameError::ChecksumMismatch { .. })));
    }

    #[test]
    fn sum8_guard() {
        let mut schema = schema(vec![field("a", 0, 2, DataType::Uint16)], 3);
        schema.checksum = Some(ChecksumSpec { kind: ChecksumType::Sum8, offset: 2, length: 1 });
        let parser = FrameParser::new(schema).expect("valid schema");

        let frame = [0x10, 0x20, 0x30];
        assert!(parser.parse(&frame).is_ok());

        let bad = [0x10, 0x20, 0x31];
        assert!(parser.parse(&bad).is_err());
    }

    #[test]
    fn batch_short_circuits_on_first_error() {
        let parser = sensor_parser();
        let good: Vec<u8> =
            [25.5f32.to_le_bytes(), 60.0f32.to_le_bytes()].concat();
        let frames: Vec<Vec<u8>> = vec![good.clone(), vec![0x00], good];

        assert!(matches!(
            parser.parse_batch(&frames),
            Err(FrameError::InsufficientData { .. })
        ));
    }
}
