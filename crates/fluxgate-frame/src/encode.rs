//! Frame encoding: the inverse of [`crate::FrameParser`].
//!
//! Used by raw-transport forwarders to render a transformed payload back into
//! the target's frame layout, and by round-trip tests.

use serde_json::{Map, Value};

use crate::{
    checksum,
    error::FrameError,
    schema::{ByteOrder, ChecksumType, DataType, FieldDef, FrameSchema},
};

/// Render `fields` into wire bytes per `schema`.
///
/// The buffer is `total_length` bytes, zero-filled. Fields absent from the
/// mapping leave their window zeroed. The linear map is inverted
/// (`raw = (value - offset_value) / scale`) before integer conversion, and
/// the checksum field, when declared, is stamped last so it covers the final
/// bytes.
///
/// Frame delimiters are transport concerns and are not appended here.
///
/// # Errors
///
/// - [`FrameError::SchemaInvalid`] if the schema fails validation
/// - [`FrameError::FieldEncode`] if a value does not fit its field
pub fn encode_frame(
    schema: &FrameSchema,
    fields: &Map<String, Value>,
) -> Result<Vec<u8>, FrameError> {
    schema.validate()?;

    let mut frame = vec![0u8; schema.total_length];

    for field in &schema.fields {
        let Some(value) = fields.get(&field.name) else {
            continue;
        };
        encode_field(&mut frame, field, value)?;
    }

    if let Some(spec) = &schema.checksum {
        if spec.kind != ChecksumType::None {
            let calculated = checksum::compute(spec.kind, &frame[..spec.offset]);
            let window = &mut frame[spec.offset..spec.offset + spec.length];
            // Big-endian, matching extraction on the parse side
            for (i, slot) in window.iter_mut().rev().enumerate() {
                *slot = (calculated >> (8 * i)) as u8;
            }
        }
    }

    Ok(frame)
}

fn encode_field(frame: &mut [u8], field: &FieldDef, value: &Value) -> Result<(), FrameError> {
    let window = &mut frame[field.offset..field.offset + field.length];

    if field.data_type == DataType::String {
        let text = value.as_str().ok_or_else(|| reject(field, "expected a string"))?;
        let bytes = text.as_bytes();
        if bytes.len() > window.len() {
            return Err(reject(field, "string longer than field"));
        }
        window[..bytes.len()].copy_from_slice(bytes);
        return Ok(());
    }

    let scalar = value.as_f64().ok_or_else(|| reject(field, "expected a number"))?;
    let raw = (scalar - field.offset_value.unwrap_or(0.0)) / field.scale.unwrap_or(1.0);

    macro_rules! put {
        ($ty:ty, $raw:expr) => {{
            let v = $raw as $ty;
            let bytes = match field.byte_order {
                ByteOrder::Big => v.to_be_bytes(),
                ByteOrder::Little => v.to_le_bytes(),
            };
            window.copy_from_slice(&bytes);
        }};
    }

    let rounded = raw.round();
    match field.data_type {
        DataType::Uint8 => put!(u8, rounded),
        DataType::Int8 => put!(i8, rounded),
        DataType::Uint16 => put!(u16, rounded),
        DataType::Int16 => put!(i16, rounded),
        DataType::Uint32 => put!(u32, rounded),
        DataType::Int32 => put!(i32, rounded),
        DataType::Uint64 => put!(u64, rounded),
        DataType::Int64 => put!(i64, rounded),
        DataType::Float32 => put!(f32, raw),
        DataType::Float64 => put!(f64, raw),
        DataType::String => unreachable!("handled above"),
    }

    Ok(())
}

fn reject(field: &FieldDef, reason: &str) -> FrameError {
    FrameError::FieldEncode { field: field.name.clone(), reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::{
        FrameParser,
        schema::{ChecksumSpec, FrameType},
    };

    fn schema() -> FrameSchema {
        FrameSchema {
            id: Uuid::new_v4(),
            name: "telemetry".to_string(),
            version: "1".to_string(),
            protocol_type: None,
            frame_type: FrameType::Fixed,
            total_length: 11,
            header_length: 0,
            delimiter: None,
            fields: vec![
                FieldDef {
                    name: "seq".to_string(),
                    offset: 0,
                    length: 2,
                    data_type: DataType::Uint16,
                    byte_order: ByteOrder::Big,
                    scale: None,
                    offset_value: None,
                    description: None,
                },
                FieldDef {
                    name: "reading".to_string(),
                    offset: 2,
                    length: 4,
                    data_type: DataType::Float32,
                    byte_order: ByteOrder::Little,
                    scale: None,
                    offset_value: None,
                    description: None,
                },
                FieldDef {
                    name: "unit".to_string(),
                    offset: 6,
                    length: 3,
                    data_type: DataType::String,
                    byte_order: ByteOrder::Big,
                    scale: None,
                    offset_value: None,
                    description: None,
                },
            ],
            checksum: Some(ChecksumSpec { kind: ChecksumType::Crc16, offset: 9, length: 2 }),
            allow_overlap: false,
        }
    }

    #[test]
    fn encode_parse_round_trip() {
        let schema = schema();
        let mut fields = Map::new();
        fields.insert("seq".to_string(), json!(512));
        fields.insert("reading".to_string(), json!(21.75));
        fields.insert("unit".to_string(), json!("C"));

        let frame = encode_frame(&schema, &fields).expect("encode");
        assert_eq!(frame.len(), 11);

        let parser = FrameParser::new(schema).expect("valid schema");
        let parsed = parser.parse(&frame).expect("checksum stamped correctly");
        assert_eq!(parsed["seq"], json!(512));
        let reading = parsed["reading"].as_f64().expect("number");
        assert!((reading - 21.75).abs() < 1e-5);
        assert_eq!(parsed["unit"], json!("C"));
    }

    #[test]
    fn missing_fields_leave_zeroes() {
        let schema = schema();
        let frame = encode_frame(&schema, &Map::new()).expect("encode");
        assert!(frame[..9].iter().all(|&b| b == 0));
    }

    #[test]
    fn oversized_string_rejected() {
        let schema = schema();
        let mut fields = Map::new();
        fields.insert("unit".to_string(), json!("kelvin"));
        assert!(matches!(
            encode_frame(&schema, &fields),
            Err(FrameError::FieldEncode { .. })
        ));
    }

    #[test]
    fn inverts_linear_map() {
        let mut schema = schema();
        schema.fields[0].scale = Some(0.1);
        schema.fields[0].offset_value = Some(-40.0);

        let mut fields = Map::new();
        // 25.0 = raw 650 * 0.1 - 40.0
        fields.insert("seq".to_string(), json!(25.0));

        let frame = encode_frame(&schema, &fields).expect("encode");
        assert_eq!(u16::from_be_bytes([frame[0], frame[1]]), 650);
    }
}
