//! Property-based tests for schema-driven frame parsing.
//!
//! These verify the codec over generated schemas and values, not just
//! hand-picked examples: encode → parse must reproduce the original scalar
//! set (within float tolerance), and batch parsing must agree with iterated
//! parsing on arbitrary buffers.

use fluxgate_frame::{
    ByteOrder, ChecksumSpec, ChecksumType, DataType, FieldDef, FrameParser, FrameSchema,
    FrameType, encode_frame,
};
use proptest::prelude::*;
use serde_json::{Map, Number, Value};
use uuid::Uuid;

const FLOAT32_TOLERANCE: f64 = 1e-5;
const FLOAT64_TOLERANCE: f64 = 1e-10;

fn arbitrary_data_type() -> impl Strategy<Value = DataType> {
    prop_oneof![
        Just(DataType::Uint8),
        Just(DataType::Int8),
        Just(DataType::Uint16),
        Just(DataType::Int16),
        Just(DataType::Uint32),
        Just(DataType::Int32),
        Just(DataType::Uint64),
        Just(DataType::Int64),
        Just(DataType::Float32),
        Just(DataType::Float64),
    ]
}

fn arbitrary_byte_order() -> impl Strategy<Value = ByteOrder> {
    prop_oneof![Just(ByteOrder::Big), Just(ByteOrder::Little)]
}

fn arbitrary_checksum() -> impl Strategy<Value = ChecksumType> {
    prop_oneof![
        Just(ChecksumType::None),
        Just(ChecksumType::Crc16),
        Just(ChecksumType::Crc32),
        Just(ChecksumType::Sum8),
    ]
}

/// Sequentially-packed schema of 1..=6 numeric fields, optionally guarded by
/// a trailing checksum.
fn arbitrary_schema() -> impl Strategy<Value = FrameSchema> {
    (
        prop::collection::vec((arbitrary_data_type(), arbitrary_byte_order()), 1..=6),
        arbitrary_checksum(),
    )
        .prop_map(|(field_specs, checksum_kind)| {
            let mut fields = Vec::with_capacity(field_specs.len());
            let mut offset = 0;
            for (i, (data_type, byte_order)) in field_specs.into_iter().enumerate() {
                let length = data_type.wire_size().unwrap_or(4);
                fields.push(FieldDef {
                    name: format!("field_{i}"),
                    offset,
                    length,
                    data_type,
                    byte_order,
                    scale: None,
                    offset_value: None,
                    description: None,
                });
                offset += length;
            }

            let checksum = match checksum_kind {
                ChecksumType::None => None,
                ChecksumType::Crc16 => {
                    Some(ChecksumSpec { kind: ChecksumType::Crc16, offset, length: 2 })
                },
                ChecksumType::Crc32 => {
                    Some(ChecksumSpec { kind: ChecksumType::Crc32, offset, length: 4 })
                },
                ChecksumType::Sum8 => {
                    Some(ChecksumSpec { kind: ChecksumType::Sum8, offset, length: 1 })
                },
            };
            let total_length = offset + checksum.map_or(0, |c| c.length);

            FrameSchema {
                id: Uuid::new_v4(),
                name: "generated".to_string(),
                version: "1".to_string(),
                protocol_type: None,
                frame_type: FrameType::Fixed,
                total_length,
                header_length: 0,
                delimiter: None,
                fields,
                checksum,
                allow_overlap: false,
            }
        })
}

fn value_for(data_type: DataType, seed: i64) -> Value {
    match data_type {
        DataType::Uint8 => Value::Number(Number::from(seed.unsigned_abs() % (1u64 << 8))),
        DataType::Int8 => Value::Number(Number::from(seed % (1i64 << 7))),
        DataType::Uint16 => Value::Number(Number::from(seed.unsigned_abs() % (1u64 << 16))),
        DataType::Int16 => Value::Number(Number::from(seed % (1i64 << 15))),
        DataType::Uint32 => Value::Number(Number::from(seed.unsigned_abs() % (1u64 << 32))),
        DataType::Int32 => Value::Number(Number::from(seed % (1i64 << 31))),
        // Bounded so the f64 round-trip through the linear map stays exact
        DataType::Uint64 => Value::Number(Number::from(seed.unsigned_abs() % (1u64 << 50))),
        DataType::Int64 => Value::Number(Number::from(seed % (1i64 << 50))),
        DataType::Float32 => {
            Value::Number(Number::from_f64(f64::from(seed as f32 / 64.0)).unwrap_or_else(|| {
                Number::from(0)
            }))
        },
        DataType::Float64 => Value::Number(
            Number::from_f64(seed as f64 / 1024.0).unwrap_or_else(|| Number::from(0)),
        ),
        DataType::String => Value::String(String::new()),
    }
}

fn assert_close(data_type: DataType, original: &Value, parsed: &Value) {
    let (Some(a), Some(b)) = (original.as_f64(), parsed.as_f64()) else {
        panic!("non-numeric values: {original:?} vs {parsed:?}");
    };
    let tolerance = match data_type {
        DataType::Float32 => FLOAT32_TOLERANCE,
        DataType::Float64 => FLOAT64_TOLERANCE,
        _ => 0.0,
    };
    assert!((a - b).abs() <= tolerance, "{a} != {b} for {data_type}");
}

proptest! {
    #[test]
    fn encode_parse_round_trip(schema in arbitrary_schema(), seeds in prop::collection::vec(any::<i64>(), 6)) {
        let mut fields = Map::new();
        for (i, field) in schema.fields.iter().enumerate() {
            fields.insert(field.name.clone(), value_for(field.data_type, seeds[i % seeds.len()]));
        }

        let frame = encode_frame(&schema, &fields).expect("encode");
        let parser = FrameParser::new(schema.clone()).expect("valid schema");
        let parsed = parser.parse(&frame).expect("parse");

        for field in &schema.fields {
            assert_close(field.data_type, &fields[&field.name], &parsed[&field.name]);
        }
    }

    #[test]
    fn batch_parse_matches_iterated_parse(
        schema in arbitrary_schema(),
        buffers in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..8),
    ) {
        let parser = FrameParser::new(schema).expect("valid schema");

        let iterated: Result<Vec<_>, _> = buffers.iter().map(|b| parser.parse(b)).collect();
        let batch = parser.parse_batch(&buffers);

        match (iterated, batch) {
            (Ok(a), Ok(b)) => prop_assert_eq!(a, b),
            (Err(a), Err(b)) => prop_assert_eq!(a, b),
            (a, b) => prop_assert!(false, "batch/iterated disagree: {:?} vs {:?}", a.is_ok(), b.is_ok()),
        }
    }
}
