//! Shared fixtures for transport integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use fluxgate_core::{Envelope, EventBus, bus::BusEvent};
use fluxgate_frame::{ByteOrder, DataType, FieldDef, FrameSchema, FrameType};
use uuid::Uuid;

/// Subscribe to `topic` and collect every envelope published on it.
pub fn collect_envelopes(bus: &EventBus, topic: &str) -> Arc<Mutex<Vec<Arc<Envelope>>>> {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    bus.subscribe(topic, move |event, _, _| {
        if let BusEvent::Message(envelope) = event {
            sink.lock().expect("lock").push(Arc::clone(envelope));
        }
        Ok(())
    });
    collected
}

/// Poll until `collected` holds at least `count` envelopes (5 s deadline).
pub async fn wait_for_envelopes(collected: &Arc<Mutex<Vec<Arc<Envelope>>>>, count: usize) {
    let deadline = tokio::time::Duration::from_secs(5);
    let waited = tokio::time::timeout(deadline, async {
        loop {
            if collected.lock().expect("lock").len() >= count {
                return;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "never saw {count} envelopes");
}

/// Fixed 8-byte schema: two little-endian FLOAT32 fields.
pub fn sensor_schema() -> FrameSchema {
    FrameSchema {
        id: Uuid::new_v4(),
        name: "temperature-sensor".to_string(),
        version: "1.0.0".to_string(),
        protocol_type: None,
        frame_type: FrameType::Fixed,
        total_length: 8,
        header_length: 0,
        delimiter: None,
        fields: vec![
            FieldDef {
                name: "temperature".to_string(),
                offset: 0,
                length: 4,
                data_type: DataType::Float32,
                byte_order: ByteOrder::Little,
                scale: None,
                offset_value: None,
                description: None,
            },
            FieldDef {
                name: "humidity".to_string(),
                offset: 4,
                length: 4,
                data_type: DataType::Float32,
                byte_order: ByteOrder::Little,
                scale: None,
                offset_value: None,
                description: None,
            },
        ],
        checksum: None,
        allow_overlap: false,
    }
}

/// Encode a sensor frame for [`sensor_schema`].
pub fn sensor_frame(temperature: f32, humidity: f32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.extend_from_slice(&temperature.to_le_bytes());
    frame.extend_from_slice(&humidity.to_le_bytes());
    frame
}
