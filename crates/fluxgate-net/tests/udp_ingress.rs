//! UDP adapter: datagrams become envelopes, lifecycle is well-behaved.

mod support;

use std::sync::Arc;

use fluxgate_core::{EventBus, Protocol, bus::topics};
use fluxgate_net::adapters::{AdapterState, Ingress, UdpAdapter, UdpAdapterConfig};
use support::{collect_envelopes, sensor_frame, sensor_schema, wait_for_envelopes};

fn adapter(bus: &Arc<EventBus>, auto_parse: bool) -> UdpAdapter {
    let config = UdpAdapterConfig {
        listen_address: "127.0.0.1".to_string(),
        listen_port: 0,
        source_id: Some("plant-a".to_string()),
        auto_parse,
        ..Default::default()
    };
    let schema = auto_parse.then(sensor_schema);
    UdpAdapter::new("udp-in", config, Arc::clone(bus), schema).expect("adapter")
}

#[tokio::test]
async fn datagram_becomes_envelope() {
    let bus = Arc::new(EventBus::new());
    let received = collect_envelopes(&bus, Protocol::Udp.received_topic());

    let adapter = adapter(&bus, false);
    adapter.start().await.expect("start");
    let addr = adapter.local_addr().expect("bound");

    let sender = std::net::UdpSocket::bind("127.0.0.1:0").expect("sender");
    sender.send_to(&sensor_frame(25.5, 60.0), addr).expect("send");

    wait_for_envelopes(&received, 1).await;
    let envelope = received.lock().expect("lock")[0].clone();
    assert_eq!(envelope.source_protocol, Some(Protocol::Udp));
    assert_eq!(envelope.adapter_name.as_deref(), Some("udp-in"));
    assert_eq!(envelope.source_id.as_deref(), Some("plant-a"));
    assert_eq!(envelope.raw_data.as_deref(), Some(&sensor_frame(25.5, 60.0)[..]));
    assert!(envelope.source_address.is_some());

    let stats = adapter.stats();
    assert_eq!(stats.messages_received, 1);
    assert_eq!(stats.bytes_received, 8);

    adapter.stop().await.expect("stop");
    assert_eq!(adapter.state(), AdapterState::Stopped);
}

#[tokio::test]
async fn auto_parse_publishes_data_parsed_inline() {
    let bus = Arc::new(EventBus::new());
    let parsed = collect_envelopes(&bus, topics::DATA_PARSED);

    let adapter = adapter(&bus, true);
    adapter.start().await.expect("start");
    let addr = adapter.local_addr().expect("bound");

    let sender = std::net::UdpSocket::bind("127.0.0.1:0").expect("sender");
    sender.send_to(&sensor_frame(21.25, 40.0), addr).expect("send");

    wait_for_envelopes(&parsed, 1).await;
    let envelope = parsed.lock().expect("lock")[0].clone();
    let fields = envelope.parsed_data.as_ref().expect("parsed");
    let temperature = fields["temperature"].as_f64().expect("temperature");
    assert!((temperature - 21.25).abs() < 1e-5);

    adapter.stop().await.expect("stop");
}

#[tokio::test]
async fn short_datagram_is_decorated_not_dropped() {
    let bus = Arc::new(EventBus::new());
    let received = collect_envelopes(&bus, Protocol::Udp.received_topic());
    let parsed = collect_envelopes(&bus, topics::DATA_PARSED);

    let adapter = adapter(&bus, true);
    adapter.start().await.expect("start");
    let addr = adapter.local_addr().expect("bound");

    let sender = std::net::UdpSocket::bind("127.0.0.1:0").expect("sender");
    sender.send_to(&[0x01, 0x02, 0x03], addr).expect("send");

    wait_for_envelopes(&received, 1).await;
    let envelope = received.lock().expect("lock")[0].clone();
    assert!(envelope.parse_error.as_deref().is_some_and(|e| e.contains("insufficient")));
    assert!(parsed.lock().expect("lock").is_empty());

    adapter.stop().await.expect("stop");
}

#[tokio::test]
async fn lifecycle_is_idempotent_and_restartable() {
    let bus = Arc::new(EventBus::new());
    let adapter = adapter(&bus, false);
    assert_eq!(adapter.state(), AdapterState::New);

    adapter.start().await.expect("start");
    assert_eq!(adapter.state(), AdapterState::Running);

    // Second start is a warning, not an error
    adapter.start().await.expect("redundant start");
    assert_eq!(adapter.state(), AdapterState::Running);

    adapter.stop().await.expect("stop");
    assert_eq!(adapter.state(), AdapterState::Stopped);

    // Second stop is a no-op
    adapter.stop().await.expect("redundant stop");

    adapter.restart().await.expect("restart");
    assert_eq!(adapter.state(), AdapterState::Running);
    adapter.stop().await.expect("stop");
}
