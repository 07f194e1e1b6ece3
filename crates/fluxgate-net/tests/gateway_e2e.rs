//! Whole-gateway flow: UDP datagrams in, threshold routing, HTTP delivery
//! out, observed at a mock alert/normal sink.

mod support;

use std::sync::{Arc, Mutex};

use fluxgate_core::{
    EventBus, ForwardStatus, RoutingRule, TargetSystem,
    bus::{BusEvent, topics},
};
use fluxgate_crypto::CryptoService;
use fluxgate_net::{
    GatewayManager,
    adapters::{Ingress, UdpAdapter, UdpAdapterConfig},
};
use serde_json::json;
use support::{sensor_frame, sensor_schema};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, method, path},
};

struct Gateway {
    manager: Arc<GatewayManager>,
    udp_addr: std::net::SocketAddr,
    results: Arc<Mutex<Vec<ForwardStatus>>>,
}

async fn gateway(normal_uri: &str, alert_uri: &str) -> Gateway {
    let bus = Arc::new(EventBus::new());
    let manager =
        Arc::new(GatewayManager::new(Arc::clone(&bus), Arc::new(CryptoService::default())));

    let schema = sensor_schema();
    let schema_id = schema.id;
    manager.register_frame_schema(schema).expect("schema");

    let normal: TargetSystem = serde_json::from_value(json!({
        "name": "normal-sink",
        "protocol_type": "HTTP",
        "address": normal_uri,
        "path": "/api/normal",
        "transform": {"field_mapping": {
            "parsed_data.temperature": "temp",
            "parsed_data.humidity": "hum"
        }}
    }))
    .expect("target");
    let alert: TargetSystem = serde_json::from_value(json!({
        "name": "alert-sink",
        "protocol_type": "HTTP",
        "address": alert_uri,
        "path": "/api/alert",
        "transform": {
            "field_mapping": {
                "parsed_data.temperature": "temp",
                "parsed_data.humidity": "hum"
            },
            "add_fields": {"alert_type": "high_temperature"}
        }
    }))
    .expect("target");

    let high: RoutingRule = serde_json::from_value(json!({
        "name": "high-temperature",
        "priority": 10,
        "conditions": [
            {"field_path": "parsed_data.temperature", "operator": ">", "value": 30.0}
        ],
        "source_config": {"protocols": ["UDP"]},
        "target_system_ids": [alert.id]
    }))
    .expect("rule");
    let normal_rule: RoutingRule = serde_json::from_value(json!({
        "name": "normal-temperature",
        "priority": 5,
        "conditions": [
            {"field_path": "parsed_data.temperature", "operator": "<=", "value": 30.0}
        ],
        "source_config": {"protocols": ["UDP"]},
        "target_system_ids": [normal.id]
    }))
    .expect("rule");

    assert!(manager.register_routing_rule(high));
    assert!(manager.register_routing_rule(normal_rule));
    manager.register_target_system(normal).await.expect("normal target");
    manager.register_target_system(alert).await.expect("alert target");

    let adapter = UdpAdapter::new(
        "udp-in",
        UdpAdapterConfig {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 0,
            source_id: Some("sensor-1".to_string()),
            ..Default::default()
        },
        Arc::clone(&bus),
        None,
    )
    .expect("adapter");
    let adapter = Arc::new(adapter);
    manager.bind_source("sensor-1", schema_id);
    manager
        .add_adapter("udp-in", Arc::clone(&adapter) as Arc<dyn Ingress>)
        .await
        .expect("add adapter");

    let results = Arc::new(Mutex::new(Vec::new()));
    let results2 = Arc::clone(&results);
    bus.subscribe(topics::FORWARD_RESULT, move |event, _, _| {
        if let BusEvent::Forward(report) = event {
            results2.lock().expect("lock").push(report.result.status);
        }
        Ok(())
    });

    manager.start().await.expect("start");
    let udp_addr = adapter.local_addr().expect("bound");

    Gateway { manager, udp_addr, results }
}

async fn wait_for_results(results: &Arc<Mutex<Vec<ForwardStatus>>>, count: usize) {
    let deadline = tokio::time::Duration::from_secs(5);
    let waited = tokio::time::timeout(deadline, async {
        loop {
            if results.lock().expect("lock").len() >= count {
                return;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "never saw {count} forward results");
}

#[tokio::test]
async fn udp_to_http_threshold_routing() {
    let normal_server = MockServer::start().await;
    let alert_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/normal"))
        .and(body_json(json!({"temp": 25.5, "hum": 60.0})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&normal_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/alert"))
        .and(body_json(json!({"temp": 35.0, "hum": 60.0, "alert_type": "high_temperature"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&alert_server)
        .await;

    let gateway = gateway(&normal_server.uri(), &alert_server.uri()).await;

    let sender = std::net::UdpSocket::bind("127.0.0.1:0").expect("sender");
    sender.send_to(&sensor_frame(25.5, 60.0), gateway.udp_addr).expect("send");
    sender.send_to(&sensor_frame(35.0, 60.0), gateway.udp_addr).expect("send");

    wait_for_results(&gateway.results, 2).await;
    let statuses = gateway.results.lock().expect("lock").clone();
    assert!(statuses.iter().all(|s| *s == ForwardStatus::Success));

    gateway.manager.stop().await;

    // MockServer::expect verifies delivery counts on drop
}

#[tokio::test]
async fn gateway_status_reports_adapters_and_rules() {
    let normal_server = MockServer::start().await;
    let alert_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&normal_server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&alert_server)
        .await;

    let gateway = gateway(&normal_server.uri(), &alert_server.uri()).await;

    let status = gateway.manager.status().await;
    assert!(status.is_running);
    assert_eq!(status.adapters.len(), 1);
    assert_eq!(status.adapters[0].id, "udp-in");
    assert_eq!(status.routing.total_rules, 2);
    assert_eq!(status.pipeline.targets, 2);

    gateway.manager.stop().await;
    assert!(!gateway.manager.status().await.is_running);
}
