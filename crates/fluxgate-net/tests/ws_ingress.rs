//! WebSocket adapter: frame-per-message ingestion and the connection cap.

mod support;

use std::sync::Arc;

use fluxgate_core::{EventBus, Protocol};
use fluxgate_net::adapters::{Ingress, WebSocketAdapter, WebSocketAdapterConfig};
use futures_util::{SinkExt, StreamExt};
use support::{collect_envelopes, wait_for_envelopes};
use tokio_tungstenite::tungstenite::Message;

async fn start_adapter(bus: &Arc<EventBus>, max_connections: u64) -> (WebSocketAdapter, String) {
    let config = WebSocketAdapterConfig {
        listen_address: "127.0.0.1".to_string(),
        listen_port: 0,
        max_connections,
        ..Default::default()
    };
    let adapter =
        WebSocketAdapter::new("ws-in", config, Arc::clone(bus), None).expect("adapter");
    adapter.start().await.expect("start");
    let addr = adapter.local_addr().expect("bound");
    (adapter, format!("ws://{addr}"))
}

#[tokio::test]
async fn text_frames_become_envelopes() {
    let bus = Arc::new(EventBus::new());
    let received = collect_envelopes(&bus, Protocol::WebSocket.received_topic());
    let (adapter, url) = start_adapter(&bus, 10).await;

    let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.expect("connect");
    client.send(Message::text(r#"{"reading": 7}"#)).await.expect("send");
    client.send(Message::text("plain text")).await.expect("send");

    wait_for_envelopes(&received, 2).await;
    let envelopes = received.lock().expect("lock").clone();
    assert_eq!(
        envelopes[0].parsed_data.as_ref().and_then(|m| m.get("reading")),
        Some(&serde_json::json!(7))
    );
    assert_eq!(envelopes[1].raw_text.as_deref(), Some("plain text"));

    client.close(None).await.expect("close");
    adapter.stop().await.expect("stop");
}

#[tokio::test]
async fn connections_over_the_cap_are_rejected() {
    let bus = Arc::new(EventBus::new());
    let (adapter, url) = start_adapter(&bus, 1).await;

    let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.expect("connect");
    // Make sure the first connection is fully registered before the second
    first.send(Message::text("hold")).await.expect("send");
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.expect("connect");
    let close = tokio::time::timeout(tokio::time::Duration::from_secs(5), second.next())
        .await
        .expect("close frame in time");

    match close {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(frame.reason.as_str(), "Maximum connections reached");
        },
        other => panic!("expected close with reason, got {other:?}"),
    }

    first.close(None).await.expect("close");
    adapter.stop().await.expect("stop");
}
