//! MQTT egress: publish to the target's topic at the configured QoS.

use async_trait::async_trait;
use fluxgate_core::{Forward, ForwardError, TargetSystem};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{adapters, error::GatewayError};

/// Broker-publishing emitter.
pub struct MqttForwarder {
    name: String,
    client: AsyncClient,
    topic: String,
    qos: QoS,
    retain: bool,
    event_loop: Mutex<Option<EventLoop>>,
    poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MqttForwarder {
    /// Build the emitter from the target's broker address and topic.
    ///
    /// # Errors
    ///
    /// [`GatewayError::TargetConfig`] when address, topic, or QoS are
    /// unusable.
    pub fn build(target: &TargetSystem) -> Result<Self, GatewayError> {
        let address = target.address.as_deref().ok_or_else(|| {
            GatewayError::TargetConfig(format!("target `{}` has no broker address", target.name))
        })?;
        let topic = target.topic.clone().ok_or_else(|| {
            GatewayError::TargetConfig(format!("target `{}` has no topic", target.name))
        })?;
        let qos = adapters::qos_level(target.forwarder.qos)
            .map_err(|e| GatewayError::TargetConfig(e.to_string()))?;

        let options = MqttOptions::new(
            format!("fluxgate-egress-{}", target.id.simple()),
            address.to_string(),
            target.port.unwrap_or(1883),
        );
        let (client, event_loop) = AsyncClient::new(options, 64);

        Ok(Self {
            name: target.name.clone(),
            client,
            topic,
            qos,
            retain: target.forwarder.retain,
            event_loop: Mutex::new(Some(event_loop)),
            poll_task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Forward for MqttForwarder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), ForwardError> {
        let Some(mut event_loop) = self.event_loop.lock().await.take() else {
            return Ok(());
        };
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            loop {
                if let Err(error) = event_loop.poll().await {
                    tracing::warn!(sink = %name, %error, "mqtt egress connection error");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        });
        *self.poll_task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.client.disconnect().await;
        if let Some(handle) = self.poll_task.lock().await.take() {
            handle.abort();
        }
    }

    async fn attempt(&self, batch: &[Value]) -> Result<Option<u16>, ForwardError> {
        for payload in batch {
            let body =
                serde_json::to_vec(payload).map_err(|e| ForwardError::Payload(e.to_string()))?;
            self.client
                .publish(self.topic.clone(), self.qos, self.retain, body)
                .await
                .map_err(|e| ForwardError::Connection(e.to_string()))?;
        }
        Ok(None)
    }
}
