//! MQTT ingress: one broker publish, one message.
//!
//! The adapter subscribes to the configured topic filters at the configured
//! QoS and republishes every received payload as an envelope. The received
//! MQTT topic travels in `source_address`.

use std::sync::Arc;

use async_trait::async_trait;
use fluxgate_core::{EventBus, Protocol};
use fluxgate_frame::FrameSchema;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};

use super::{AdapterCore, AdapterState, AdapterStats, Ingress};
use crate::error::AdapterError;

/// MQTT subscriber configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttAdapterConfig {
    /// Broker host name.
    pub broker_host: String,
    /// Broker port.
    pub broker_port: u16,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Topic filters to subscribe.
    pub topics: Vec<String>,
    /// Subscription quality of service (0, 1, or 2).
    pub qos: u8,
    /// Broker user name.
    pub username: Option<String>,
    /// Broker password.
    pub password: Option<String>,
    /// Data-source identifier stamped on every envelope.
    pub source_id: Option<String>,
    /// Decode frames inline when a schema is bound.
    pub auto_parse: bool,
}

impl Default for MqttAdapterConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "fluxgate-ingress".to_string(),
            topics: Vec::new(),
            qos: 0,
            username: None,
            password: None,
            source_id: None,
            auto_parse: false,
        }
    }
}

pub(crate) fn qos_level(qos: u8) -> Result<QoS, AdapterError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(AdapterError::Config(format!("invalid QoS level: {other}"))),
    }
}

/// Broker-fed receiver.
pub struct MqttAdapter {
    core: Arc<AdapterCore>,
    config: MqttAdapterConfig,
    client: std::sync::Mutex<Option<AsyncClient>>,
}

impl MqttAdapter {
    /// Build the adapter; the broker connection is made by
    /// [`Ingress::start`].
    pub fn new(
        name: impl Into<String>,
        config: MqttAdapterConfig,
        bus: Arc<EventBus>,
        schema: Option<FrameSchema>,
    ) -> Result<Self, AdapterError> {
        qos_level(config.qos)?;
        if config.topics.is_empty() {
            return Err(AdapterError::Config("no topic filters configured".to_string()));
        }

        let core = AdapterCore::new(
            name,
            Protocol::Mqtt,
            bus,
            config.source_id.clone(),
            schema,
            config.auto_parse,
        )?;
        Ok(Self { core: Arc::new(core), config, client: std::sync::Mutex::new(None) })
    }
}

#[async_trait]
impl Ingress for MqttAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn state(&self) -> AdapterState {
        self.core.state()
    }

    fn stats(&self) -> AdapterStats {
        self.core.stats()
    }

    async fn start(&self) -> Result<(), AdapterError> {
        let Some(mut shutdown) = self.core.begin_start() else {
            return Ok(());
        };

        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.broker_host.clone(),
            self.config.broker_port,
        );
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let qos = qos_level(self.config.qos)?;
        for topic in &self.config.topics {
            if let Err(error) = client.subscribe(topic.clone(), qos).await {
                self.core.abort_start();
                return Err(AdapterError::Bind(format!("mqtt subscribe {topic}: {error}")));
            }
        }
        *self.client.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some(client);

        let core = Arc::clone(&self.core);
        self.core.add_task(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            core.publish_received(publish.payload, Some(publish.topic));
                        },
                        Ok(_) => {},
                        Err(error) => {
                            core.record_error();
                            tracing::warn!(adapter = %core.name(), %error, "mqtt connection error");
                            // rumqttc reconnects on the next poll; don't spin
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        },
                    },
                }
            }
        }));

        self.core.finish_start();
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        let client =
            self.client.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
        self.core.stop().await;
        Ok(())
    }
}
