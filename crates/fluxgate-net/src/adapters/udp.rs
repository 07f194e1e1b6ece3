//! UDP ingress: one datagram, one message.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use fluxgate_core::{EventBus, Protocol};
use fluxgate_frame::FrameSchema;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use super::{AdapterCore, AdapterState, AdapterStats, Ingress};
use crate::error::AdapterError;

/// UDP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpAdapterConfig {
    /// Interface to bind.
    pub listen_address: String,
    /// Port to bind; 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Receive buffer size; datagrams longer than this are truncated by the
    /// OS.
    pub buffer_size: usize,
    /// Data-source identifier stamped on every envelope.
    pub source_id: Option<String>,
    /// Decode frames inline when a schema is bound.
    pub auto_parse: bool,
}

impl Default for UdpAdapterConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 0,
            buffer_size: 2048,
            source_id: None,
            auto_parse: false,
        }
    }
}

/// Connectionless datagram receiver.
pub struct UdpAdapter {
    core: Arc<AdapterCore>,
    config: UdpAdapterConfig,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl UdpAdapter {
    /// Build the adapter; the socket is bound by [`Ingress::start`].
    pub fn new(
        name: impl Into<String>,
        config: UdpAdapterConfig,
        bus: Arc<EventBus>,
        schema: Option<FrameSchema>,
    ) -> Result<Self, AdapterError> {
        let core = AdapterCore::new(
            name,
            Protocol::Udp,
            bus,
            config.source_id.clone(),
            schema,
            config.auto_parse,
        )?;
        Ok(Self { core: Arc::new(core), config, local_addr: std::sync::Mutex::new(None) })
    }

    /// Bound socket address, once started. Useful with port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Ingress for UdpAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
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

        let bind = format!("{}:{}", self.config.listen_address, self.config.listen_port);
        let socket = match UdpSocket::bind(&bind).await {
            Ok(socket) => socket,
            Err(error) => {
                self.core.abort_start();
                return Err(AdapterError::Bind(format!("udp bind {bind}: {error}")));
            },
        };
        *self.local_addr.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            socket.local_addr().ok();

        let core = Arc::clone(&self.core);
        let buffer_size = self.config.buffer_size.max(1);
        self.core.add_task(tokio::spawn(async move {
            let mut buffer = vec![0u8; buffer_size];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = socket.recv_from(&mut buffer) => match received {
                        Ok((len, peer)) => {
                            core.publish_received(
                                Bytes::copy_from_slice(&buffer[..len]),
                                Some(peer.to_string()),
                            );
                        },
                        Err(error) => {
                            core.record_error();
                            tracing::warn!(adapter = %core.name(), %error, "udp receive failed");
                        },
                    },
                }
            }
        }));

        self.core.finish_start();
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        self.core.stop().await;
        Ok(())
    }
}
