//! TCP ingress: accept loop with schema-driven stream framing.
//!
//! TCP delivers a byte stream; the bound schema's frame type decides where
//! one message ends and the next begins. Without a schema, every read is
//! published as one message.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use fluxgate_core::{EventBus, Protocol};
use fluxgate_frame::{FrameSchema, FrameSplitter};
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::watch,
};

use super::{AdapterCore, AdapterState, AdapterStats, Ingress};
use crate::error::AdapterError;

/// TCP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpAdapterConfig {
    /// Interface to bind.
    pub listen_address: String,
    /// Port to bind; 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Per-connection read buffer size.
    pub read_buffer_size: usize,
    /// Data-source identifier stamped on every envelope.
    pub source_id: Option<String>,
    /// Decode frames inline when a schema is bound.
    pub auto_parse: bool,
}

impl Default for TcpAdapterConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 0,
            read_buffer_size: 4096,
            source_id: None,
            auto_parse: false,
        }
    }
}

/// Stream receiver with per-connection frame accumulation.
pub struct TcpAdapter {
    core: Arc<AdapterCore>,
    config: TcpAdapterConfig,
    schema: Option<Arc<FrameSchema>>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl TcpAdapter {
    /// Build the adapter; the listener is bound by [`Ingress::start`].
    pub fn new(
        name: impl Into<String>,
        config: TcpAdapterConfig,
        bus: Arc<EventBus>,
        schema: Option<FrameSchema>,
    ) -> Result<Self, AdapterError> {
        let core = AdapterCore::new(
            name,
            Protocol::Tcp,
            bus,
            config.source_id.clone(),
            schema.clone(),
            config.auto_parse,
        )?;
        Ok(Self {
            core: Arc::new(core),
            config,
            schema: schema.map(Arc::new),
            local_addr: std::sync::Mutex::new(None),
        })
    }

    /// Bound listener address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Ingress for TcpAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
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
        let listener = match TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(error) => {
                self.core.abort_start();
                return Err(AdapterError::Bind(format!("tcp bind {bind}: {error}")));
            },
        };
        *self.local_addr.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            listener.local_addr().ok();

        let core = Arc::clone(&self.core);
        let schema = self.schema.clone();
        let buffer_size = self.config.read_buffer_size.max(64);
        self.core.add_task(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            core.connection_opened();
                            // Tracked so stop() joins per-connection loops too
                            core.add_task(tokio::spawn(serve_connection(
                                Arc::clone(&core),
                                schema.clone(),
                                stream,
                                peer,
                                buffer_size,
                                shutdown.clone(),
                            )));
                        },
                        Err(error) => {
                            core.record_error();
                            tracing::warn!(adapter = %core.name(), %error, "tcp accept failed");
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

async fn serve_connection(
    core: Arc<AdapterCore>,
    schema: Option<Arc<FrameSchema>>,
    mut stream: TcpStream,
    peer: SocketAddr,
    buffer_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = peer.to_string();
    let mut splitter = schema.as_deref().map(FrameSplitter::new);
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = stream.read(&mut buffer) => read,
        };

        match read {
            Ok(0) => break,
            Ok(len) => match &mut splitter {
                Some(splitter) => {
                    splitter.extend(&buffer[..len]);
                    while let Some(frame) = splitter.next_frame() {
                        core.publish_received(frame, Some(peer.clone()));
                    }
                },
                // No schema bound: one read, one message
                None => {
                    core.publish_received(Bytes::copy_from_slice(&buffer[..len]), Some(peer.clone()));
                },
            },
            Err(error) => {
                core.record_error();
                tracing::debug!(adapter = %core.name(), %peer, %error, "tcp read failed");
                break;
            },
        }
    }

    core.connection_closed();
}
