//! HTTP ingress: one request body, one message.
//!
//! The adapter exposes a single route to the external surface; the request
//! is acknowledged with 200 as soon as the envelope is on the bus.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    Router,
    extract::{ConnectInfo, State},
    http::StatusCode,
    routing,
};
use bytes::Bytes;
use fluxgate_core::{EventBus, Protocol};
use fluxgate_frame::FrameSchema;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use super::{AdapterCore, AdapterState, AdapterStats, Ingress};
use crate::error::AdapterError;

/// HTTP ingestion endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpAdapterConfig {
    /// Interface to bind.
    pub listen_address: String,
    /// Port to bind; 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Request path accepting messages.
    pub endpoint: String,
    /// Accepted method: POST or PUT.
    pub method: String,
    /// Data-source identifier stamped on every envelope.
    pub source_id: Option<String>,
    /// Decode frames inline when a schema is bound.
    pub auto_parse: bool,
}

impl Default for HttpAdapterConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 0,
            endpoint: "/ingest".to_string(),
            method: "POST".to_string(),
            source_id: None,
            auto_parse: false,
        }
    }
}

/// Request-per-message receiver built on axum.
pub struct HttpAdapter {
    core: Arc<AdapterCore>,
    config: HttpAdapterConfig,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl HttpAdapter {
    /// Build the adapter; the listener is bound by [`Ingress::start`].
    pub fn new(
        name: impl Into<String>,
        config: HttpAdapterConfig,
        bus: Arc<EventBus>,
        schema: Option<FrameSchema>,
    ) -> Result<Self, AdapterError> {
        match config.method.to_ascii_uppercase().as_str() {
            "POST" | "PUT" => {},
            other => {
                return Err(AdapterError::Config(format!("unsupported ingest method: {other}")));
            },
        }
        if !config.endpoint.starts_with('/') {
            return Err(AdapterError::Config(format!(
                "endpoint must start with '/': {}",
                config.endpoint
            )));
        }

        let core = AdapterCore::new(
            name,
            Protocol::Http,
            bus,
            config.source_id.clone(),
            schema,
            config.auto_parse,
        )?;
        Ok(Self { core: Arc::new(core), config, local_addr: std::sync::Mutex::new(None) })
    }

    /// Bound listener address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

async fn ingest(
    State(core): State<Arc<AdapterCore>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> StatusCode {
    core.publish_received(body, Some(peer.to_string()));
    StatusCode::OK
}

#[async_trait]
impl Ingress for HttpAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn protocol(&self) -> Protocol {
        Protocol::Http
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
                return Err(AdapterError::Bind(format!("http bind {bind}: {error}")));
            },
        };
        *self.local_addr.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            listener.local_addr().ok();

        let route = match self.config.method.to_ascii_uppercase().as_str() {
            "PUT" => routing::put(ingest),
            _ => routing::post(ingest),
        };
        let app = Router::new()
            .route(&self.config.endpoint, route)
            .with_state(Arc::clone(&self.core));

        self.core.add_task(tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
            if let Err(error) = serve.await {
                tracing::error!(%error, "http ingress server failed");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_method() {
        let bus = Arc::new(EventBus::new());
        let config = HttpAdapterConfig { method: "DELETE".to_string(), ..Default::default() };
        assert!(matches!(
            HttpAdapter::new("http-in", config, bus, None),
            Err(AdapterError::Config(_))
        ));
    }

    #[test]
    fn rejects_relative_endpoint() {
        let bus = Arc::new(EventBus::new());
        let config = HttpAdapterConfig { endpoint: "ingest".to_string(), ..Default::default() };
        assert!(matches!(
            HttpAdapter::new("http-in", config, bus, None),
            Err(AdapterError::Config(_))
        ));
    }
}
