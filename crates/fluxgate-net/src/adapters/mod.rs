//! Ingress adapters: protocol-specific receivers that normalize inbound
//! traffic into envelopes on the bus.
//!
//! Every adapter shares the same capability set ([`Ingress`]) and lifecycle:
//!
//! ```text
//! New ──start()──> Starting ──> Running ──stop()──> Stopping ──> Stopped
//! ```
//!
//! `start` on a running adapter and `stop` on a stopped one are warnings,
//! not errors. Receive loops run as tokio tasks signalled through a watch
//! channel on shutdown; statistics are plain atomic counters.

mod http;
mod mqtt;
mod tcp;
mod udp;
mod ws;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use fluxgate_core::{
    Envelope, EventBus, Protocol,
    bus::{BusEvent, topics},
};
use fluxgate_frame::{FrameParser, FrameSchema};
pub use http::{HttpAdapter, HttpAdapterConfig};
pub use mqtt::{MqttAdapter, MqttAdapterConfig};
pub(crate) use mqtt::qos_level;
use serde::{Deserialize, Serialize};
pub use tcp::{TcpAdapter, TcpAdapterConfig};
use tokio::sync::watch;
pub use udp::{UdpAdapter, UdpAdapterConfig};
use uuid::Uuid;
pub use ws::{WebSocketAdapter, WebSocketAdapterConfig};

use crate::error::AdapterError;

/// How long `stop` waits for an adapter's tasks before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Adapter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AdapterState {
    /// Constructed, never started.
    New,
    /// `start` in progress.
    Starting,
    /// Receiving traffic.
    Running,
    /// `stop` in progress.
    Stopping,
    /// Stopped; can be started again.
    Stopped,
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Snapshot of an adapter's counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AdapterStats {
    /// Messages published to the bus.
    pub messages_received: u64,
    /// Raw bytes received.
    pub bytes_received: u64,
    /// Receive-side errors (socket failures, rejected connections).
    pub receive_errors: u64,
    /// Currently open connections, for connection-oriented transports.
    pub active_connections: u64,
}

#[derive(Debug, Default)]
struct Counters {
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    receive_errors: AtomicU64,
    active_connections: AtomicU64,
}

/// Common capability set of every ingress adapter.
#[async_trait]
pub trait Ingress: Send + Sync {
    /// Adapter name (unique per gateway).
    fn name(&self) -> &str;

    /// Transport protocol.
    fn protocol(&self) -> Protocol;

    /// Current lifecycle state.
    fn state(&self) -> AdapterState;

    /// Counter snapshot.
    fn stats(&self) -> AdapterStats;

    /// Bring the receive loop up.
    async fn start(&self) -> Result<(), AdapterError>;

    /// Signal shutdown and wait for the receive loop to finish.
    async fn stop(&self) -> Result<(), AdapterError>;

    /// `stop` followed by `start`.
    async fn restart(&self) -> Result<(), AdapterError> {
        self.stop().await?;
        self.start().await
    }
}

/// State shared by every adapter implementation: identity, lifecycle,
/// counters, optional schema binding, and envelope publication.
pub(crate) struct AdapterCore {
    name: String,
    protocol: Protocol,
    bus: Arc<EventBus>,
    source_id: Option<String>,
    parser: Option<Arc<FrameParser>>,
    auto_parse: bool,
    state: Mutex<AdapterState>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    counters: Counters,
}

impl AdapterCore {
    pub(crate) fn new(
        name: impl Into<String>,
        protocol: Protocol,
        bus: Arc<EventBus>,
        source_id: Option<String>,
        schema: Option<FrameSchema>,
        auto_parse: bool,
    ) -> Result<Self, AdapterError> {
        let parser = schema
            .map(FrameParser::new)
            .transpose()
            .map_err(|e| AdapterError::Config(e.to_string()))?
            .map(Arc::new);

        Ok(Self {
            name: name.into(),
            protocol,
            bus,
            source_id,
            parser,
            auto_parse,
            state: Mutex::new(AdapterState::New),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            counters: Counters::default(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub(crate) fn state(&self) -> AdapterState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_state(&self, state: AdapterState) {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = state;
    }

    pub(crate) fn stats(&self) -> AdapterStats {
        AdapterStats {
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            receive_errors: self.counters.receive_errors.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
        }
    }

    /// Transition into `Starting` and hand back the shutdown receiver, or
    /// `None` when the adapter is already running (no-op with warning).
    pub(crate) fn begin_start(&self) -> Option<watch::Receiver<bool>> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if matches!(*state, AdapterState::Running | AdapterState::Starting) {
            tracing::warn!(adapter = %self.name, "start ignored: already running");
            return None;
        }
        *state = AdapterState::Starting;
        drop(state);

        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
        Some(rx)
    }

    /// Record a spawned task: the accept loop or one per-connection receive
    /// loop.
    ///
    /// Finished handles are pruned on the way in, so long-lived adapters do
    /// not accumulate entries for connections that already closed.
    pub(crate) fn add_task(&self, handle: tokio::task::JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Mark the adapter running.
    pub(crate) fn finish_start(&self) {
        self.set_state(AdapterState::Running);
        tracing::info!(adapter = %self.name, protocol = %self.protocol, "adapter started");
    }

    /// Roll back a failed start.
    pub(crate) fn abort_start(&self) {
        *self.shutdown.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        self.set_state(AdapterState::Stopped);
    }

    /// Signal shutdown and join every tracked task: the accept loop and all
    /// per-connection receive loops.
    ///
    /// Tasks share one [`SHUTDOWN_GRACE`] deadline; stragglers are aborted
    /// once it passes.
    pub(crate) async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if !matches!(*state, AdapterState::Running | AdapterState::Starting) {
                tracing::debug!(adapter = %self.name, "stop ignored: not running");
                return;
            }
            *state = AdapterState::Stopping;
        }

        let sender =
            self.shutdown.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }

        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for handle in handles {
            let abort = handle.abort_handle();
            let remaining =
                deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                tracing::warn!(adapter = %self.name, "task exceeded shutdown grace, aborting");
                abort.abort();
            }
        }

        self.set_state(AdapterState::Stopped);
        tracing::info!(adapter = %self.name, "adapter stopped");
    }

    /// Count a receive-side error.
    pub(crate) fn record_error(&self) {
        self.counters.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_opened(&self) {
        self.counters.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn active_connections(&self) -> u64 {
        self.counters.active_connections.load(Ordering::Relaxed)
    }

    /// Build the inbound envelope for `body` and publish it.
    ///
    /// Always publishes on the protocol's `<PROTO>_RECEIVED` topic. With
    /// `auto_parse` and a bound schema the frame is decoded inline and
    /// `DATA_PARSED` is additionally published; a parse failure decorates the
    /// envelope with `parse_error` but still emits `<PROTO>_RECEIVED`.
    pub(crate) fn publish_received(&self, body: Bytes, peer: Option<String>) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_received.fetch_add(body.len() as u64, Ordering::Relaxed);

        let mut envelope = Envelope::received(self.protocol, self.name.clone(), peer);
        envelope.source_id = self.source_id.clone();
        envelope.frame_schema_id = self.parser.as_ref().map(|p| p.schema().id);
        let mut envelope = envelope.with_body(body);

        if self.auto_parse && envelope.parsed_data.is_none() {
            if let (Some(parser), Some(raw)) = (&self.parser, envelope.raw_data.clone()) {
                match parser.parse(&raw) {
                    Ok(fields) => {
                        envelope.parsed_data = Some(fields);
                        envelope.auto_parsed = true;
                    },
                    Err(error) => {
                        tracing::warn!(adapter = %self.name, %error, "inline parse failed");
                        envelope.parse_error = Some(error.to_string());
                    },
                }
            }
        }

        let envelope = Arc::new(envelope);
        self.bus.publish(
            self.protocol.received_topic(),
            &BusEvent::Message(Arc::clone(&envelope)),
            Some(&self.name),
        );
        if envelope.auto_parsed {
            self.bus.publish(
                topics::DATA_PARSED,
                &BusEvent::Message(envelope),
                Some(&self.name),
            );
        }
    }
}

/// One adapter entry in the gateway config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterEntry {
    /// Unique adapter id within the gateway.
    pub id: String,
    /// Frame schema resolved from the config's schema list.
    #[serde(default)]
    pub frame_schema_id: Option<Uuid>,
    /// Protocol-specific configuration.
    #[serde(flatten)]
    pub spec: AdapterSpec,
}

/// Protocol-tagged adapter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "protocol")]
pub enum AdapterSpec {
    /// UDP listener.
    #[serde(rename = "UDP")]
    Udp(UdpAdapterConfig),
    /// TCP accept loop.
    #[serde(rename = "TCP")]
    Tcp(TcpAdapterConfig),
    /// HTTP request ingestion.
    #[serde(rename = "HTTP")]
    Http(HttpAdapterConfig),
    /// WebSocket server.
    #[serde(rename = "WEBSOCKET")]
    WebSocket(WebSocketAdapterConfig),
    /// MQTT subscriber.
    #[serde(rename = "MQTT")]
    Mqtt(MqttAdapterConfig),
}

/// Build an adapter from its config entry.
///
/// # Errors
///
/// [`AdapterError::Config`] when the spec or bound schema is unusable.
pub fn build_adapter(
    entry: &AdapterEntry,
    bus: Arc<EventBus>,
    schema: Option<FrameSchema>,
) -> Result<Arc<dyn Ingress>, AdapterError> {
    Ok(match &entry.spec {
        AdapterSpec::Udp(config) => {
            Arc::new(UdpAdapter::new(entry.id.clone(), config.clone(), bus, schema)?)
        },
        AdapterSpec::Tcp(config) => {
            Arc::new(TcpAdapter::new(entry.id.clone(), config.clone(), bus, schema)?)
        },
        AdapterSpec::Http(config) => {
            Arc::new(HttpAdapter::new(entry.id.clone(), config.clone(), bus, schema)?)
        },
        AdapterSpec::WebSocket(config) => {
            Arc::new(WebSocketAdapter::new(entry.id.clone(), config.clone(), bus, schema)?)
        },
        AdapterSpec::Mqtt(config) => {
            Arc::new(MqttAdapter::new(entry.id.clone(), config.clone(), bus, schema)?)
        },
    })
}
