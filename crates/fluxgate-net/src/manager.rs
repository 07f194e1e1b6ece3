//! Gateway manager: adapter ownership, pipeline lifecycle, and the
//! registration facade an external management surface calls into.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use fluxgate_core::{
    DataPipeline, EventBus, Protocol, RoutingEngine, RoutingRule, TargetSystem,
    pipeline::PipelineStats, routing::RoutingStats,
};
use fluxgate_crypto::CryptoService;
use fluxgate_frame::FrameSchema;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    adapters::{AdapterState, AdapterStats, Ingress},
    error::GatewayError,
    forwarders,
};

/// One adapter's row in [`GatewayStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatus {
    /// Adapter id.
    pub id: String,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Lifecycle state.
    pub state: AdapterState,
    /// Counter snapshot.
    pub stats: AdapterStats,
}

/// Aggregate gateway status for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    /// Whether `start` has completed without a matching `stop`.
    pub is_running: bool,
    /// Per-adapter states and counters, in registration order.
    pub adapters: Vec<AdapterStatus>,
    /// Pipeline counters.
    pub pipeline: PipelineStats,
    /// Routing counters.
    pub routing: RoutingStats,
}

/// Owns the adapters and the pipeline; everything an operator registers goes
/// through here.
pub struct GatewayManager {
    bus: Arc<EventBus>,
    pipeline: Arc<DataPipeline>,
    /// Registration order matters: `start` walks forward, `stop` in reverse.
    adapters: RwLock<Vec<(String, Arc<dyn Ingress>)>>,
    /// Schemas kept for frame-encoding egress payloads.
    schemas: std::sync::RwLock<HashMap<Uuid, FrameSchema>>,
    running: AtomicBool,
}

impl GatewayManager {
    /// Assemble a gateway over `bus` with `crypto` for payload envelopes.
    #[must_use]
    pub fn new(bus: Arc<EventBus>, crypto: Arc<CryptoService>) -> Self {
        let engine = RoutingEngine::new(Arc::clone(&bus));
        let pipeline = DataPipeline::new(Arc::clone(&bus), engine, crypto);
        Self {
            bus,
            pipeline,
            adapters: RwLock::new(Vec::new()),
            schemas: std::sync::RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// The bus everything is wired to.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The pipeline (for `process_message` test entry and stats).
    #[must_use]
    pub fn pipeline(&self) -> &Arc<DataPipeline> {
        &self.pipeline
    }

    /// Start the pipeline, then every adapter in registration order.
    ///
    /// # Errors
    ///
    /// The first adapter start failure; adapters started before it keep
    /// running.
    pub async fn start(&self) -> Result<(), GatewayError> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("gateway already running");
            return Ok(());
        }

        self.pipeline.start();

        let adapters = self.adapters.read().await;
        for (id, adapter) in adapters.iter() {
            adapter.start().await?;
            tracing::info!(adapter = %id, "adapter up");
        }
        drop(adapters);

        tracing::info!("gateway started");
        Ok(())
    }

    /// Stop adapters in reverse registration order, then the pipeline.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let adapters = self.adapters.read().await;
        for (id, adapter) in adapters.iter().rev() {
            if let Err(error) = adapter.stop().await {
                tracing::warn!(adapter = %id, %error, "adapter stop failed");
            }
        }
        drop(adapters);

        self.pipeline.stop().await;
        tracing::info!("gateway stopped");
    }

    /// Whether the gateway is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ---- adapters ---------------------------------------------------------

    /// Register an adapter; started immediately when the gateway is running.
    ///
    /// # Errors
    ///
    /// [`GatewayError::DuplicateAdapter`] on id collision; adapter start
    /// failures when running.
    pub async fn add_adapter(
        &self,
        id: impl Into<String>,
        adapter: Arc<dyn Ingress>,
    ) -> Result<(), GatewayError> {
        let id = id.into();
        let mut adapters = self.adapters.write().await;
        if adapters.iter().any(|(existing, _)| *existing == id) {
            return Err(GatewayError::DuplicateAdapter(id));
        }
        adapters.push((id.clone(), Arc::clone(&adapter)));
        drop(adapters);

        if self.is_running() {
            adapter.start().await?;
        }
        tracing::info!(adapter = %id, "adapter registered");
        Ok(())
    }

    /// Stop and remove an adapter. Returns whether it existed.
    pub async fn remove_adapter(&self, id: &str) -> bool {
        let removed = {
            let mut adapters = self.adapters.write().await;
            let index = adapters.iter().position(|(existing, _)| existing == id);
            index.map(|index| adapters.remove(index))
        };

        match removed {
            Some((id, adapter)) => {
                if let Err(error) = adapter.stop().await {
                    tracing::warn!(adapter = %id, %error, "adapter stop failed");
                }
                tracing::info!(adapter = %id, "adapter removed");
                true
            },
            None => {
                tracing::warn!(adapter = %id, "remove ignored: unknown adapter");
                false
            },
        }
    }

    /// Look up an adapter by id.
    pub async fn adapter(&self, id: &str) -> Option<Arc<dyn Ingress>> {
        let adapters = self.adapters.read().await;
        adapters.iter().find(|(existing, _)| existing == id).map(|(_, a)| Arc::clone(a))
    }

    // ---- registration facade ---------------------------------------------

    /// Register a frame schema with the pipeline and keep a copy for egress
    /// encoding.
    ///
    /// # Errors
    ///
    /// Schema validation failures.
    pub fn register_frame_schema(&self, schema: FrameSchema) -> Result<(), GatewayError> {
        self.pipeline.register_frame_schema(schema.clone())?;
        self.schemas
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(schema.id, schema);
        Ok(())
    }

    /// Remove a frame schema. Returns whether it was present.
    pub fn unregister_frame_schema(&self, schema_id: Uuid) -> bool {
        self.schemas
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&schema_id);
        self.pipeline.unregister_frame_schema(schema_id)
    }

    /// Build the target's forwarder and install both in the pipeline.
    ///
    /// # Errors
    ///
    /// Target configuration or forwarder startup failures.
    pub async fn register_target_system(&self, target: TargetSystem) -> Result<(), GatewayError> {
        let schema = target.frame_schema_id.and_then(|id| {
            self.schemas
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(&id)
                .cloned()
        });
        let emitter = forwarders::build_emitter(&target, schema)?;
        self.pipeline.register_target(target, emitter).await?;
        Ok(())
    }

    /// Remove a target system. Returns whether it was present.
    pub async fn unregister_target_system(&self, target_id: Uuid) -> bool {
        self.pipeline.unregister_target(target_id).await
    }

    /// Register a routing rule. Returns whether it was accepted.
    pub fn register_routing_rule(&self, rule: RoutingRule) -> bool {
        self.pipeline.register_routing_rule(rule)
    }

    /// Remove a routing rule. Returns whether it was present.
    pub fn unregister_routing_rule(&self, rule_id: Uuid) -> bool {
        self.pipeline.unregister_routing_rule(rule_id)
    }

    /// Replace a rule with its latest configuration: unregister (tolerating
    /// absence) then register. Other rules keep their relative order.
    pub fn reload_routing_rule(&self, rule: RoutingRule) -> bool {
        if !self.pipeline.unregister_routing_rule(rule.id) {
            tracing::debug!(rule = %rule.name, "reload of a rule that was not registered");
        }
        self.pipeline.register_routing_rule(rule)
    }

    /// Bind a data source to a schema for downstream parsing.
    pub fn bind_source(&self, source_id: impl Into<String>, schema_id: Uuid) {
        self.pipeline.bind_source(source_id, schema_id);
    }

    // ---- status -----------------------------------------------------------

    /// Aggregate status: adapters, pipeline, and routing counters.
    pub async fn status(&self) -> GatewayStatus {
        let adapters = self.adapters.read().await;
        let adapter_rows = adapters
            .iter()
            .map(|(id, adapter)| AdapterStatus {
                id: id.clone(),
                protocol: adapter.protocol(),
                state: adapter.state(),
                stats: adapter.stats(),
            })
            .collect();
        drop(adapters);

        GatewayStatus {
            is_running: self.is_running(),
            adapters: adapter_rows,
            pipeline: self.pipeline.stats(),
            routing: self.pipeline.engine().stats(),
        }
    }

    /// One adapter's counters, if it exists.
    pub async fn adapter_stats(&self, id: &str) -> Option<AdapterStats> {
        self.adapter(id).await.map(|adapter| adapter.stats())
    }
}

impl std::fmt::Debug for GatewayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayManager").field("running", &self.is_running()).finish()
    }
}
