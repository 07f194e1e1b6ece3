//! The stage orchestrator: decrypt → parse → route → transform → forward.
//!
//! The pipeline subscribes to every adapter's inbound topic, runs the CPU
//! stages inline on the publishing task, and hands transformed payloads to
//! per-target worker tasks. One worker per target keeps deliveries to that
//! target in order across retries while different targets proceed
//! concurrently.
//!
//! Registration calls are idempotent per id: re-registering replaces the
//! prior instance after stopping it cleanly.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use fluxgate_crypto::CryptoService;
use fluxgate_frame::{FrameError, FrameParser, FrameSchema};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::{
    bus::{BusEvent, EventBus, MetricSample, StageError, SubscriptionId, topics},
    envelope::{Envelope, Stage},
    forward::{Forward, ForwardError, ForwardJob, ForwarderRunner},
    model::{SourceInfo, TargetSystem},
    routing::{RoutingEngine, RoutingRule},
    transform,
};

/// How long `stop` waits for in-flight deliveries before aborting them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Result of the synchronous test entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    /// Whether every stage succeeded for every routed target.
    pub success: bool,
    /// First failing stage, or [`Stage::Complete`].
    pub stage: Stage,
    /// First failure description.
    pub error: Option<String>,
}

/// Counters surfaced by [`DataPipeline::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    /// Registered frame schemas.
    pub schemas: usize,
    /// Registered target systems.
    pub targets: usize,
    /// Source → schema bindings.
    pub bindings: usize,
    /// Messages that cleared decrypt and parse.
    pub processed: u64,
    /// Messages dropped by a failed stage.
    pub failed: u64,
}

struct TargetWorker {
    queue: mpsc::UnboundedSender<ForwardJob>,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

struct TargetEntry {
    runner: Arc<ForwarderRunner>,
    worker: TargetWorker,
}

/// Orchestrates the message plane over an [`EventBus`].
pub struct DataPipeline {
    bus: Arc<EventBus>,
    engine: Arc<RoutingEngine>,
    crypto: Arc<CryptoService>,
    parsers: RwLock<HashMap<Uuid, Arc<FrameParser>>>,
    bindings: RwLock<HashMap<String, Uuid>>,
    targets: RwLock<HashMap<Uuid, TargetEntry>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    started: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
    /// Self-reference handed to bus subscriptions so the bus does not keep
    /// the pipeline alive.
    weak: std::sync::Weak<Self>,
}

impl DataPipeline {
    /// Pipeline over the given collaborators.
    #[must_use]
    pub fn new(
        bus: Arc<EventBus>,
        engine: Arc<RoutingEngine>,
        crypto: Arc<CryptoService>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            bus,
            engine,
            crypto,
            parsers: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
            targets: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            weak: weak.clone(),
        })
    }

    /// The routing engine this pipeline routes through.
    #[must_use]
    pub fn engine(&self) -> &Arc<RoutingEngine> {
        &self.engine
    }

    /// The bus this pipeline is wired to.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Subscribe the stage handlers. Idempotent; a second start warns.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("pipeline already started");
            return;
        }

        let weak = self.weak.clone();
        let received = self.bus.subscribe(topics::ANY_RECEIVED, move |event, _topic, _source| {
            if let (Some(pipeline), Some(envelope)) = (weak.upgrade(), event.envelope()) {
                pipeline.on_received(envelope);
            }
            Ok(())
        });

        self.engine.start_auto_routing();

        let weak = self.weak.clone();
        let routed = self.bus.subscribe(topics::ROUTING_DECIDED, move |event, _topic, _source| {
            if let (Some(pipeline), Some(envelope)) = (weak.upgrade(), event.envelope()) {
                pipeline.on_routed(envelope);
            }
            Ok(())
        });

        let mut subs =
            self.subscriptions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        subs.extend([received, routed]);
        drop(subs);

        tracing::info!("pipeline started");
    }

    /// Unsubscribe and shut every target worker down.
    ///
    /// Workers get [`SHUTDOWN_GRACE`] to finish in-flight deliveries;
    /// stragglers are aborted and their queued jobs reported as cancelled.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        let subs: Vec<SubscriptionId> = {
            let mut subs =
                self.subscriptions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            subs.drain(..).collect()
        };
        for sub in subs {
            self.bus.unsubscribe(sub);
        }
        self.engine.stop_auto_routing();

        let entries: Vec<TargetEntry> = {
            let mut targets =
                self.targets.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            targets.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            Self::stop_entry(entry).await;
        }

        tracing::info!("pipeline stopped");
    }

    // ---- registration -----------------------------------------------------

    /// Install (or replace) a frame schema and its parser.
    ///
    /// # Errors
    ///
    /// [`FrameError::SchemaInvalid`]; invalid schemas are rejected here and
    /// never observed during message flow.
    pub fn register_frame_schema(&self, schema: FrameSchema) -> Result<(), FrameError> {
        let parser = FrameParser::new(schema)?;
        let id = parser.schema().id;
        let name = parser.schema().name.clone();
        self.parsers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, Arc::new(parser));
        tracing::info!(schema = %name, %id, "frame schema registered");
        Ok(())
    }

    /// Remove a frame schema. Returns whether it was present.
    pub fn unregister_frame_schema(&self, schema_id: Uuid) -> bool {
        self.parsers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&schema_id)
            .is_some()
    }

    /// Bind a data source to a schema for downstream parsing.
    pub fn bind_source(&self, source_id: impl Into<String>, schema_id: Uuid) {
        self.bindings
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(source_id.into(), schema_id);
    }

    /// Drop a source binding. Returns whether it existed.
    pub fn unbind_source(&self, source_id: &str) -> bool {
        self.bindings
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(source_id)
            .is_some()
    }

    /// Install (or replace) a target system with its protocol emitter.
    ///
    /// Starts the emitter, spawns the target's delivery worker, and stops
    /// any prior instance registered under the same id.
    ///
    /// # Errors
    ///
    /// Propagates the emitter's [`Forward::start`] failure; nothing is
    /// installed in that case.
    pub async fn register_target(
        &self,
        target: TargetSystem,
        emitter: Arc<dyn Forward>,
    ) -> Result<(), ForwardError> {
        emitter.start().await?;

        let id = target.id;
        let name = target.name.clone();
        let runner = Arc::new(ForwarderRunner::new(
            Arc::new(target),
            emitter,
            Arc::clone(&self.crypto),
            Arc::clone(&self.bus),
        ));
        let worker = spawn_worker(Arc::clone(&runner));

        let prior = self
            .targets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, TargetEntry { runner, worker });
        if let Some(prior) = prior {
            tracing::info!(sink = %name, "replacing registered target");
            Self::stop_entry(prior).await;
        }

        tracing::info!(sink = %name, %id, "target system registered");
        Ok(())
    }

    /// Remove a target and stop its worker. Returns whether it was present.
    pub async fn unregister_target(&self, target_id: Uuid) -> bool {
        let entry = self
            .targets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&target_id);
        match entry {
            Some(entry) => {
                Self::stop_entry(entry).await;
                true
            },
            None => false,
        }
    }

    /// Register a routing rule. Unpublished rules are rejected.
    pub fn register_routing_rule(&self, rule: RoutingRule) -> bool {
        if !rule.is_published {
            tracing::warn!(rule = %rule.name, "refusing to register unpublished rule");
            return false;
        }
        if rule.target_system_ids.is_empty() {
            tracing::warn!(rule = %rule.name, "registering rule with no targets");
        }
        self.engine.register(rule);
        true
    }

    /// Remove a routing rule. Returns whether it was present.
    pub fn unregister_routing_rule(&self, rule_id: Uuid) -> bool {
        self.engine.unregister(rule_id)
    }

    /// Pipeline counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            schemas: self.parsers.read().unwrap_or_else(std::sync::PoisonError::into_inner).len(),
            targets: self.targets.read().unwrap_or_else(std::sync::PoisonError::into_inner).len(),
            bindings: self.bindings.read().unwrap_or_else(std::sync::PoisonError::into_inner).len(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    // ---- stages -----------------------------------------------------------

    /// Synchronous test entry: drive one buffer through every stage and
    /// report where it ended up.
    pub async fn process_message(
        &self,
        raw_data: Bytes,
        frame_schema_id: Option<Uuid>,
        source: SourceInfo,
    ) -> ProcessOutcome {
        let started = Instant::now();

        let mut envelope = Envelope::new().with_body(raw_data);
        envelope.source_protocol = source.protocol;
        envelope.source_id = source.source_id;
        envelope.source_address = source.source_address;
        envelope.frame_schema_id = frame_schema_id;

        if let Err(detail) = self.decrypt_stage(&mut envelope) {
            envelope.decrypt_error = Some(detail.clone());
            self.fail_stage(Stage::Decrypt, envelope.message_id, &detail);
            return ProcessOutcome { success: false, stage: Stage::Decrypt, error: Some(detail) };
        }

        if let Err(detail) = self.parse_stage(&mut envelope) {
            envelope.parse_error = Some(detail.clone());
            self.fail_stage(Stage::Parse, envelope.message_id, &detail);
            return ProcessOutcome { success: false, stage: Stage::Parse, error: Some(detail) };
        }

        let decided = self.engine.decide(&envelope);
        self.processed.fetch_add(1, Ordering::Relaxed);

        let mut first_error: Option<(Stage, String)> = None;
        for target_id in &decided.target_system_ids {
            let runner = {
                let targets =
                    self.targets.read().unwrap_or_else(std::sync::PoisonError::into_inner);
                targets.get(target_id).map(|entry| Arc::clone(&entry.runner))
            };
            let Some(runner) = runner else {
                tracing::warn!(%target_id, "routed to unregistered target");
                continue;
            };
            if !runner.target().is_active {
                continue;
            }

            match self.shape_for_target(&decided, runner.target()) {
                Ok(payload) => {
                    let result = runner
                        .forward_one(ForwardJob { message_id: decided.message_id, payload })
                        .await;
                    if !result.is_success() && first_error.is_none() {
                        first_error = Some((
                            Stage::Forward,
                            result.error.unwrap_or_else(|| "delivery failed".to_string()),
                        ));
                    }
                },
                Err(error) => {
                    let detail = format!("target `{}`: {error}", runner.target().name);
                    self.fail_stage(Stage::Transform, decided.message_id, &detail);
                    if first_error.is_none() {
                        first_error = Some((Stage::Transform, detail));
                    }
                },
            }
        }

        self.publish_duration("pipeline.process_message", started.elapsed());

        match first_error {
            Some((stage, error)) => ProcessOutcome { success: false, stage, error: Some(error) },
            None => ProcessOutcome { success: true, stage: Stage::Complete, error: None },
        }
    }

    fn on_received(&self, received: &Arc<Envelope>) {
        // The adapter parsed inline and already published DATA_PARSED
        if received.auto_parsed {
            return;
        }

        let started = Instant::now();
        let mut envelope = (**received).clone();

        if let Err(detail) = self.decrypt_stage(&mut envelope) {
            envelope.decrypt_error = Some(detail.clone());
            self.fail_stage(Stage::Decrypt, envelope.message_id, &detail);
            return;
        }

        if let Err(detail) = self.parse_stage(&mut envelope) {
            envelope.parse_error = Some(detail.clone());
            self.fail_stage(Stage::Parse, envelope.message_id, &detail);
            return;
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(
            topics::DATA_PARSED,
            &BusEvent::Message(Arc::new(envelope)),
            Some("data_pipeline"),
        );
        self.publish_duration("pipeline.ingest", started.elapsed());
    }

    fn on_routed(&self, envelope: &Arc<Envelope>) {
        for target_id in &envelope.target_system_ids {
            let entry = {
                let targets =
                    self.targets.read().unwrap_or_else(std::sync::PoisonError::into_inner);
                targets
                    .get(target_id)
                    .map(|entry| (Arc::clone(&entry.runner), entry.worker.queue.clone()))
            };
            let Some((runner, queue)) = entry else {
                tracing::warn!(%target_id, "routed to unregistered target");
                continue;
            };
            if !runner.target().is_active {
                tracing::debug!(sink = %runner.target().name, "skipping inactive target");
                continue;
            }

            match self.shape_for_target(envelope, runner.target()) {
                Ok(payload) => {
                    let job = ForwardJob { message_id: envelope.message_id, payload };
                    if queue.send(job).is_err() {
                        tracing::warn!(
                            sink = %runner.target().name,
                            "delivery worker is gone; dropping payload"
                        );
                    }
                },
                Err(error) => {
                    // One failed target never blocks the others
                    let detail = format!("target `{}`: {error}", runner.target().name);
                    self.fail_stage(Stage::Transform, envelope.message_id, &detail);
                },
            }
        }
    }

    fn decrypt_stage(&self, envelope: &mut Envelope) -> Result<(), String> {
        let Some(blob) = envelope.encrypted_payload.clone() else {
            return Ok(());
        };
        envelope.is_encrypted = true;

        let value = self.crypto.unwrap_payload(&blob).map_err(|e| e.to_string())?;
        if let Some(object) = value.as_object() {
            envelope.parsed_data = Some(object.clone());
        }
        envelope.payload = Some(value);
        Ok(())
    }

    fn parse_stage(&self, envelope: &mut Envelope) -> Result<(), String> {
        // Already structured (adapter, decrypt stage, or JSON body)
        if envelope.parsed_data.is_some() {
            return Ok(());
        }
        let Some(raw) = envelope.raw_data.clone() else {
            return Ok(());
        };

        let schema_id = envelope.frame_schema_id.or_else(|| {
            envelope.source_id.as_ref().and_then(|source_id| {
                self.bindings
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .get(source_id)
                    .copied()
            })
        });
        let Some(schema_id) = schema_id else {
            return Ok(());
        };

        let parser = self
            .parsers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&schema_id)
            .cloned();
        let Some(parser) = parser else {
            tracing::warn!(%schema_id, "message bound to unregistered schema");
            return Ok(());
        };

        let fields = parser.parse(&raw).map_err(|e| e.to_string())?;
        envelope.frame_schema_id = Some(schema_id);
        envelope.parsed_data = Some(fields);
        Ok(())
    }

    /// Shape the payload for a target, honoring rule-level transformer
    /// toggles: when every matched rule that routes to this target disables
    /// the transformer, the content passes through unshaped.
    fn shape_for_target(
        &self,
        envelope: &Envelope,
        target: &TargetSystem,
    ) -> Result<serde_json::Value, transform::TransformError> {
        let contributors: Vec<Arc<RoutingRule>> = envelope
            .matched_rules
            .iter()
            .filter_map(|m| self.engine.rule(m.rule_id))
            .filter(|rule| rule.target_system_ids.contains(&target.id))
            .collect();

        let transformer_enabled =
            contributors.is_empty() || contributors.iter().any(|rule| rule.pipeline.transformer);

        if transformer_enabled {
            transform::build_payload(target, envelope)
        } else {
            transform::passthrough(envelope)
        }
    }

    fn fail_stage(&self, stage: Stage, message_id: Uuid, detail: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%message_id, %stage, detail, "pipeline stage failed");
        self.bus.publish(
            topics::ERROR_OCCURRED,
            &BusEvent::Error(Arc::new(StageError {
                message_id: Some(message_id),
                stage,
                detail: detail.to_string(),
            })),
            Some("data_pipeline"),
        );
    }

    fn publish_duration(&self, name: &str, elapsed: Duration) {
        self.bus.publish(
            topics::METRICS_PIPELINE,
            &BusEvent::Metric(Arc::new(MetricSample {
                name: name.to_string(),
                value: elapsed.as_secs_f64() * 1_000.0,
            })),
            Some("data_pipeline"),
        );
    }

    async fn stop_entry(entry: TargetEntry) {
        let TargetEntry { runner, worker } = entry;
        let TargetWorker { queue, shutdown, handle } = worker;

        // Closing the queue lets the worker drain and report leftovers
        drop(queue);
        let _ = shutdown.send(true);

        let abort = handle.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            tracing::warn!(sink = %runner.target().name, "worker exceeded shutdown grace, aborting");
            abort.abort();
        }

        runner.emitter().stop().await;
    }
}

impl std::fmt::Debug for DataPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("DataPipeline")
            .field("schemas", &stats.schemas)
            .field("targets", &stats.targets)
            .field("processed", &stats.processed)
            .finish()
    }
}

/// Per-target delivery worker: serializes deliveries to one target while
/// different targets run concurrently, and implements the batching window.
fn spawn_worker(runner: Arc<ForwarderRunner>) -> TargetWorker {
    let (queue, mut rx) = mpsc::unbounded_channel::<ForwardJob>();
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let config = runner.target().forwarder.clone();

    let handle = tokio::spawn(async move {
        loop {
            let first = tokio::select! {
                _ = shutdown_rx.changed() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let mut batch = vec![first];
            if config.batch_size > 1 {
                let window = tokio::time::sleep(config.batch_window());
                tokio::pin!(window);
                while batch.len() < config.batch_size {
                    tokio::select! {
                        () = &mut window => break,
                        job = rx.recv() => match job {
                            Some(job) => batch.push(job),
                            None => break,
                        },
                    }
                }
            }

            tokio::select! {
                _ = runner.forward(&batch) => {},
                _ = shutdown_rx.changed() => {
                    // Aborted mid-flight by shutdown
                    runner.report_cancelled(&batch);
                    break;
                },
            }
        }

        // Anything still queued at shutdown is cancelled, not silently lost
        rx.close();
        let mut leftover = Vec::new();
        while let Ok(job) = rx.try_recv() {
            leftover.push(job);
        }
        if !leftover.is_empty() {
            runner.report_cancelled(&leftover);
        }
    });

    TargetWorker { queue, shutdown, handle }
}
