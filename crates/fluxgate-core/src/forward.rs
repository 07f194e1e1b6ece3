//! The forwarder seam: delivery trait, retry policy, and result types.
//!
//! Protocol emitters (HTTP, MQTT, raw sockets, WebSocket) implement
//! [`Forward`] and know only how to make one delivery attempt. Retries,
//! backoff, per-attempt timeouts, optional egress encryption, and result
//! reporting live in [`ForwarderRunner`], so every protocol shares one
//! policy.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use fluxgate_crypto::CryptoService;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    bus::{BusEvent, EventBus, ForwardReport, topics},
    model::TargetSystem,
};

/// First retry delay; doubles per attempt.
pub const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Ceiling on the retry delay.
pub const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Outcome category of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ForwardStatus {
    /// Delivered.
    Success,
    /// Terminally failed.
    Failure,
    /// Attempt failed; another attempt is scheduled.
    Retrying,
}

/// Result of a delivery (or of one attempt, for `Retrying` reports).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResult {
    /// Outcome category.
    pub status: ForwardStatus,
    /// Protocol status code, when the transport has one.
    pub status_code: Option<u16>,
    /// Failure description.
    pub error: Option<String>,
    /// Attempts consumed so far.
    pub attempts: u32,
}

impl ForwardResult {
    /// Whether the delivery ended in success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ForwardStatus::Success
    }
}

/// Classified delivery failure.
///
/// Only `Timeout`, `Connection`, and `Remote5xx` are retried; client errors
/// and cancellation are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForwardError {
    /// The attempt exceeded the configured timeout.
    #[error("attempt timed out")]
    Timeout,

    /// The transport could not reach the target.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The target rejected the request (4xx); retrying cannot help.
    #[error("remote rejected request: status {0}")]
    Remote4xx(u16),

    /// The target failed (5xx); worth retrying.
    #[error("remote failed: status {0}")]
    Remote5xx(u16),

    /// The delivery was aborted by shutdown.
    #[error("cancelled")]
    Cancelled,

    /// The payload cannot be rendered for this transport; retrying cannot
    /// help.
    #[error("payload cannot be rendered: {0}")]
    Payload(String),
}

impl ForwardError {
    /// Whether the retry policy applies to this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connection(_) | Self::Remote5xx(_))
    }

    /// Remote status code, when the failure carries one.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Remote4xx(code) | Self::Remote5xx(code) => Some(*code),
            _ => None,
        }
    }
}

/// Exponential backoff: `BACKOFF_BASE * 2^(attempt-1)`, capped.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1u32 << shift).min(BACKOFF_CAP)
}

/// One payload queued for delivery to a target.
#[derive(Debug, Clone)]
pub struct ForwardJob {
    /// Message the payload came from.
    pub message_id: Uuid,
    /// Transformed payload to deliver.
    pub payload: Value,
}

/// A protocol-specific delivery mechanism.
///
/// Implementations make exactly one attempt per `attempt` call and classify
/// failures; the runner owns retries and timeouts. A batch of one is the
/// common case; emitters may render larger batches however their protocol
/// prefers (JSON array body, one publish per payload, ...).
#[async_trait]
pub trait Forward: Send + Sync {
    /// Emitter name for logs.
    fn name(&self) -> &str;

    /// Bring up transport state (connections, background tasks).
    async fn start(&self) -> Result<(), ForwardError> {
        Ok(())
    }

    /// Tear down transport state.
    async fn stop(&self) {}

    /// Make one delivery attempt. Returns the protocol status code when the
    /// transport has one.
    async fn attempt(&self, batch: &[Value]) -> Result<Option<u16>, ForwardError>;
}

/// Drives one target's deliveries: encryption, timeout, retry, reporting.
pub struct ForwarderRunner {
    target: Arc<TargetSystem>,
    emitter: Arc<dyn Forward>,
    crypto: Arc<CryptoService>,
    bus: Arc<EventBus>,
}

impl ForwarderRunner {
    /// Bind an emitter to its target's delivery policy.
    #[must_use]
    pub fn new(
        target: Arc<TargetSystem>,
        emitter: Arc<dyn Forward>,
        crypto: Arc<CryptoService>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self { target, emitter, crypto, bus }
    }

    /// The target this runner delivers to.
    #[must_use]
    pub fn target(&self) -> &Arc<TargetSystem> {
        &self.target
    }

    /// The underlying protocol emitter.
    #[must_use]
    pub fn emitter(&self) -> &Arc<dyn Forward> {
        &self.emitter
    }

    /// Deliver one payload.
    pub async fn forward_one(&self, job: ForwardJob) -> ForwardResult {
        self.forward(&[job]).await
    }

    /// Deliver a batch, applying egress encryption and the retry policy.
    ///
    /// Every job in the batch shares one outcome; a `FORWARD_RESULT` report
    /// is published per job, including intermediate `Retrying` reports.
    pub async fn forward(&self, jobs: &[ForwardJob]) -> ForwardResult {
        let config = &self.target.forwarder;

        let payloads: Vec<Value> = if self.target.encryption_enabled {
            let wrapped: Result<Vec<Value>, _> =
                jobs.iter().map(|j| self.crypto.wrap_payload(&j.payload)).collect();
            match wrapped {
                Ok(wrapped) => wrapped,
                Err(error) => {
                    let result = ForwardResult {
                        status: ForwardStatus::Failure,
                        status_code: None,
                        error: Some(format!("egress encryption failed: {error}")),
                        attempts: 0,
                    };
                    self.report(jobs, &result);
                    return result;
                },
            }
        } else {
            jobs.iter().map(|j| j.payload.clone()).collect()
        };

        let max_attempts = config.max_retries.max(1);
        let mut attempt = 0;

        let result = loop {
            attempt += 1;
            let outcome =
                match tokio::time::timeout(config.timeout(), self.emitter.attempt(&payloads)).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ForwardError::Timeout),
                };

            match outcome {
                Ok(status_code) => {
                    break ForwardResult {
                        status: ForwardStatus::Success,
                        status_code,
                        error: None,
                        attempts: attempt,
                    };
                },
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        sink = %self.target.name,
                        attempt,
                        %error,
                        "delivery attempt failed, retrying"
                    );
                    self.report(
                        jobs,
                        &ForwardResult {
                            status: ForwardStatus::Retrying,
                            status_code: error.status_code(),
                            error: Some(error.to_string()),
                            attempts: attempt,
                        },
                    );
                    tokio::time::sleep(backoff_delay(attempt)).await;
                },
                Err(error) => {
                    break ForwardResult {
                        status: ForwardStatus::Failure,
                        status_code: error.status_code(),
                        error: Some(error.to_string()),
                        attempts: attempt,
                    };
                },
            }
        };

        self.report(jobs, &result);
        result
    }

    /// Report `Cancelled` for jobs abandoned by shutdown.
    pub fn report_cancelled(&self, jobs: &[ForwardJob]) {
        let result = ForwardResult {
            status: ForwardStatus::Failure,
            status_code: None,
            error: Some(ForwardError::Cancelled.to_string()),
            attempts: 0,
        };
        self.report(jobs, &result);
    }

    fn report(&self, jobs: &[ForwardJob], result: &ForwardResult) {
        for job in jobs {
            let report = ForwardReport {
                message_id: job.message_id,
                target_id: self.target.id,
                target_name: self.target.name.clone(),
                result: result.clone(),
            };
            self.bus.publish(
                topics::FORWARD_RESULT,
                &BusEvent::Forward(Arc::new(report)),
                Some("forwarder"),
            );
        }
    }
}

impl std::fmt::Debug for ForwarderRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwarderRunner")
            .field("target", &self.target.name)
            .field("emitter", &self.emitter.name())
            .finish_non_exhaustive()
    }
}
