//! In-process topic publish/subscribe.
//!
//! The bus is the spine of the gateway: adapters publish inbound envelopes,
//! the pipeline and routing engine subscribe and republish, forwarders report
//! results. It is intentionally minimal: no queueing, no persistence, no
//! cross-process transport. `publish` invokes matching subscribers
//! synchronously on the caller's task and never suspends.
//!
//! # Concurrency
//!
//! The subscriber map is guarded by a mutex only while the matching set is
//! snapshotted; callbacks run outside the lock. Callbacks may therefore
//! subscribe, unsubscribe, or publish re-entrantly without deadlocking.
//!
//! # Failure isolation
//!
//! A subscriber that returns an error or panics is logged and never prevents
//! delivery to the remaining subscribers. The count returned by `publish`
//! includes failed invocations.

use std::{
    collections::HashMap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    envelope::{Envelope, Stage},
    forward::ForwardResult,
    glob::glob_match,
};

/// Canonical bus topic names.
pub mod topics {
    /// Frame parse finished (or structured payload ready) for routing.
    pub const DATA_PARSED: &str = "DATA_PARSED";
    /// Routing decision attached to the envelope.
    pub const ROUTING_DECIDED: &str = "ROUTING_DECIDED";
    /// Final (or retrying) delivery result for one target.
    pub const FORWARD_RESULT: &str = "FORWARD_RESULT";
    /// A stage failed for one message.
    pub const ERROR_OCCURRED: &str = "ERROR_OCCURRED";
    /// Pipeline timing samples.
    pub const METRICS_PIPELINE: &str = "METRICS_PIPELINE";
    /// Wildcard subscription covering every adapter's inbound topic.
    pub const ANY_RECEIVED: &str = "*_RECEIVED";
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Report published on [`topics::FORWARD_RESULT`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardReport {
    /// Message the delivery belongs to.
    pub message_id: Uuid,
    /// Target system delivered to.
    pub target_id: Uuid,
    /// Target system name, for log readability.
    pub target_name: String,
    /// Delivery outcome.
    pub result: ForwardResult,
}

/// Report published on [`topics::ERROR_OCCURRED`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    /// Message the failure belongs to, when one exists yet.
    pub message_id: Option<Uuid>,
    /// Stage that failed.
    pub stage: Stage,
    /// Failure description.
    pub detail: String,
}

/// Sample published on `METRICS_*` topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    /// Metric name.
    pub name: String,
    /// Metric value.
    pub value: f64,
}

/// Payload delivered to subscribers.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// An envelope moving through the message plane.
    Message(Arc<Envelope>),
    /// A delivery result.
    Forward(Arc<ForwardReport>),
    /// A stage failure.
    Error(Arc<StageError>),
    /// A metric sample.
    Metric(Arc<MetricSample>),
}

impl BusEvent {
    /// The envelope inside a `Message` event, if that is what this is.
    #[must_use]
    pub fn envelope(&self) -> Option<&Arc<Envelope>> {
        match self {
            Self::Message(envelope) => Some(envelope),
            _ => None,
        }
    }
}

/// Error type subscribers may return; logged, never propagated.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

type Callback = Arc<dyn Fn(&BusEvent, &str, Option<&str>) -> Result<(), SubscriberError> + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    callback: Callback,
}

#[derive(Default)]
struct BusInner {
    /// Canonical topic (or wildcard pattern) → subscribers in registration
    /// order.
    subscribers: HashMap<String, Vec<Subscriber>>,
    /// Subscription id → topic key, for O(1) unsubscribe.
    index: HashMap<SubscriptionId, String>,
}

/// Thread-safe in-memory topic bus with wildcard subscriptions.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to `topic`.
    ///
    /// Topics are canonicalized to uppercase. A `*` in the topic makes it a
    /// shell-style wildcard pattern (`TEST_*`, `*_RECEIVED`). The callback is
    /// invoked as `(event, matched_topic, source)`.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&BusEvent, &str, Option<&str>) -> Result<(), SubscriberError>
            + Send
            + Sync
            + 'static,
    {
        let topic = topic.to_uppercase();
        let id = SubscriptionId(Uuid::new_v4());

        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .subscribers
            .entry(topic.clone())
            .or_default()
            .push(Subscriber { id, callback: Arc::new(callback) });
        inner.index.insert(id, topic.clone());
        drop(inner);

        tracing::debug!(%topic, subscription = %id, "subscribed");
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(topic) = inner.index.remove(&id) else {
            return false;
        };

        if let Some(list) = inner.subscribers.get_mut(&topic) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                inner.subscribers.remove(&topic);
            }
        }
        drop(inner);

        tracing::debug!(subscription = %id, "unsubscribed");
        true
    }

    /// Publish `event` on `topic`, invoking every matching subscriber.
    ///
    /// Matching subscribers are those registered on the exact canonical topic
    /// plus those whose registered pattern contains `*` and glob-matches it.
    /// Returns the number of invoked callbacks, failed ones included.
    pub fn publish(&self, topic: &str, event: &BusEvent, source: Option<&str>) -> usize {
        let topic = topic.to_uppercase();

        // Snapshot under the lock, invoke outside it
        let matched: Vec<(SubscriptionId, Callback)> = {
            let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            inner
                .subscribers
                .iter()
                .filter(|(registered, _)| {
                    *registered == &topic
                        || (registered.contains('*') && glob_match(registered, &topic))
                })
                .flat_map(|(_, list)| list.iter().map(|s| (s.id, Arc::clone(&s.callback))))
                .collect()
        };

        let mut invoked = 0;
        for (id, callback) in matched {
            match catch_unwind(AssertUnwindSafe(|| callback(event, &topic, source))) {
                Ok(Ok(())) => {},
                Ok(Err(error)) => {
                    tracing::error!(%topic, subscription = %id, %error, "subscriber failed");
                },
                Err(_) => {
                    tracing::error!(%topic, subscription = %id, "subscriber panicked");
                },
            }
            invoked += 1;
        }

        invoked
    }

    /// Number of subscriptions, on one topic or across all.
    #[must_use]
    pub fn subscriber_count(&self, topic: Option<&str>) -> usize {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match topic {
            Some(topic) => {
                inner.subscribers.get(&topic.to_uppercase()).map_or(0, Vec::len)
            },
            None => inner.subscribers.values().map(Vec::len).sum(),
        }
    }

    /// Every topic (or wildcard pattern) with at least one subscriber.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.subscribers.keys().cloned().collect()
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.subscribers.clear();
        inner.index.clear();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").field("subscriptions", &self.subscriber_count(None)).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn message() -> BusEvent {
        BusEvent::Message(Arc::new(Envelope::new()))
    }

    #[test]
    fn exact_topic_delivery_is_case_insensitive() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = Arc::clone(&hits);
        bus.subscribe("data_parsed", move |_, topic, _| {
            assert_eq!(topic, "DATA_PARSED");
            hits2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(bus.publish("Data_Parsed", &message(), None), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_matches_only_its_pattern() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen2 = Arc::clone(&seen);
        bus.subscribe("TEST_*", move |_, topic, _| {
            seen2.lock().expect("lock").push(topic.to_string());
            Ok(())
        });

        assert_eq!(bus.publish("test_a", &message(), None), 1);
        assert_eq!(bus.publish("other_b", &message(), None), 0);
        assert_eq!(*seen.lock().expect("lock"), vec!["TEST_A".to_string()]);
    }

    #[test]
    fn failing_subscriber_does_not_block_the_rest() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe("T", |_, _, _| Err("boom".into()));
        bus.subscribe("T", |_, _, _| panic!("subscriber bug"));
        let hits2 = Arc::clone(&hits);
        bus.subscribe("T", move |_, _, _| {
            hits2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        // Failed invocations still count
        assert_eq!(bus.publish("T", &message(), None), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = Arc::clone(&hits);
        let id = bus.subscribe("T", move |_, _, _| {
            hits2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish("T", &message(), None), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn source_is_passed_through() {
        let bus = EventBus::new();
        bus.subscribe("T", |_, _, source| {
            assert_eq!(source, Some("udp-adapter"));
            Ok(())
        });
        bus.publish("T", &message(), Some("udp-adapter"));
    }

    #[test]
    fn counts_and_topic_names() {
        let bus = EventBus::new();
        bus.subscribe("A", |_, _, _| Ok(()));
        bus.subscribe("A", |_, _, _| Ok(()));
        bus.subscribe("B_*", |_, _, _| Ok(()));

        assert_eq!(bus.subscriber_count(Some("a")), 2);
        assert_eq!(bus.subscriber_count(None), 3);

        let mut names = bus.topic_names();
        names.sort();
        assert_eq!(names, vec!["A".to_string(), "B_*".to_string()]);

        bus.clear();
        assert_eq!(bus.subscriber_count(None), 0);
    }

    #[test]
    fn reentrant_publish_from_callback_terminates() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let bus2 = Arc::clone(&bus);
        bus.subscribe("FIRST", move |event, _, _| {
            bus2.publish("SECOND", event, None);
            Ok(())
        });
        let hits2 = Arc::clone(&hits);
        bus.subscribe("SECOND", move |_, _, _| {
            hits2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(bus.publish("FIRST", &message(), None), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_from_callback_does_not_deadlock() {
        let bus = Arc::new(EventBus::new());
        let bus2 = Arc::clone(&bus);
        bus.subscribe("T", move |_, _, _| {
            bus2.subscribe("LATE", |_, _, _| Ok(()));
            Ok(())
        });

        bus.publish("T", &message(), None);
        assert_eq!(bus.subscriber_count(Some("LATE")), 1);
    }
}
