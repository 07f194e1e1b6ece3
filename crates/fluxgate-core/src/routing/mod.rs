//! Declarative routing: rule registration and evaluation.
//!
//! Rules are held sorted by priority (descending, registration order breaking
//! ties) behind a read-mostly lock. Evaluation snapshots the list under a
//! read lock and then runs lock-free, so re-registering rules mid-evaluation
//! affects the next message, never the current one.

mod rule;

use std::sync::{Arc, Mutex, RwLock};

pub use rule::{
    ConditionOperator, LogicalOperator, PipelineHints, RoutingCondition, RoutingRule, SourceConfig,
};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    bus::{BusEvent, EventBus, SubscriptionId, topics},
    envelope::{Envelope, RuleMatch},
    glob::glob_match,
};

/// Counters surfaced by [`RoutingEngine::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct RoutingStats {
    /// Registered rules.
    pub total_rules: usize,
    /// Rules that can currently match.
    pub active_rules: usize,
    /// Whether the engine is subscribed to `DATA_PARSED`.
    pub auto_routing_active: bool,
}

struct RuleEntry {
    rule: Arc<RoutingRule>,
    seq: u64,
}

#[derive(Default)]
struct RuleSet {
    entries: Vec<RuleEntry>,
    next_seq: u64,
}

/// Matches envelopes against the registered rule set and decorates them with
/// the routing decision.
pub struct RoutingEngine {
    bus: Arc<EventBus>,
    rules: RwLock<RuleSet>,
    auto_subscription: Mutex<Option<SubscriptionId>>,
    /// Self-reference handed to the auto-routing subscription so the bus
    /// does not keep the engine alive.
    weak: std::sync::Weak<Self>,
}

impl RoutingEngine {
    /// Engine publishing decisions on `bus`.
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            bus,
            rules: RwLock::new(RuleSet::default()),
            auto_subscription: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Register a rule, re-sorting by priority descending.
    ///
    /// The sort is stable over a monotonic registration sequence, so rules of
    /// equal priority keep their registration order.
    pub fn register(&self, rule: RoutingRule) {
        let mut set = self.rules.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let seq = set.next_seq;
        set.next_seq += 1;

        tracing::info!(rule = %rule.name, priority = rule.priority, "routing rule registered");
        set.entries.push(RuleEntry { rule: Arc::new(rule), seq });
        set.entries.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority).then(a.seq.cmp(&b.seq)));
    }

    /// Remove a rule by id. Returns whether it was present.
    pub fn unregister(&self, rule_id: Uuid) -> bool {
        let mut set = self.rules.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = set.entries.len();
        set.entries.retain(|entry| entry.rule.id != rule_id);
        let removed = set.entries.len() != before;
        if removed {
            tracing::info!(%rule_id, "routing rule unregistered");
        }
        removed
    }

    /// Snapshot of the registered rules in evaluation order.
    #[must_use]
    pub fn rules(&self) -> Vec<Arc<RoutingRule>> {
        let set = self.rules.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        set.entries.iter().map(|entry| Arc::clone(&entry.rule)).collect()
    }

    /// Look up one registered rule by id.
    #[must_use]
    pub fn rule(&self, rule_id: Uuid) -> Option<Arc<RoutingRule>> {
        let set = self.rules.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        set.entries.iter().find(|entry| entry.rule.id == rule_id).map(|e| Arc::clone(&e.rule))
    }

    /// Rules matching `envelope`, in priority order.
    #[must_use]
    pub fn find_matching_rules(&self, envelope: &Envelope) -> Vec<Arc<RoutingRule>> {
        self.rules()
            .into_iter()
            .filter(|rule| rule.is_active && evaluate_rule(rule, envelope))
            .collect()
    }

    /// Attach the routing decision to a copy of `envelope` without
    /// publishing.
    ///
    /// `matched_rules` keeps priority order; `target_system_ids` is the
    /// deduplicated union of the matched rules' targets, highest-priority
    /// contributor first.
    #[must_use]
    pub fn decide(&self, envelope: &Envelope) -> Envelope {
        let matched = self.find_matching_rules(envelope);

        let mut decided = envelope.clone();
        decided.matched_rules = matched
            .iter()
            .map(|rule| RuleMatch {
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                priority: rule.priority,
            })
            .collect();

        decided.target_system_ids.clear();
        for rule in &matched {
            for target_id in &rule.target_system_ids {
                if !decided.target_system_ids.contains(target_id) {
                    decided.target_system_ids.push(*target_id);
                }
            }
        }

        decided
    }

    /// Route `envelope`: decide, publish `ROUTING_DECIDED`, and return the
    /// decorated envelope.
    pub fn route(&self, envelope: &Envelope) -> Arc<Envelope> {
        let decided = Arc::new(self.decide(envelope));

        tracing::debug!(
            message_id = %decided.message_id,
            matched = decided.matched_rules.len(),
            targets = decided.target_system_ids.len(),
            "message routed"
        );
        self.bus.publish(
            topics::ROUTING_DECIDED,
            &BusEvent::Message(Arc::clone(&decided)),
            Some("routing_engine"),
        );

        decided
    }

    /// Subscribe to `DATA_PARSED` and route every parsed message.
    ///
    /// Evaluation failures are logged; the engine keeps running.
    pub fn start_auto_routing(&self) {
        let mut slot =
            self.auto_subscription.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.is_some() {
            tracing::warn!("auto-routing already active");
            return;
        }

        let weak = self.weak.clone();
        let id = self.bus.subscribe(topics::DATA_PARSED, move |event, _topic, _source| {
            let Some(engine) = weak.upgrade() else {
                return Ok(());
            };
            if let Some(envelope) = event.envelope() {
                engine.route(envelope);
            }
            Ok(())
        });

        *slot = Some(id);
        tracing::info!("auto-routing started");
    }

    /// Drop the `DATA_PARSED` subscription.
    pub fn stop_auto_routing(&self) {
        let mut slot =
            self.auto_subscription.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(id) = slot.take() {
            self.bus.unsubscribe(id);
            tracing::info!("auto-routing stopped");
        }
    }

    /// Engine counters.
    #[must_use]
    pub fn stats(&self) -> RoutingStats {
        let rules = self.rules();
        RoutingStats {
            total_rules: rules.len(),
            active_rules: rules.iter().filter(|r| r.is_active).count(),
            auto_routing_active: self
                .auto_subscription
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .is_some(),
        }
    }
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("RoutingEngine")
            .field("total_rules", &stats.total_rules)
            .field("auto_routing", &stats.auto_routing_active)
            .finish()
    }
}

fn evaluate_rule(rule: &RoutingRule, envelope: &Envelope) -> bool {
    if !matches_source_config(&rule.source_config, envelope) {
        return false;
    }

    // A rule with no conditions matches unconditionally
    if rule.conditions.is_empty() {
        return true;
    }

    let mut results = rule.conditions.iter().map(|cond| evaluate_condition(cond, envelope));
    match rule.logical_operator {
        LogicalOperator::And => results.all(|r| r),
        LogicalOperator::Or => results.any(|r| r),
    }
}

fn matches_source_config(config: &SourceConfig, envelope: &Envelope) -> bool {
    if !config.protocols.is_empty() {
        let Some(protocol) = envelope.source_protocol else {
            return false;
        };
        let accepted = config.protocols.iter().any(|p| p.eq_ignore_ascii_case(protocol.as_str()));
        if !accepted {
            return false;
        }
    }

    if !config.source_ids.is_empty() {
        let Some(source_id) = &envelope.source_id else {
            return false;
        };
        if !config.source_ids.iter().any(|id| id == source_id) {
            return false;
        }
    }

    if let Some(pattern) = config.pattern.as_deref() {
        if !pattern.is_empty() && pattern != "*" {
            let Some(text) = envelope.text_rendering() else {
                return false;
            };
            if !glob_match(pattern, &text) {
                return false;
            }
        }
    }

    true
}

fn evaluate_condition(condition: &RoutingCondition, envelope: &Envelope) -> bool {
    // Absent field: the condition cannot hold
    let Some(field_value) = envelope.field(&condition.field_path) else {
        return false;
    };
    let expected = &condition.value;

    match condition.operator {
        ConditionOperator::Eq => value_eq(&field_value, expected),
        ConditionOperator::Ne => !value_eq(&field_value, expected),
        ConditionOperator::Gt => compare(&field_value, expected).is_some_and(std::cmp::Ordering::is_gt),
        ConditionOperator::Ge => compare(&field_value, expected).is_some_and(std::cmp::Ordering::is_ge),
        ConditionOperator::Lt => compare(&field_value, expected).is_some_and(std::cmp::Ordering::is_lt),
        ConditionOperator::Le => compare(&field_value, expected).is_some_and(std::cmp::Ordering::is_le),
        ConditionOperator::In => membership(expected, &field_value, &condition.field_path),
        ConditionOperator::NotIn => !membership(expected, &field_value, &condition.field_path),
        ConditionOperator::Contains => contains(&field_value, expected),
        ConditionOperator::NotContains => !contains(&field_value, expected),
    }
}

/// Equality with numeric coercion: `1` and `1.0` are equal.
fn value_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    a == b
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    tracing::warn!(left = %a, right = %b, "incomparable values in routing condition");
    None
}

/// `IN`/`NOT_IN`: the rule-side value must be a sequence.
fn membership(sequence: &Value, field_value: &Value, field_path: &str) -> bool {
    let Some(items) = sequence.as_array() else {
        tracing::warn!(field_path, "IN/NOT_IN rule value is not a sequence");
        return false;
    };
    items.iter().any(|item| value_eq(item, field_value))
}

/// `CONTAINS`: substring on strings, membership on sequences.
fn contains(field_value: &Value, expected: &Value) -> bool {
    match field_value {
        Value::String(text) => expected.as_str().is_some_and(|needle| text.contains(needle)),
        Value::Array(items) => items.iter().any(|item| value_eq(item, expected)),
        _ => false,
    }
}
