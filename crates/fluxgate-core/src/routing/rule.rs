//! Routing rule model: conditions, operators, and source pre-filters.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Comparison applied between a resolved field value and the rule-side value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOperator {
    /// Equality (numeric values compare by magnitude).
    #[serde(rename = "==")]
    Eq,
    /// Inequality.
    #[serde(rename = "!=")]
    Ne,
    /// Strictly greater.
    #[serde(rename = ">")]
    Gt,
    /// Greater or equal.
    #[serde(rename = ">=")]
    Ge,
    /// Strictly less.
    #[serde(rename = "<")]
    Lt,
    /// Less or equal.
    #[serde(rename = "<=")]
    Le,
    /// Field value is a member of the rule-side sequence.
    #[serde(rename = "IN")]
    In,
    /// Field value is not a member of the rule-side sequence.
    #[serde(rename = "NOT_IN")]
    NotIn,
    /// Field value contains the rule-side value (substring or membership).
    #[serde(rename = "CONTAINS")]
    Contains,
    /// Negation of `CONTAINS`.
    #[serde(rename = "NOT_CONTAINS")]
    NotContains,
}

/// How a rule's condition results combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    /// Every condition must hold.
    #[default]
    And,
    /// At least one condition must hold.
    Or,
}

/// One predicate over a dotted envelope field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingCondition {
    /// Dotted path resolved against the envelope
    /// (e.g. `parsed_data.temperature`).
    pub field_path: String,
    /// Comparison operator.
    pub operator: ConditionOperator,
    /// Rule-side comparison value. Must be an array for `IN`/`NOT_IN`.
    pub value: Value,
}

/// Cheap pre-filter evaluated before a rule's conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Accepted source protocols (case-insensitive); empty accepts all.
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Accepted data-source identifiers; empty accepts all.
    #[serde(default)]
    pub source_ids: Vec<String>,
    /// Glob pattern over the message's text rendering; `None` and `"*"`
    /// accept all.
    #[serde(default)]
    pub pattern: Option<String>,
}

impl SourceConfig {
    /// Whether the filter accepts every message.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.protocols.is_empty()
            && self.source_ids.is_empty()
            && self.pattern.as_deref().is_none_or(|p| p.is_empty() || p == "*")
    }
}

/// Per-rule stage toggles.
///
/// `transformer = false` forwards the matched message without per-target
/// field mapping. The parser and validator toggles are carried for the
/// management surface; parsing is governed by schema bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineHints {
    /// Parse stage toggle.
    pub parser: bool,
    /// Validation stage toggle.
    pub validator: bool,
    /// Per-target transform toggle.
    pub transformer: bool,
}

impl Default for PipelineHints {
    fn default() -> Self {
        Self { parser: true, validator: false, transformer: true }
    }
}

/// Declarative predicate plus target list, ordered by priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Rule identity.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Operator-assigned name.
    pub name: String,
    /// Evaluation priority; higher first, ties broken by registration order.
    #[serde(default)]
    pub priority: i32,
    /// Inactive rules stay registered but never match.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Unpublished rules are rejected at registration.
    #[serde(default = "default_true")]
    pub is_published: bool,
    /// Source pre-filter.
    #[serde(default)]
    pub source_config: SourceConfig,
    /// Conditions; an empty list matches unconditionally.
    #[serde(default)]
    pub conditions: Vec<RoutingCondition>,
    /// How condition results combine.
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    /// Targets the rule routes to; must be non-empty for the rule to be
    /// usable.
    pub target_system_ids: Vec<Uuid>,
    /// Stage toggles.
    #[serde(default)]
    pub pipeline: PipelineHints,
}

fn default_true() -> bool {
    true
}
