use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use loom_core::types::RunContext;

use crate::expr::{self, ExprError};

/// An edge connecting two nodes in the execution graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    /// Defaults to `source->target` when a loaded graph leaves it empty.
    #[serde(default)]
    pub id: String,
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    #[serde(default)]
    pub condition: EdgeCondition,
    /// Sandbox expression; required for `conditional`, optional fallback for `llm_decide`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_expr: Option<String>,
}

/// Condition for traversing an edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    #[default]
    Always,
    OnSuccess,
    OnFailure,
    Conditional,
    LlmDecide,
}

impl EdgeCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeCondition::Always => "always",
            EdgeCondition::OnSuccess => "on_success",
            EdgeCondition::OnFailure => "on_failure",
            EdgeCondition::Conditional => "conditional",
            EdgeCondition::LlmDecide => "llm_decide",
        }
    }
}

impl fmt::Display for EdgeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EdgeSpec {
    fn build(
        source: impl Into<String>,
        target: impl Into<String>,
        condition: EdgeCondition,
        condition_expr: Option<String>,
    ) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            target,
            condition,
            condition_expr,
        }
    }

    /// Create an unconditional edge.
    pub fn always(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::build(source, target, EdgeCondition::Always, None)
    }

    /// Create an edge that fires on success.
    pub fn on_success(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::build(source, target, EdgeCondition::OnSuccess, None)
    }

    /// Create an edge that fires on failure.
    pub fn on_failure(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::build(source, target, EdgeCondition::OnFailure, None)
    }

    /// Create a conditional edge.
    pub fn conditional(
        source: impl Into<String>,
        target: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self::build(source, target, EdgeCondition::Conditional, Some(expr.into()))
    }

    /// Create an edge decided by the external decision collaborator.
    pub fn llm_decide(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::build(source, target, EdgeCondition::LlmDecide, None)
    }

    /// Override the generated `source->target` id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach a fallback expression (used by `llm_decide` edges).
    pub fn with_expr(mut self, expr: impl Into<String>) -> Self {
        self.condition_expr = Some(expr.into());
        self
    }
}

/// Variables visible to a condition expression.
///
/// Every context key, plus `output` (the last node's output), `memory`
/// (the whole context) and `result` (`output["result"]`, or None).
pub fn condition_vars(
    ctx: &RunContext,
    output: &HashMap<String, serde_json::Value>,
) -> HashMap<String, serde_json::Value> {
    let mut vars = ctx.data().clone();
    let output_json = serde_json::Value::Object(
        output.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    );
    let memory_json = serde_json::Value::Object(
        ctx.data().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    );
    vars.insert(
        "result".to_string(),
        output.get("result").cloned().unwrap_or(serde_json::Value::Null),
    );
    vars.insert("output".to_string(), output_json);
    vars.insert("memory".to_string(), memory_json);
    vars
}

/// Evaluate a condition expression to a boolean.
pub fn evaluate_condition(
    expr: &str,
    vars: &HashMap<String, serde_json::Value>,
) -> Result<bool, ExprError> {
    expr::evaluate_bool(expr, vars)
}
