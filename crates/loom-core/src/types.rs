use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one triggered run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared key/value context for one run.
///
/// Owned by exactly one run; nodes read it and the executor merges their
/// outputs back in. Values are JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContext {
    data: HashMap<String, serde_json::Value>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RunContext from initial data.
    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Create a RunContext from a JSON object. Non-object values are stored under `input`.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self {
                data: map.into_iter().collect(),
            },
            serde_json::Value::Null => Self::new(),
            other => {
                let mut ctx = Self::new();
                ctx.set("input", other);
                ctx
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Merge another map into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &HashMap<String, serde_json::Value>) {
        for (k, v) in other {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Declared keys that are absent from the context.
    pub fn missing_keys<'a>(&self, keys: &'a [String]) -> Vec<&'a str> {
        keys.iter()
            .filter(|k| !self.data.contains_key(k.as_str()))
            .map(String::as_str)
            .collect()
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    pub fn into_inner(self) -> HashMap<String, serde_json::Value> {
        self.data
    }
}

/// Outcome of one node attempt.
///
/// `error` is present exactly when `success` is false; use the constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub success: bool,
    #[serde(default)]
    pub output: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub latency_ms: u64,
}

impl NodeResult {
    pub fn success(output: HashMap<String, serde_json::Value>) -> Self {
        Self {
            success: true,
            output,
            error: None,
            tokens_used: 0,
            latency_ms: 0,
        }
    }

    /// Successful result built from a JSON object (non-objects yield an empty output).
    pub fn from_json(output: serde_json::Value) -> Self {
        match output {
            serde_json::Value::Object(map) => Self::success(map.into_iter().collect()),
            _ => Self::success(HashMap::new()),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: HashMap::new(),
            error: Some(error.into()),
            tokens_used: 0,
            latency_ms: 0,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

/// Terminal outcome of one complete graph run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Visited node ids in order.
    pub node_path: Vec<String>,
    pub steps_executed: usize,
    pub total_tokens: u64,
    pub total_latency_ms: u64,
    /// Set when the run stopped at a pause node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<String>,
}

/// How an entry point is expected to be triggered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    Api,
    Webhook,
    Timer,
    Event,
}

/// A named, externally triggerable starting node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPointSpec {
    pub id: String,
    pub name: String,
    pub entry_node: String,
    #[serde(default)]
    pub trigger_type: TriggerType,
}

impl EntryPointSpec {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        entry_node: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            entry_node: entry_node.into(),
            trigger_type: TriggerType::Manual,
        }
    }

    pub fn with_trigger(mut self, trigger_type: TriggerType) -> Self {
        self.trigger_type = trigger_type;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_context_basic_operations() {
        let mut ctx = RunContext::new();
        ctx.set_str("name", "Alice");
        ctx.set("count", json!(42));

        assert_eq!(ctx.get_str("name"), Some("Alice"));
        assert_eq!(ctx.get("count"), Some(&json!(42)));
        assert_eq!(ctx.get("missing"), None);
    }

    #[test]
    fn run_context_from_json() {
        let ctx = RunContext::from_json(json!({"topic": "AI", "n": 2}));
        assert_eq!(ctx.get_str("topic"), Some("AI"));

        let ctx = RunContext::from_json(json!("raw text"));
        assert_eq!(ctx.get_str("input"), Some("raw text"));

        assert!(RunContext::from_json(serde_json::Value::Null).data().is_empty());
    }

    #[test]
    fn run_context_missing_keys() {
        let ctx = RunContext::from_json(json!({"a": 1}));
        let keys = vec!["a".to_string(), "b".to_string()];
        assert_eq!(ctx.missing_keys(&keys), vec!["b"]);
    }

    #[test]
    fn run_context_merge_overwrites() {
        let mut ctx = RunContext::from_json(json!({"a": 1, "b": 2}));
        let mut other = HashMap::new();
        other.insert("b".to_string(), json!("new"));
        ctx.merge(&other);
        assert_eq!(ctx.get("a"), Some(&json!(1)));
        assert_eq!(ctx.get_str("b"), Some("new"));
    }

    #[test]
    fn node_result_error_iff_failed() {
        let ok = NodeResult::from_json(json!({"score": 0.9}));
        assert!(ok.success);
        assert!(ok.error.is_none());
        assert_eq!(ok.output.get("score"), Some(&json!(0.9)));

        let failed = NodeResult::failure("boom");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn entry_point_serde_defaults() {
        let ep: EntryPointSpec =
            serde_json::from_value(json!({"id": "main", "name": "Main", "entry_node": "start"}))
                .unwrap();
        assert_eq!(ep.trigger_type, TriggerType::Manual);
        assert_eq!(ep, EntryPointSpec::new("main", "Main", "start"));
    }
}
