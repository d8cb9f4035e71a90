use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use loom_core::traits::NodeBody;

/// What kind of work a node performs. Informational: dispatch goes through
/// the [`NodeRegistry`], not the tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    LlmGenerate,
    LlmToolUse,
    ToolUse,
    #[default]
    Function,
    HumanInput,
    EventLoop,
    Router,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::LlmGenerate => "llm_generate",
            NodeType::LlmToolUse => "llm_tool_use",
            NodeType::ToolUse => "tool_use",
            NodeType::Function => "function",
            NodeType::HumanInput => "human_input",
            NodeType::EventLoop => "event_loop",
            NodeType::Router => "router",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in the execution graph.
///
/// Input/output keys are the node's contract on the shared run context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub node_type: NodeType,
    /// Keys that must be present in the run context before execution.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Keys this node is expected to write.
    #[serde(default)]
    pub output_keys: Vec<String>,
    /// Total attempts allowed; 0 and 1 both mean a single attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl NodeSpec {
    /// Create a new node with minimal configuration.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            node_type: NodeType::default(),
            input_keys: vec![],
            output_keys: vec![],
            max_retries: default_max_retries(),
        }
    }

    pub fn with_type(mut self, node_type: NodeType) -> Self {
        self.node_type = node_type;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_inputs(mut self, keys: &[&str]) -> Self {
        self.input_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, keys: &[&str]) -> Self {
        self.output_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Node id → implementation. A body registered here only runs if the
/// graph actually routes to its node.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    bodies: HashMap<String, Arc<dyn NodeBody>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node_id: impl Into<String>, body: Arc<dyn NodeBody>) {
        self.bodies.insert(node_id.into(), body);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, node_id: impl Into<String>, body: Arc<dyn NodeBody>) -> Self {
        self.register(node_id, body);
        self
    }

    pub fn get(&self, node_id: &str) -> Option<&Arc<dyn NodeBody>> {
        self.bodies.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.bodies.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.bodies.keys().collect();
        ids.sort();
        f.debug_struct("NodeRegistry").field("nodes", &ids).finish()
    }
}
