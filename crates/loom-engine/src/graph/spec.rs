use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use loom_core::error::{LoomError, Result};

use super::edge::{EdgeCondition, EdgeSpec};
use super::node::NodeSpec;
use crate::expr;

/// Declarative graph: nodes, edges and where runs start and stop.
///
/// Build it, call [`validate`](Self::validate) (the loaders do this), then
/// treat it as read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    pub id: String,
    #[serde(default)]
    pub goal_id: String,
    pub entry_node: String,
    /// Reaching one of these ends the run.
    #[serde(default)]
    pub terminal_nodes: BTreeSet<String>,
    /// Reaching one of these ends the run and records `paused_at`.
    #[serde(default)]
    pub pause_nodes: BTreeSet<String>,
    /// Named alternative starting nodes: entry point id → node id.
    #[serde(default)]
    pub entry_points: HashMap<String, String>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// Step ceiling; the runtime default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,
}

impl GraphSpec {
    pub fn new(id: impl Into<String>, entry_node: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            goal_id: String::new(),
            entry_node: entry_node.into(),
            terminal_nodes: BTreeSet::new(),
            pause_nodes: BTreeSet::new(),
            entry_points: HashMap::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            max_steps: None,
        }
    }

    pub fn with_goal(mut self, goal_id: impl Into<String>) -> Self {
        self.goal_id = goal_id.into();
        self
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_terminal(mut self, node_id: impl Into<String>) -> Self {
        self.terminal_nodes.insert(node_id.into());
        self
    }

    pub fn with_pause(mut self, node_id: impl Into<String>) -> Self {
        self.pause_nodes.insert(node_id.into());
        self
    }

    pub fn with_entry_point(mut self, name: impl Into<String>, node_id: impl Into<String>) -> Self {
        self.entry_points.insert(name.into(), node_id.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.node(node_id).is_some()
    }

    /// Outgoing edges of a node, in declaration order.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a EdgeSpec> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    pub fn is_terminal(&self, node_id: &str) -> bool {
        self.terminal_nodes.contains(node_id)
    }

    pub fn is_pause(&self, node_id: &str) -> bool {
        self.pause_nodes.contains(node_id)
    }

    /// Check every node reference. All problems are reported together.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.nodes.is_empty() {
            problems.push("graph has no nodes".to_string());
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                problems.push("node with empty id".to_string());
            } else if !seen.insert(node.id.as_str()) {
                problems.push(format!("duplicate node id '{}'", node.id));
            }
        }

        if !self.has_node(&self.entry_node) {
            problems.push(format!("entry node '{}' is not declared", self.entry_node));
        }
        for id in &self.terminal_nodes {
            if !self.has_node(id) {
                problems.push(format!("terminal node '{}' is not declared", id));
            }
        }
        for id in &self.pause_nodes {
            if !self.has_node(id) {
                problems.push(format!("pause node '{}' is not declared", id));
            }
        }

        let mut entry_points: Vec<_> = self.entry_points.iter().collect();
        entry_points.sort();
        for (name, id) in entry_points {
            if !self.has_node(id) {
                problems.push(format!("entry point '{}' targets undeclared node '{}'", name, id));
            }
        }

        let mut edge_ids = HashSet::new();
        for edge in &self.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                problems.push(format!("duplicate edge id '{}'", edge.id));
            }
            if !self.has_node(&edge.source) {
                problems.push(format!("edge '{}' source '{}' is not declared", edge.id, edge.source));
            }
            if !self.has_node(&edge.target) {
                problems.push(format!("edge '{}' target '{}' is not declared", edge.id, edge.target));
            }
            let has_expr = edge
                .condition_expr
                .as_deref()
                .is_some_and(|e| !e.trim().is_empty());
            if edge.condition == EdgeCondition::Conditional && !has_expr {
                problems.push(format!("conditional edge '{}' has no condition_expr", edge.id));
            }
        }

        if self.max_steps == Some(0) {
            problems.push("max_steps must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(LoomError::GraphValidation(problems.join("; ")))
        }
    }

    /// Condition expressions that will never parse. These edges can never be
    /// taken; the graph is still valid.
    pub fn expression_warnings(&self) -> Vec<String> {
        self.edges
            .iter()
            .filter_map(|edge| {
                let src = edge.condition_expr.as_deref()?;
                expr::parse(src)
                    .err()
                    .map(|e| format!("edge '{}': {}", edge.id, e))
            })
            .collect()
    }

    /// Fill in generated edge ids.
    fn normalize(mut self) -> Self {
        for edge in &mut self.edges {
            if edge.id.is_empty() {
                edge.id = format!("{}->{}", edge.source, edge.target);
            }
        }
        self
    }

    /// Parse and validate a JSON graph.
    pub fn from_json(content: &str) -> Result<Self> {
        let spec: GraphSpec = serde_json::from_str(content)?;
        let spec = spec.normalize();
        spec.validate()?;
        Ok(spec)
    }

    /// Parse and validate a TOML graph.
    pub fn from_toml(content: &str) -> Result<Self> {
        let spec: GraphSpec =
            toml::from_str(content).map_err(|e| LoomError::GraphValidation(e.to_string()))?;
        let spec = spec.normalize();
        spec.validate()?;
        Ok(spec)
    }

    /// Load a graph file; `.toml` is read as TOML, anything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_json(&content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> GraphSpec {
        GraphSpec::new("g", "a")
            .with_node(NodeSpec::new("a", "A"))
            .with_node(NodeSpec::new("b", "B"))
            .with_edge(EdgeSpec::always("a", "b"))
            .with_terminal("b")
    }

    #[test]
    fn valid_graph_passes() {
        linear().validate().unwrap();
    }

    #[test]
    fn reports_every_problem() {
        let spec = GraphSpec::new("g", "missing")
            .with_node(NodeSpec::new("a", "A"))
            .with_node(NodeSpec::new("a", "A again"))
            .with_edge(EdgeSpec::always("a", "ghost"))
            .with_edge(EdgeSpec::on_success("a", "b").with_id("x").with_expr(""))
            .with_edge(EdgeSpec {
                id: "c".into(),
                source: "a".into(),
                target: "a".into(),
                condition: EdgeCondition::Conditional,
                condition_expr: None,
            })
            .with_terminal("nowhere");

        let err = spec.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate node id 'a'"));
        assert!(err.contains("entry node 'missing'"));
        assert!(err.contains("terminal node 'nowhere'"));
        assert!(err.contains("target 'ghost'"));
        assert!(err.contains("target 'b'"));
        assert!(err.contains("conditional edge 'c'"));
    }

    #[test]
    fn outgoing_keeps_declaration_order() {
        let spec = linear()
            .with_edge(EdgeSpec::on_failure("a", "b").with_id("second"));
        let ids: Vec<&str> = spec.outgoing("a").map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a->b", "second"]);
    }

    #[test]
    fn from_json_generates_edge_ids() {
        let spec = GraphSpec::from_json(
            r#"{
                "id": "g",
                "entry_node": "a",
                "terminal_nodes": ["b"],
                "nodes": [{"id": "a", "name": "A"}, {"id": "b", "name": "B"}],
                "edges": [{"source": "a", "target": "b", "condition": "on_success"}]
            }"#,
        )
        .unwrap();
        assert_eq!(spec.edges[0].id, "a->b");
        assert!(spec.is_terminal("b"));
    }

    #[test]
    fn from_json_rejects_dangling_edges() {
        let err = GraphSpec::from_json(
            r#"{"id": "g", "entry_node": "a", "nodes": [{"id": "a", "name": "A"}],
                "edges": [{"source": "a", "target": "zzz"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, LoomError::GraphValidation(_)));
    }

    #[test]
    fn load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.toml");
        std::fs::write(
            &path,
            r#"
id = "review"
entry_node = "draft"
terminal_nodes = ["done"]
max_steps = 10

[[nodes]]
id = "draft"
name = "Draft"
node_type = "llm_generate"

[[nodes]]
id = "done"
name = "Done"

[[edges]]
source = "draft"
target = "done"
condition = "conditional"
condition_expr = "output.get('score', 0) > 0.5"
"#,
        )
        .unwrap();

        let spec = GraphSpec::load(&path).unwrap();
        assert_eq!(spec.max_steps, Some(10));
        assert_eq!(spec.edges[0].condition, EdgeCondition::Conditional);
        assert!(spec.expression_warnings().is_empty());
    }

    #[test]
    fn unparseable_expressions_are_warnings() {
        let spec = linear().with_edge(EdgeSpec::conditional("a", "b", "x =").with_id("bad"));
        spec.validate().unwrap();
        let warnings = spec.expression_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("edge 'bad'"));
    }
}
