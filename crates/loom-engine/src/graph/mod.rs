//! Graph model and traversal.
//!
//! A workflow is a directed graph of `NodeSpec`s connected by `EdgeSpec`s.
//! Node bodies are looked up by node id in a `NodeRegistry`. Edges carry a
//! condition (always, on success, on failure, a sandbox expression, or an
//! external decision).
//!
//! The `GraphExecutor` walks the graph from an entry node, executing each node
//! and following the first matching edge, passing data between nodes via the
//! run context.

pub mod backoff;
pub mod edge;
pub mod executor;
pub mod node;
pub mod spec;

pub use backoff::{Backoff, ExponentialBackoff, NoBackoff};
pub use edge::{EdgeCondition, EdgeSpec};
pub use executor::{GraphExecutor, DEFAULT_MAX_STEPS};
pub use node::{NodeRegistry, NodeSpec, NodeType};
pub use spec::GraphSpec;
