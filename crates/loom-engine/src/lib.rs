pub mod expr;
pub mod graph;
pub mod runtime;
pub mod store;
pub mod stream;

pub use expr::{evaluate, evaluate_bool, ExprError};
pub use graph::{
    Backoff, EdgeCondition, EdgeSpec, ExponentialBackoff, GraphExecutor, GraphSpec, NoBackoff,
    NodeRegistry, NodeSpec, NodeType,
};
pub use runtime::{Runtime, RuntimeStatus, TriggerOutcome};
pub use store::MemoryStore;
pub use stream::{ExecutionStream, StreamOptions, WaitOutcome};
