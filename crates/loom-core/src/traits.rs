use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::hooks::{NodeEndEvent, NodeErrorEvent, NodeStartEvent};
use crate::types::{NodeResult, RunContext};

/// Node body: the work behind one graph node (LLM call, tool use, function, ...).
pub trait NodeBody: Send + Sync + 'static {
    /// Check the run context before execution. Returns one message per problem.
    ///
    /// The default checks that every declared input key is present.
    fn validate_input(&self, input_keys: &[String], ctx: &RunContext) -> Vec<String> {
        ctx.missing_keys(input_keys)
            .into_iter()
            .map(|k| format!("missing input key '{}'", k))
            .collect()
    }

    /// Run the node against a read-only view of the run context.
    ///
    /// `Ok` with `success == false` is a declared failure; `Err` is a defect.
    /// Both are retried the same way, but a defect keeps the original error
    /// for diagnostics.
    fn execute<'a>(&'a self, ctx: &'a RunContext) -> BoxFuture<'a, Result<NodeResult>>;
}

/// Observer of per-node lifecycle transitions. Every method is optional.
///
/// Errors (and panics) are logged with `name()` and never reach the run.
pub trait LifecycleHook: Send + Sync + 'static {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_node_start<'a>(&'a self, event: &'a NodeStartEvent) -> BoxFuture<'a, Result<()>> {
        let _ = event;
        Box::pin(async { Ok(()) })
    }

    fn on_node_end<'a>(&'a self, event: &'a NodeEndEvent) -> BoxFuture<'a, Result<()>> {
        let _ = event;
        Box::pin(async { Ok(()) })
    }

    fn on_node_error<'a>(&'a self, event: &'a NodeErrorEvent) -> BoxFuture<'a, Result<()>> {
        let _ = event;
        Box::pin(async { Ok(()) })
    }
}

/// External collaborator for `LLM_DECIDE` edges.
pub trait EdgeDecider: Send + Sync + 'static {
    /// Decide whether the edge from `source` to `target` should be taken.
    fn decide<'a>(
        &'a self,
        edge_id: &'a str,
        source: &'a str,
        target: &'a str,
        output: &'a HashMap<String, serde_json::Value>,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<bool>>;
}

/// Storage collaborator shared by all streams of a runtime.
pub trait StateStore: Send + Sync + 'static {
    fn put(&self, key: &str, value: serde_json::Value) -> BoxFuture<'_, Result<()>>;

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>>;

    /// Acquire backing resources. Called each time the runtime starts,
    /// including after a previous `close`.
    fn open(&self) -> BoxFuture<'_, Result<()>>;

    /// Release backing resources. Called when the runtime stops.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}
