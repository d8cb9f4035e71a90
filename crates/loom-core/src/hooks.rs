//! Lifecycle event records and isolated fan-out to hooks.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::warn;

use crate::error::{LoomError, Result};
use crate::traits::LifecycleHook;
use crate::types::ExecutionId;

/// A node attempt is starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStartEvent {
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
    /// Zero-based attempt number.
    pub attempt: u32,
}

/// A node finished successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndEvent {
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
}

/// A node attempt failed.
#[derive(Debug, Clone)]
pub struct NodeErrorEvent {
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
    pub error: String,
    /// The original error when the body raised instead of returning a failure.
    pub exception: Option<Arc<LoomError>>,
}

/// The set of hooks attached to a run. Delivery to each hook is isolated.
#[derive(Clone, Default)]
pub struct HookSet {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl HookSet {
    pub fn new(hooks: Vec<Arc<dyn LifecycleHook>>) -> Self {
        Self { hooks }
    }

    pub fn push(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn node_started(&self, event: &NodeStartEvent) {
        for hook in &self.hooks {
            let outcome = guard(async { hook.on_node_start(event).await }).await;
            report(hook.as_ref(), "on_node_start", &event.node_id, outcome);
        }
    }

    pub async fn node_ended(&self, event: &NodeEndEvent) {
        for hook in &self.hooks {
            let outcome = guard(async { hook.on_node_end(event).await }).await;
            report(hook.as_ref(), "on_node_end", &event.node_id, outcome);
        }
    }

    pub async fn node_failed(&self, event: &NodeErrorEvent) {
        for hook in &self.hooks {
            let outcome = guard(async { hook.on_node_error(event).await }).await;
            report(hook.as_ref(), "on_node_error", &event.node_id, outcome);
        }
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|h| h.name()))
            .finish()
    }
}

/// Run a hook future, turning a panic into an error.
async fn guard<F>(fut: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(LoomError::NodePanic(panic_message(panic.as_ref()))),
    }
}

fn report(hook: &dyn LifecycleHook, method: &str, node_id: &str, outcome: Result<()>) {
    if let Err(e) = outcome {
        warn!(hook = %hook.name(), method, node_id, error = %e, "Lifecycle hook failed");
    }
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
