//! Node bodies and hooks for exercising graphs in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use loom_core::error::{LoomError, Result};
use loom_core::hooks::{NodeEndEvent, NodeErrorEvent, NodeStartEvent};
use loom_core::traits::{LifecycleHook, NodeBody};
use loom_core::types::{NodeResult, RunContext};

/// One scripted attempt.
#[derive(Debug, Clone)]
pub enum Step {
    /// Succeed with this JSON object as output.
    Succeed(serde_json::Value),
    /// Return a declared failure.
    Fail(String),
    /// Return an `Err`, as a buggy body would.
    Raise(String),
}

/// Plays back a fixed sequence of outcomes, one per call.
/// Once the script runs out the last step repeats.
pub struct ScriptedNode {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Step>,
    calls: AtomicUsize,
}

impl ScriptedNode {
    pub fn new(steps: Vec<Step>) -> Self {
        let last = steps
            .last()
            .cloned()
            .unwrap_or(Step::Succeed(serde_json::json!({})));
        Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(last),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always succeeds with `output`.
    pub fn succeeding(output: serde_json::Value) -> Self {
        Self::new(vec![Step::Succeed(output)])
    }

    /// Always fails with `error`.
    pub fn failing(error: &str) -> Self {
        Self::new(vec![Step::Fail(error.to_string())])
    }

    /// Fails `times` times, then succeeds with `output`.
    pub fn flaky(times: usize, output: serde_json::Value) -> Self {
        let mut steps: Vec<Step> = (0..times)
            .map(|i| Step::Fail(format!("transient failure {}", i + 1)))
            .collect();
        steps.push(Step::Succeed(output));
        Self::new(steps)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().unwrap();
        match steps.pop_front() {
            Some(step) => {
                *self.last.lock().unwrap() = step.clone();
                step
            }
            None => self.last.lock().unwrap().clone(),
        }
    }
}

impl NodeBody for ScriptedNode {
    fn execute<'a>(&'a self, _ctx: &'a RunContext) -> BoxFuture<'a, Result<NodeResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();
        Box::pin(async move {
            match step {
                Step::Succeed(output) => Ok(NodeResult::from_json(output)),
                Step::Fail(error) => Ok(NodeResult::failure(error)),
                Step::Raise(message) => Err(LoomError::NodeExecution {
                    node: "scripted".to_string(),
                    message,
                }),
            }
        })
    }
}

/// Sleeps, then succeeds with a fixed output.
pub struct SleepyNode {
    delay: Duration,
    output: serde_json::Value,
}

impl SleepyNode {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            output: serde_json::json!({ "slept": true }),
        }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = output;
        self
    }
}

impl NodeBody for SleepyNode {
    fn execute<'a>(&'a self, _ctx: &'a RunContext) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(NodeResult::from_json(self.output.clone()))
        })
    }
}

/// Panics on every call.
pub struct PanickingNode(pub &'static str);

impl NodeBody for PanickingNode {
    fn execute<'a>(&'a self, _ctx: &'a RunContext) -> BoxFuture<'a, Result<NodeResult>> {
        panic!("{}", self.0)
    }
}

/// Records lifecycle callbacks as `"start:<node>"`, `"end:<node>"`, `"error:<node>"`.
#[derive(Default)]
pub struct RecordingHook {
    events: Mutex<Vec<String>>,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// The callbacks for one node, without the node suffix.
    pub fn events_for(&self, node_id: &str) -> Vec<String> {
        let suffix = format!(":{}", node_id);
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_suffix(&suffix).map(str::to_string))
            .collect()
    }

    fn push(&self, kind: &str, node_id: &str) {
        self.events.lock().unwrap().push(format!("{}:{}", kind, node_id));
    }
}

impl LifecycleHook for RecordingHook {
    fn name(&self) -> &str {
        "recording"
    }

    fn on_node_start<'a>(&'a self, event: &'a NodeStartEvent) -> BoxFuture<'a, Result<()>> {
        self.push("start", &event.node_id);
        Box::pin(async { Ok(()) })
    }

    fn on_node_end<'a>(&'a self, event: &'a NodeEndEvent) -> BoxFuture<'a, Result<()>> {
        self.push("end", &event.node_id);
        Box::pin(async { Ok(()) })
    }

    fn on_node_error<'a>(&'a self, event: &'a NodeErrorEvent) -> BoxFuture<'a, Result<()>> {
        self.push("error", &event.node_id);
        Box::pin(async { Ok(()) })
    }
}

/// A hook that misbehaves on every callback.
pub struct FailingHook {
    panics: bool,
}

impl FailingHook {
    /// Returns `Err` from every callback.
    pub fn erroring() -> Self {
        Self { panics: false }
    }

    /// Panics in every callback.
    pub fn panicking() -> Self {
        Self { panics: true }
    }

    fn misbehave(&self, callback: &'static str) -> BoxFuture<'static, Result<()>> {
        let panics = self.panics;
        Box::pin(async move {
            if panics {
                panic!("hook exploded in {}", callback);
            }
            Err(LoomError::Storage(format!("hook broke in {}", callback)))
        })
    }
}

impl LifecycleHook for FailingHook {
    fn name(&self) -> &str {
        "failing"
    }

    fn on_node_start<'a>(&'a self, _event: &'a NodeStartEvent) -> BoxFuture<'a, Result<()>> {
        self.misbehave("on_node_start")
    }

    fn on_node_end<'a>(&'a self, _event: &'a NodeEndEvent) -> BoxFuture<'a, Result<()>> {
        self.misbehave("on_node_end")
    }

    fn on_node_error<'a>(&'a self, _event: &'a NodeErrorEvent) -> BoxFuture<'a, Result<()>> {
        self.misbehave("on_node_error")
    }
}
