use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use loom_core::config::RetryConfig;
use loom_core::error::LoomError;
use loom_core::event::EventBus;
use loom_core::hooks::{panic_message, HookSet, NodeEndEvent, NodeErrorEvent, NodeStartEvent};
use loom_core::traits::{EdgeDecider, LifecycleHook};
use loom_core::types::{ExecutionId, ExecutionResult, NodeResult, RunContext};

use super::backoff::{Backoff, ExponentialBackoff};
use super::edge::{condition_vars, evaluate_condition, EdgeCondition, EdgeSpec};
use super::node::{NodeRegistry, NodeSpec};
use super::spec::GraphSpec;

/// Step ceiling when neither the graph nor the caller sets one.
pub const DEFAULT_MAX_STEPS: usize = 100;

/// The run was cancelled while a node was in flight.
struct Cancelled;

/// Drives one run through a graph.
///
/// Starting from the entry node it executes each node (retrying per the
/// node's `max_retries`), merges successful output into the run context,
/// then follows the first outgoing edge whose condition holds. The run ends
/// at a terminal or pause node, or when no edge matches.
///
/// One executor performs one run: `execute` consumes it.
pub struct GraphExecutor {
    registry: NodeRegistry,
    hooks: HookSet,
    event_bus: Option<Arc<EventBus>>,
    decider: Option<Arc<dyn EdgeDecider>>,
    backoff: Arc<dyn Backoff>,
    execution_id: ExecutionId,
    max_steps: Option<usize>,
    cancel: CancellationToken,
}

impl GraphExecutor {
    pub fn new(registry: NodeRegistry) -> Self {
        Self {
            registry,
            hooks: HookSet::default(),
            event_bus: None,
            decider: None,
            backoff: Arc::new(ExponentialBackoff::new(RetryConfig::default())),
            execution_id: ExecutionId::new(),
            max_steps: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_decider(mut self, decider: Arc<dyn EdgeDecider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_execution_id(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = execution_id;
        self
    }

    /// Used when the graph does not declare its own `max_steps`.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Run the graph from its entry node.
    pub async fn execute(self, graph: &GraphSpec, ctx: RunContext) -> ExecutionResult {
        let entry = graph.entry_node.clone();
        self.execute_from(graph, &entry, ctx).await
    }

    /// Run the graph from `start_node` (an entry point's node).
    pub async fn execute_from(
        self,
        graph: &GraphSpec,
        start_node: &str,
        mut ctx: RunContext,
    ) -> ExecutionResult {
        let started = Instant::now();
        let max_steps = graph
            .max_steps
            .or(self.max_steps)
            .unwrap_or(DEFAULT_MAX_STEPS);
        let mut run = RunTally::default();
        let mut current = start_node.to_string();

        info!(
            execution_id = %self.execution_id,
            graph_id = %graph.id,
            entry_node = %current,
            "Starting graph run"
        );

        let mut result = loop {
            if self.cancel.is_cancelled() {
                break run.fail(LoomError::Cancelled.to_string());
            }
            if run.steps >= max_steps {
                warn!(
                    execution_id = %self.execution_id,
                    node_id = %current,
                    max_steps,
                    "Step ceiling reached, terminating run"
                );
                break run.fail("max steps exceeded");
            }

            let Some(node) = graph.node(&current) else {
                error!(execution_id = %self.execution_id, node_id = %current, "Node not found in graph");
                break run.fail(LoomError::NodeNotFound(current.clone()).to_string());
            };

            run.steps += 1;
            run.path.push(node.id.clone());

            let node_result = match self.run_node(node, &ctx).await {
                Ok(r) => r,
                Err(Cancelled) => break run.fail(LoomError::Cancelled.to_string()),
            };
            run.tokens += node_result.tokens_used;
            run.latency += node_result.latency_ms;

            if node_result.success {
                ctx.merge(&node_result.output);
            }

            if graph.is_terminal(&node.id) || graph.is_pause(&node.id) {
                if graph.is_pause(&node.id) {
                    debug!(execution_id = %self.execution_id, node_id = %node.id, "Paused at node");
                    run.paused_at = Some(node.id.clone());
                }
                break run.finish(node_result);
            }

            match self.select_edge(graph, node, &node_result, &ctx).await {
                Some(edge) => {
                    debug!(
                        execution_id = %self.execution_id,
                        edge_id = %edge.id,
                        from = %edge.source,
                        to = %edge.target,
                        "Traversing edge"
                    );
                    if let Some(bus) = &self.event_bus {
                        bus.emit_edge_traversed(
                            &self.execution_id,
                            &edge.id,
                            &edge.source,
                            &edge.target,
                            edge.condition.as_str(),
                        );
                    }
                    current = edge.target.clone();
                }
                None => {
                    debug!(
                        execution_id = %self.execution_id,
                        node_id = %node.id,
                        "No edge conditions matched, run complete"
                    );
                    break run.finish(node_result);
                }
            }
        };

        result.output = ctx.into_inner();
        info!(
            execution_id = %self.execution_id,
            success = result.success,
            steps = result.steps_executed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Graph run finished"
        );
        result
    }

    /// Execute one node with retries, firing hook and bus events.
    async fn run_node(&self, node: &NodeSpec, ctx: &RunContext) -> Result<NodeResult, Cancelled> {
        let Some(body) = self.registry.get(&node.id) else {
            let err = LoomError::NoImplementation(node.id.clone());
            error!(execution_id = %self.execution_id, node_id = %node.id, "No implementation registered");
            return Ok(self.fail_without_start(node, err.to_string(), Some(Arc::new(err))).await);
        };

        let problems = body.validate_input(&node.input_keys, ctx);
        if !problems.is_empty() {
            let message = format!("input validation failed: {}", problems.join("; "));
            warn!(execution_id = %self.execution_id, node_id = %node.id, error = %message, "Node input rejected");
            return Ok(self.fail_without_start(node, message, None).await);
        }

        info!(
            execution_id = %self.execution_id,
            node_id = %node.id,
            node_name = %node.name,
            "Executing graph node"
        );

        let mut attempt: u32 = 0;
        loop {
            self.hooks
                .node_started(&NodeStartEvent {
                    execution_id: self.execution_id.clone(),
                    node_id: node.id.clone(),
                    node_name: node.name.clone(),
                    node_type: node.node_type.to_string(),
                    attempt,
                })
                .await;
            if let Some(bus) = &self.event_bus {
                bus.emit_node_started(&self.execution_id, &node.id, node.node_type.as_str(), attempt);
            }

            let attempt_start = Instant::now();
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Cancelled),
                outcome = AssertUnwindSafe(async { body.execute(ctx).await }).catch_unwind() => outcome,
            };
            let elapsed_ms = attempt_start.elapsed().as_millis() as u64;

            let (mut result, exception) = match outcome {
                Ok(Ok(result)) => (result, None),
                Ok(Err(e)) => (NodeResult::failure(e.to_string()), Some(Arc::new(e))),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    let err = LoomError::NodePanic(message);
                    (NodeResult::failure(err.to_string()), Some(Arc::new(err)))
                }
            };
            if result.latency_ms == 0 {
                result.latency_ms = elapsed_ms;
            }
            if !result.success && result.error.is_none() {
                result.error = Some("node reported failure".to_string());
            }

            if result.success {
                debug!(
                    execution_id = %self.execution_id,
                    node_id = %node.id,
                    tokens = result.tokens_used,
                    latency_ms = result.latency_ms,
                    "Node execution complete"
                );
                self.hooks
                    .node_ended(&NodeEndEvent {
                        execution_id: self.execution_id.clone(),
                        node_id: node.id.clone(),
                        node_name: node.name.clone(),
                        node_type: node.node_type.to_string(),
                        tokens_used: result.tokens_used,
                        latency_ms: result.latency_ms,
                    })
                    .await;
                if let Some(bus) = &self.event_bus {
                    bus.emit_node_completed(
                        &self.execution_id,
                        &node.id,
                        result.tokens_used,
                        result.latency_ms,
                    );
                }
                return Ok(result);
            }

            let error = result.error.clone().unwrap_or_default();
            self.hooks
                .node_failed(&NodeErrorEvent {
                    execution_id: self.execution_id.clone(),
                    node_id: node.id.clone(),
                    node_name: node.name.clone(),
                    node_type: node.node_type.to_string(),
                    error: error.clone(),
                    exception,
                })
                .await;

            // `attempt` counts retries so far; attempts made is one more.
            if attempt + 1 < node.max_retries {
                attempt += 1;
                warn!(
                    execution_id = %self.execution_id,
                    node_id = %node.id,
                    attempt,
                    max_retries = node.max_retries,
                    error = %error,
                    "Node failed, retrying"
                );
                if let Some(bus) = &self.event_bus {
                    bus.emit_node_retry(&self.execution_id, &node.id, attempt, node.max_retries, &error);
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(Cancelled),
                    _ = self.backoff.wait(attempt) => {}
                }
                continue;
            }

            error!(
                execution_id = %self.execution_id,
                node_id = %node.id,
                attempts = attempt + 1,
                error = %error,
                "Graph node failed"
            );
            if let Some(bus) = &self.event_bus {
                bus.emit_node_error(&self.execution_id, &node.id, &error, attempt + 1);
            }
            return Ok(result);
        }
    }

    /// Failure before any attempt started: only an error event fires.
    async fn fail_without_start(
        &self,
        node: &NodeSpec,
        message: String,
        exception: Option<Arc<LoomError>>,
    ) -> NodeResult {
        self.hooks
            .node_failed(&NodeErrorEvent {
                execution_id: self.execution_id.clone(),
                node_id: node.id.clone(),
                node_name: node.name.clone(),
                node_type: node.node_type.to_string(),
                error: message.clone(),
                exception,
            })
            .await;
        if let Some(bus) = &self.event_bus {
            bus.emit_node_error(&self.execution_id, &node.id, &message, 0);
        }
        NodeResult::failure(message)
    }

    /// First outgoing edge, in declaration order, whose condition holds.
    async fn select_edge<'g>(
        &self,
        graph: &'g GraphSpec,
        node: &'g NodeSpec,
        result: &NodeResult,
        ctx: &RunContext,
    ) -> Option<&'g EdgeSpec> {
        let mut vars = None;
        for edge in graph.outgoing(&node.id) {
            let matched = match edge.condition {
                EdgeCondition::Always => true,
                EdgeCondition::OnSuccess => result.success,
                EdgeCondition::OnFailure => !result.success,
                EdgeCondition::Conditional => {
                    let vars = vars.get_or_insert_with(|| condition_vars(ctx, &result.output));
                    self.check_expression(edge, vars)
                }
                EdgeCondition::LlmDecide => self.llm_decide(edge, result, ctx, &mut vars).await,
            };
            if matched {
                return Some(edge);
            }
        }
        None
    }

    /// A guard that errors counts as not satisfied.
    fn check_expression(
        &self,
        edge: &EdgeSpec,
        vars: &std::collections::HashMap<String, serde_json::Value>,
    ) -> bool {
        let Some(expr) = edge.condition_expr.as_deref() else {
            warn!(edge_id = %edge.id, "Conditional edge has no expression, skipping");
            return false;
        };
        match evaluate_condition(expr, vars) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    execution_id = %self.execution_id,
                    edge_id = %edge.id,
                    expr,
                    kind = ?e.kind(),
                    error = %e,
                    "Edge condition failed to evaluate, treating as not satisfied"
                );
                false
            }
        }
    }

    async fn llm_decide(
        &self,
        edge: &EdgeSpec,
        result: &NodeResult,
        ctx: &RunContext,
        vars: &mut Option<std::collections::HashMap<String, serde_json::Value>>,
    ) -> bool {
        if let Some(decider) = &self.decider {
            match decider
                .decide(&edge.id, &edge.source, &edge.target, &result.output, ctx)
                .await
            {
                Ok(decision) => return decision,
                Err(e) => {
                    warn!(edge_id = %edge.id, error = %e, "Edge decider failed, using fallback");
                }
            }
        } else {
            debug!(edge_id = %edge.id, "No edge decider configured, using fallback");
        }

        if edge.condition_expr.is_some() {
            let vars = vars.get_or_insert_with(|| condition_vars(ctx, &result.output));
            self.check_expression(edge, vars)
        } else {
            result.success
        }
    }
}

/// Bookkeeping for one run.
#[derive(Default)]
struct RunTally {
    path: Vec<String>,
    steps: usize,
    tokens: u64,
    latency: u64,
    paused_at: Option<String>,
}

impl RunTally {
    fn finish(&mut self, last: NodeResult) -> ExecutionResult {
        ExecutionResult {
            success: last.success,
            output: Default::default(),
            error: last.error,
            node_path: std::mem::take(&mut self.path),
            steps_executed: self.steps,
            total_tokens: self.tokens,
            total_latency_ms: self.latency,
            paused_at: self.paused_at.take(),
        }
    }

    fn fail(&mut self, error: impl Into<String>) -> ExecutionResult {
        self.finish(NodeResult::failure(error))
    }
}
