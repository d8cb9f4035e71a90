//! Execution streams: one long-lived concurrent worker per entry point.
//!
//! A stream accepts triggers, runs each one as an independent task wrapping
//! a fresh [`GraphExecutor`], and keeps a bounded history of results.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use loom_core::audit::{AuditEvent, AuditEventType, AuditLog, AuditSeverity};
use loom_core::config::{RetryConfig, StreamConfig};
use loom_core::error::{LoomError, Result};
use loom_core::event::{EventBus, RuntimeEvent};
use loom_core::hooks::{panic_message, HookSet};
use loom_core::traits::{EdgeDecider, StateStore};
use loom_core::types::{EntryPointSpec, ExecutionId, ExecutionResult, RunContext};

use crate::graph::{Backoff, ExponentialBackoff, GraphExecutor, GraphSpec, NodeRegistry, DEFAULT_MAX_STEPS};

/// Collaborators and limits shared by the runs of one stream.
#[derive(Clone)]
pub struct StreamOptions {
    pub hooks: HookSet,
    pub event_bus: Arc<EventBus>,
    pub decider: Option<Arc<dyn EdgeDecider>>,
    pub backoff: Arc<dyn Backoff>,
    pub retention: StreamConfig,
    pub max_steps: usize,
    /// Grace period for in-flight runs on stop before they are aborted.
    pub stop_timeout: Duration,
    /// Completed results are also written here as `<entry_point>/<execution_id>`.
    pub store: Option<Arc<dyn StateStore>>,
    pub audit: Option<Arc<AuditLog>>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            hooks: HookSet::default(),
            event_bus: Arc::new(EventBus::default()),
            decider: None,
            backoff: Arc::new(ExponentialBackoff::new(RetryConfig::default())),
            retention: StreamConfig::default(),
            max_steps: DEFAULT_MAX_STEPS,
            stop_timeout: Duration::from_secs(10),
            store: None,
            audit: None,
        }
    }
}

/// Outcome of [`ExecutionStream::wait_for_completion`].
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Completed(ExecutionResult),
    TimedOut,
    /// Unknown id, evicted result, or a run aborted before it produced one.
    NotFound,
}

struct StoredResult {
    result: ExecutionResult,
    completed_at: Instant,
}

struct StreamState {
    results: HashMap<ExecutionId, StoredResult>,
    /// Completion order, oldest first.
    order: VecDeque<ExecutionId>,
    pending: HashMap<ExecutionId, watch::Receiver<Option<ExecutionResult>>>,
    tasks: HashMap<ExecutionId, JoinHandle<()>>,
    cancel: CancellationToken,
    last_activity: Instant,
}

/// Point-in-time view of a stream.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamSnapshot {
    pub entry_point: String,
    pub running: bool,
    pub active_executions: usize,
    pub retained_results: usize,
    pub idle_secs: u64,
}

pub struct ExecutionStream {
    entry_point: EntryPointSpec,
    graph: Arc<GraphSpec>,
    registry: NodeRegistry,
    options: StreamOptions,
    running: AtomicBool,
    state: Mutex<StreamState>,
}

impl ExecutionStream {
    pub fn new(
        entry_point: EntryPointSpec,
        graph: Arc<GraphSpec>,
        registry: NodeRegistry,
        options: StreamOptions,
    ) -> Self {
        Self {
            entry_point,
            graph,
            registry,
            options,
            running: AtomicBool::new(false),
            state: Mutex::new(StreamState {
                results: HashMap::new(),
                order: VecDeque::new(),
                pending: HashMap::new(),
                tasks: HashMap::new(),
                cancel: CancellationToken::new(),
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn entry_point(&self) -> &EntryPointSpec {
        &self.entry_point
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ttl(&self) -> Option<Duration> {
        self.options
            .retention
            .result_ttl_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Start accepting triggers. Starting a running stream is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state();
        state.cancel = CancellationToken::new();
        state.last_activity = Instant::now();
        info!(entry_point = %self.entry_point.id, "Execution stream started");
    }

    /// Stop accepting triggers and cancel in-flight runs.
    ///
    /// Runs get `stop_timeout` to wind down; whatever is still alive after
    /// that is aborted. Stopping a stopped stream is a no-op.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.state();
            state.cancel.cancel();
            state.tasks.drain().map(|(_, h)| h).collect()
        };
        let aborts: Vec<AbortHandle> = handles.iter().map(JoinHandle::abort_handle).collect();
        let in_flight = handles.len();

        if tokio::time::timeout(self.options.stop_timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                entry_point = %self.entry_point.id,
                in_flight,
                "Runs did not stop in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        // Aborted runs never complete; their waiters see NotFound.
        self.state().pending.clear();
        info!(entry_point = %self.entry_point.id, "Execution stream stopped");
        Ok(())
    }

    /// Schedule a run and return its id immediately.
    ///
    /// `session_state` seeds the run context; `input` is layered on top.
    pub fn execute(
        self: &Arc<Self>,
        input: serde_json::Value,
        correlation_id: Option<&str>,
        session_state: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<ExecutionId> {
        if !self.is_running() {
            return Err(LoomError::StreamNotRunning(self.entry_point.id.clone()));
        }

        let mut ctx = RunContext::from_map(session_state.unwrap_or_default());
        ctx.merge(RunContext::from_json(input).data());

        let execution_id = ExecutionId::new();
        let (tx, rx) = watch::channel(None);

        let mut state = self.state();
        state.last_activity = Instant::now();
        state.pending.insert(execution_id.clone(), rx);

        let executor = GraphExecutor::new(self.registry.clone())
            .with_hooks(self.options.hooks.clone())
            .with_event_bus(self.options.event_bus.clone())
            .with_backoff(self.options.backoff.clone())
            .with_execution_id(execution_id.clone())
            .with_max_steps(self.options.max_steps)
            .with_cancel_token(state.cancel.child_token());
        let executor = match &self.options.decider {
            Some(decider) => executor.with_decider(decider.clone()),
            None => executor,
        };

        info!(
            entry_point = %self.entry_point.id,
            execution_id = %execution_id,
            correlation_id = correlation_id.unwrap_or(""),
            "Execution scheduled"
        );
        self.options.event_bus.publish(RuntimeEvent::ExecutionStarted {
            entry_point: self.entry_point.id.clone(),
            execution_id: execution_id.clone(),
        });

        // Spawned under the state lock so `complete` always finds the handle.
        let stream = Arc::clone(self);
        let id = execution_id.clone();
        let handle = tokio::spawn(async move {
            let graph = Arc::clone(&stream.graph);
            let run = executor.execute_from(&graph, &stream.entry_point.entry_node, ctx);
            let result = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(execution_id = %id, error = %message, "Run panicked");
                    ExecutionResult {
                        error: Some(LoomError::NodePanic(message).to_string()),
                        ..Default::default()
                    }
                }
            };
            stream.complete(id, result, tx).await;
        });
        state.tasks.insert(execution_id.clone(), handle);

        Ok(execution_id)
    }

    async fn complete(
        &self,
        execution_id: ExecutionId,
        result: ExecutionResult,
        tx: watch::Sender<Option<ExecutionResult>>,
    ) {
        if let Some(store) = &self.options.store {
            let key = format!("{}/{}", self.entry_point.id, execution_id);
            match serde_json::to_value(&result) {
                Ok(value) => {
                    if let Err(e) = store.put(&key, value).await {
                        warn!(key = %key, error = %e, "Failed to persist execution result");
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "Failed to serialize execution result"),
            }
        }

        let success = result.success;
        {
            let mut state = self.state();
            state.pending.remove(&execution_id);
            state.tasks.remove(&execution_id);
            state.last_activity = Instant::now();

            let max = self.options.retention.max_retained_results;
            if max > 0 {
                state.results.insert(
                    execution_id.clone(),
                    StoredResult {
                        result: result.clone(),
                        completed_at: Instant::now(),
                    },
                );
                state.order.push_back(execution_id.clone());
                while state.results.len() > max {
                    let Some(oldest) = state.order.pop_front() else {
                        break;
                    };
                    state.results.remove(&oldest);
                    debug!(execution_id = %oldest, "Evicted execution result");
                }
            }
            if let Some(ttl) = self.ttl() {
                prune_expired(&mut state, ttl);
            }
        }

        if let Some(audit) = &self.options.audit {
            let severity = if success { AuditSeverity::Info } else { AuditSeverity::Warning };
            audit.record(
                AuditEvent::new(
                    AuditEventType::ExecutionCompleted,
                    severity,
                    if success { "execution succeeded" } else { "execution failed" },
                )
                .with_entry_point(&self.entry_point.id)
                .with_execution(execution_id.as_str())
                .with_metadata(serde_json::json!({
                    "steps": result.steps_executed,
                    "node_path": result.node_path,
                    "error": result.error,
                })),
            );
        }

        self.options.event_bus.publish(RuntimeEvent::ExecutionCompleted {
            entry_point: self.entry_point.id.clone(),
            execution_id: execution_id.clone(),
            success,
        });
        tx.send_replace(Some(result));
        debug!(
            entry_point = %self.entry_point.id,
            execution_id = %execution_id,
            success,
            "Execution completed"
        );
    }

    /// Wait for a run to finish. `None` waits without a deadline.
    pub async fn wait_for_completion(
        &self,
        execution_id: &ExecutionId,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        let mut rx = {
            let state = self.state();
            if let Some(stored) = state.results.get(execution_id) {
                return WaitOutcome::Completed(stored.result.clone());
            }
            match state.pending.get(execution_id) {
                Some(rx) => rx.clone(),
                None => return WaitOutcome::NotFound,
            }
        };

        let wait = async {
            match rx.wait_for(Option::is_some).await {
                Ok(value) => value.clone(),
                Err(_) => None,
            }
        };

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(outcome) => outcome,
                Err(_) => return WaitOutcome::TimedOut,
            },
            None => wait.await,
        };

        match outcome {
            Some(result) => WaitOutcome::Completed(result),
            None => WaitOutcome::NotFound,
        }
    }

    /// A retained result, if it has not been evicted or expired.
    pub fn get_result(&self, execution_id: &ExecutionId) -> Option<ExecutionResult> {
        let ttl = self.ttl();
        let state = self.state();
        let stored = state.results.get(execution_id)?;
        if ttl.is_some_and(|ttl| stored.completed_at.elapsed() > ttl) {
            return None;
        }
        Some(stored.result.clone())
    }

    /// True while the run is scheduled and has not produced a result.
    pub fn is_pending(&self, execution_id: &ExecutionId) -> bool {
        self.state().pending.contains_key(execution_id)
    }

    pub fn active_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn retained_count(&self) -> usize {
        self.state().results.len()
    }

    /// Time since the last trigger or completion; zero while runs are active.
    pub fn idle_for(&self) -> Duration {
        let state = self.state();
        if !state.pending.is_empty() {
            return Duration::ZERO;
        }
        state.last_activity.elapsed()
    }

    /// Drop results older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        match self.ttl() {
            Some(ttl) => prune_expired(&mut self.state(), ttl),
            None => 0,
        }
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let state = self.state();
        let idle = if state.pending.is_empty() {
            state.last_activity.elapsed()
        } else {
            Duration::ZERO
        };
        StreamSnapshot {
            entry_point: self.entry_point.id.clone(),
            running: self.is_running(),
            active_executions: state.pending.len(),
            retained_results: state.results.len(),
            idle_secs: idle.as_secs(),
        }
    }
}

fn prune_expired(state: &mut StreamState, ttl: Duration) -> usize {
    let mut removed = 0;
    while let Some(oldest) = state.order.front() {
        let expired = state
            .results
            .get(oldest)
            .map_or(true, |s| s.completed_at.elapsed() > ttl);
        if !expired {
            break;
        }
        if let Some(id) = state.order.pop_front() {
            if state.results.remove(&id).is_some() {
                removed += 1;
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NoBackoff, NodeSpec};
    use futures::future::BoxFuture;
    use loom_core::traits::NodeBody;
    use loom_core::types::NodeResult;
    use serde_json::json;

    struct Echo;

    impl NodeBody for Echo {
        fn execute<'a>(&'a self, ctx: &'a RunContext) -> BoxFuture<'a, Result<NodeResult>> {
            Box::pin(async move {
                let n = ctx.get("n").cloned().unwrap_or(json!(null));
                Ok(NodeResult::from_json(json!({ "echo": n })))
            })
        }
    }

    struct Slow(Duration);

    impl NodeBody for Slow {
        fn execute<'a>(&'a self, _ctx: &'a RunContext) -> BoxFuture<'a, Result<NodeResult>> {
            Box::pin(async move {
                tokio::time::sleep(self.0).await;
                Ok(NodeResult::from_json(json!({})))
            })
        }
    }

    fn stream_with(body: Arc<dyn NodeBody>, retention: StreamConfig) -> Arc<ExecutionStream> {
        let graph = GraphSpec::new("g", "only").with_node(NodeSpec::new("only", "Only"));
        let options = StreamOptions {
            backoff: Arc::new(NoBackoff),
            retention,
            stop_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let stream = Arc::new(ExecutionStream::new(
            EntryPointSpec::new("main", "Main", "only"),
            Arc::new(graph),
            NodeRegistry::new().with("only", body),
            options,
        ));
        stream.start();
        stream
    }

    #[tokio::test]
    async fn execute_and_wait() {
        let stream = stream_with(Arc::new(Echo), StreamConfig::default());
        let id = stream.execute(json!({"n": 7}), Some("corr-1"), None).unwrap();

        let WaitOutcome::Completed(result) =
            stream.wait_for_completion(&id, Some(Duration::from_secs(5))).await
        else {
            panic!("run did not complete");
        };
        assert!(result.success);
        assert_eq!(result.output.get("echo"), Some(&json!(7)));
        assert_eq!(stream.get_result(&id).unwrap().node_path, vec!["only"]);
        assert_eq!(stream.active_count(), 0);
    }

    #[tokio::test]
    async fn session_state_is_overridden_by_input() {
        let stream = stream_with(Arc::new(Echo), StreamConfig::default());
        let session: HashMap<_, _> = [("n".to_string(), json!(1)), ("keep".to_string(), json!(true))]
            .into_iter()
            .collect();
        let id = stream.execute(json!({"n": 2}), None, Some(session)).unwrap();

        let WaitOutcome::Completed(result) = stream.wait_for_completion(&id, None).await else {
            panic!("run did not complete");
        };
        assert_eq!(result.output.get("echo"), Some(&json!(2)));
        assert_eq!(result.output.get("keep"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn rejects_triggers_when_stopped() {
        let stream = stream_with(Arc::new(Echo), StreamConfig::default());
        stream.stop().await.unwrap();
        stream.stop().await.unwrap();
        assert!(matches!(
            stream.execute(json!({}), None, None),
            Err(LoomError::StreamNotRunning(_))
        ));
    }

    #[tokio::test]
    async fn wait_times_out_while_run_continues() {
        let stream = stream_with(Arc::new(Slow(Duration::from_millis(300))), StreamConfig::default());
        let id = stream.execute(json!({}), None, None).unwrap();

        let outcome = stream.wait_for_completion(&id, Some(Duration::from_millis(20))).await;
        assert!(matches!(outcome, WaitOutcome::TimedOut));
        assert!(stream.is_pending(&id));

        let outcome = stream.wait_for_completion(&id, Some(Duration::from_secs(5))).await;
        assert!(matches!(outcome, WaitOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_runs() {
        let stream = stream_with(Arc::new(Slow(Duration::from_secs(30))), StreamConfig::default());
        let id = stream.execute(json!({}), None, None).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        stream.stop().await.unwrap();

        let result = stream.get_result(&id).expect("cancelled run is recorded");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Execution cancelled"));
    }

    #[tokio::test]
    async fn unknown_execution_is_not_found() {
        let stream = stream_with(Arc::new(Echo), StreamConfig::default());
        let outcome = stream
            .wait_for_completion(&ExecutionId::from_string("nope"), Some(Duration::from_millis(10)))
            .await;
        assert!(matches!(outcome, WaitOutcome::NotFound));
    }

    #[tokio::test]
    async fn zero_retention_keeps_nothing_but_wakes_waiters() {
        let retention = StreamConfig {
            max_retained_results: 0,
            result_ttl_secs: None,
        };
        let stream = stream_with(Arc::new(Slow(Duration::from_millis(20))), retention);
        let id = stream.execute(json!({}), None, None).unwrap();

        let outcome = stream.wait_for_completion(&id, Some(Duration::from_secs(5))).await;
        assert!(matches!(outcome, WaitOutcome::Completed(_)));
        assert_eq!(stream.retained_count(), 0);
    }
}
