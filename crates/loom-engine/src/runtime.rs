//! The runtime: entry points, their execution streams, input screening,
//! audit, and the idle-stream reaper.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use loom_core::audit::{AuditEvent, AuditEventType, AuditLog, AuditSeverity};
use loom_core::config::AppConfig;
use loom_core::error::{LoomError, Result};
use loom_core::event::EventBus;
use loom_core::hooks::HookSet;
use loom_core::security::InputSanitizer;
use loom_core::traits::{EdgeDecider, LifecycleHook, StateStore};
use loom_core::types::{EntryPointSpec, ExecutionId, ExecutionResult, TriggerType};

use crate::graph::{Backoff, ExponentialBackoff, GraphSpec, NodeRegistry};
use crate::store::MemoryStore;
use crate::stream::{ExecutionStream, StreamOptions, StreamSnapshot, WaitOutcome};

/// Outcome of [`Runtime::trigger_and_wait`].
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Completed(ExecutionResult),
    /// The deadline passed; the run keeps going and its result is retained.
    TimedOut { execution_id: ExecutionId },
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryPointStatus {
    pub id: String,
    pub name: String,
    pub entry_node: String,
    pub trigger_type: TriggerType,
    /// `None` when the stream is not live (runtime stopped, or reaped).
    pub stream: Option<StreamSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub running: bool,
    pub graph_id: String,
    pub entry_points: Vec<EntryPointStatus>,
}

struct Reaper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Runtime {
    graph: Arc<GraphSpec>,
    registry: NodeRegistry,
    config: AppConfig,
    hooks: HookSet,
    decider: Option<Arc<dyn EdgeDecider>>,
    backoff: Arc<dyn Backoff>,
    event_bus: Arc<EventBus>,
    store: Arc<dyn StateStore>,
    audit: Arc<AuditLog>,
    sanitizer: InputSanitizer,
    entry_points: Mutex<BTreeMap<String, EntryPointSpec>>,
    /// Live streams. `None` while the runtime is stopped.
    streams: Mutex<Option<HashMap<String, Arc<ExecutionStream>>>>,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<Option<Reaper>>,
}

impl Runtime {
    /// Build a runtime over a validated graph.
    pub fn new(graph: GraphSpec, registry: NodeRegistry, config: AppConfig) -> Result<Self> {
        graph.validate()?;
        for warning in graph.expression_warnings() {
            warn!(graph = %graph.id, "Condition will never match: {}", warning);
        }

        let audit = AuditLog::new(&config.audit, config.audit_path());
        Ok(Self {
            graph: Arc::new(graph),
            registry,
            hooks: HookSet::default(),
            decider: None,
            backoff: Arc::new(ExponentialBackoff::new(config.retry.clone())),
            event_bus: Arc::new(EventBus::default()),
            store: Arc::new(MemoryStore::new()),
            audit: Arc::new(audit),
            sanitizer: InputSanitizer::new(config.security.clone()),
            entry_points: Mutex::new(BTreeMap::new()),
            streams: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(None),
            config,
        })
    }

    pub fn with_hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.hooks.push(hook);
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

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Arc::new(audit);
        self
    }

    pub fn graph(&self) -> &GraphSpec {
        &self.graph
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn is_running(&self) -> bool {
        self.streams().is_some()
    }

    fn streams(&self) -> MutexGuard<'_, Option<HashMap<String, Arc<ExecutionStream>>>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry_points(&self) -> MutexGuard<'_, BTreeMap<String, EntryPointSpec>> {
        self.entry_points.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registered entry points, ordered by id.
    pub fn list_entry_points(&self) -> Vec<EntryPointSpec> {
        self.entry_points().values().cloned().collect()
    }

    pub fn register_entry_point(&self, spec: EntryPointSpec) -> Result<()> {
        if !self.graph.has_node(&spec.entry_node) {
            return Err(LoomError::NodeNotFound(spec.entry_node));
        }

        // Held until the insert so a concurrent `start` sees all or nothing.
        let live = self.streams();
        if live.is_some() {
            return Err(LoomError::RuntimeRunning);
        }
        let mut entry_points = self.entry_points();
        if entry_points.contains_key(&spec.id) {
            return Err(LoomError::EntryPointExists(spec.id));
        }
        self.audit.record(
            AuditEvent::new(
                AuditEventType::EntryPointRegistered,
                AuditSeverity::Info,
                format!("entry point '{}' -> node '{}'", spec.id, spec.entry_node),
            )
            .with_entry_point(&spec.id),
        );
        info!(entry_point = %spec.id, entry_node = %spec.entry_node, "Entry point registered");
        entry_points.insert(spec.id.clone(), spec);
        Ok(())
    }

    pub fn unregister_entry_point(&self, entry_point_id: &str) -> Result<()> {
        {
            let streams = self.streams();
            if streams.is_some() {
                return Err(LoomError::RuntimeRunning);
            }
            if self.entry_points().remove(entry_point_id).is_none() {
                return Err(LoomError::EntryPointNotFound(entry_point_id.to_string()));
            }
        }
        self.audit.record(
            AuditEvent::new(
                AuditEventType::EntryPointUnregistered,
                AuditSeverity::Info,
                format!("entry point '{}' removed", entry_point_id),
            )
            .with_entry_point(entry_point_id),
        );
        Ok(())
    }

    fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            hooks: self.hooks.clone(),
            event_bus: self.event_bus.clone(),
            decider: self.decider.clone(),
            backoff: self.backoff.clone(),
            retention: self.config.stream.clone(),
            max_steps: self.config.runtime.max_steps,
            stop_timeout: Duration::from_secs(self.config.runtime.stop_timeout_secs),
            store: Some(self.store.clone()),
            audit: Some(self.audit.clone()),
        }
    }

    fn spawn_stream(&self, spec: &EntryPointSpec) -> Arc<ExecutionStream> {
        let stream = Arc::new(ExecutionStream::new(
            spec.clone(),
            self.graph.clone(),
            self.registry.clone(),
            self.stream_options(),
        ));
        stream.start();
        stream
    }

    /// Create one stream per entry point and start the idle reaper. The
    /// store is reopened first.
    /// Starting a running runtime is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }
        self.store.open().await?;

        // Registration checks `streams` under the same lock, so the list
        // cannot change between reading it and going live.
        let count = {
            let mut guard = self.streams();
            let specs = self.list_entry_points();
            let streams: HashMap<String, Arc<ExecutionStream>> = specs
                .iter()
                .map(|spec| (spec.id.clone(), self.spawn_stream(spec)))
                .collect();
            *guard = Some(streams);
            specs.len()
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reaper_loop(
            Arc::downgrade(self),
            Duration::from_secs(self.config.runtime.reaper_interval_secs.max(1)),
            cancel.clone(),
        ));
        *lifecycle = Some(Reaper { cancel, handle });

        self.audit.record(
            AuditEvent::new(
                AuditEventType::RuntimeStarted,
                AuditSeverity::Info,
                format!("runtime started with {} entry point(s)", count),
            )
            .with_metadata(serde_json::json!({ "graph": self.graph.id })),
        );
        info!(graph = %self.graph.id, entry_points = count, "Runtime started");
        Ok(())
    }

    /// Stop the reaper, then every stream concurrently, then close the store.
    ///
    /// A stream that fails to stop is logged and does not hold up the others.
    /// Stopping a stopped runtime is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;

        if let Some(reaper) = lifecycle.take() {
            reaper.cancel.cancel();
            if let Err(e) = reaper.handle.await {
                warn!(error = %e, "Reaper task ended abnormally");
            }
        }

        let Some(streams) = self.streams().take() else {
            return Ok(());
        };

        let stopping = streams.into_values().map(|stream| async move {
            let id = stream.entry_point().id.clone();
            (id, stream.stop().await)
        });
        for (entry_point, outcome) in futures::future::join_all(stopping).await {
            if let Err(e) = outcome {
                error!(entry_point = %entry_point, error = %e, "Stream failed to stop");
            }
        }

        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close state store");
        }

        self.audit.record(AuditEvent::new(
            AuditEventType::RuntimeStopped,
            AuditSeverity::Info,
            "runtime stopped",
        ));
        info!(graph = %self.graph.id, "Runtime stopped");
        Ok(())
    }

    /// Reject oversized or dangerous input before any stream sees it.
    fn screen(&self, entry_point_id: &str, input: &serde_json::Value) -> Result<()> {
        if let Err((size, max)) = self.sanitizer.check_size(input) {
            self.audit.record(
                AuditEvent::new(
                    AuditEventType::LimitExceeded,
                    AuditSeverity::Warning,
                    format!("payload of {} bytes exceeds {}", size, max),
                )
                .with_entry_point(entry_point_id),
            );
            return Err(LoomError::PayloadTooLarge { size, max });
        }

        for violation in self.sanitizer.inspect(input) {
            let metadata = serde_json::json!({
                "path": violation.path,
                "label": violation.label,
                "severity": violation.severity,
            });
            if self.sanitizer.is_blocking(&violation) {
                self.audit.record(
                    AuditEvent::new(
                        AuditEventType::SecurityViolation,
                        AuditSeverity::Critical,
                        format!("trigger blocked: {}", violation.label),
                    )
                    .with_entry_point(entry_point_id)
                    .with_metadata(metadata),
                );
                return Err(LoomError::SecurityViolation {
                    label: violation.label,
                    severity: violation.severity,
                });
            }
            self.audit.record(
                AuditEvent::new(
                    AuditEventType::SecurityViolation,
                    AuditSeverity::Warning,
                    format!("suspicious input allowed: {}", violation.label),
                )
                .with_entry_point(entry_point_id)
                .with_metadata(metadata),
            );
        }
        Ok(())
    }

    fn dispatch(
        &self,
        entry_point_id: &str,
        input: serde_json::Value,
        correlation_id: Option<&str>,
        session_state: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<(Arc<ExecutionStream>, ExecutionId)> {
        if !self.is_running() {
            return Err(LoomError::RuntimeNotRunning);
        }
        let spec = self
            .entry_points()
            .get(entry_point_id)
            .cloned()
            .ok_or_else(|| LoomError::EntryPointNotFound(entry_point_id.to_string()))?;

        self.screen(entry_point_id, &input)?;

        // Held across `execute` so the reaper cannot retire the stream in between.
        let mut guard = self.streams();
        let streams = guard.as_mut().ok_or(LoomError::RuntimeNotRunning)?;
        let stream = match streams.get(entry_point_id) {
            Some(stream) => stream.clone(),
            None => {
                debug!(entry_point = %entry_point_id, "Re-creating reaped stream");
                let stream = self.spawn_stream(&spec);
                streams.insert(spec.id.clone(), stream.clone());
                stream
            }
        };
        let execution_id = stream.execute(input, correlation_id, session_state)?;
        drop(guard);

        self.audit.record(
            AuditEvent::new(AuditEventType::TriggerAccepted, AuditSeverity::Info, "trigger accepted")
                .with_entry_point(entry_point_id)
                .with_execution(execution_id.as_str()),
        );
        Ok((stream, execution_id))
    }

    /// Screen the input and schedule a run. Returns as soon as the run is queued.
    pub fn trigger(
        &self,
        entry_point_id: &str,
        input: serde_json::Value,
        correlation_id: Option<&str>,
    ) -> Result<ExecutionId> {
        self.dispatch(entry_point_id, input, correlation_id, None)
            .map(|(_, id)| id)
    }

    /// Like [`trigger`](Self::trigger), seeding the run context with prior session state.
    pub fn trigger_with_state(
        &self,
        entry_point_id: &str,
        input: serde_json::Value,
        correlation_id: Option<&str>,
        session_state: HashMap<String, serde_json::Value>,
    ) -> Result<ExecutionId> {
        self.dispatch(entry_point_id, input, correlation_id, Some(session_state))
            .map(|(_, id)| id)
    }

    /// Trigger and wait for the result, up to `timeout` or the configured default.
    ///
    /// A timeout does not cancel the run.
    pub async fn trigger_and_wait(
        &self,
        entry_point_id: &str,
        input: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<TriggerOutcome> {
        let (stream, execution_id) = self.dispatch(entry_point_id, input, None, None)?;
        let limit =
            timeout.unwrap_or_else(|| Duration::from_secs(self.config.runtime.default_timeout_secs));

        match stream.wait_for_completion(&execution_id, Some(limit)).await {
            WaitOutcome::Completed(result) => Ok(TriggerOutcome::Completed(result)),
            WaitOutcome::TimedOut => {
                self.audit.record(
                    AuditEvent::new(
                        AuditEventType::ExecutionTimedOut,
                        AuditSeverity::Warning,
                        format!("no result within {}ms", limit.as_millis()),
                    )
                    .with_entry_point(entry_point_id)
                    .with_execution(execution_id.as_str()),
                );
                Ok(TriggerOutcome::TimedOut { execution_id })
            }
            WaitOutcome::NotFound => Err(LoomError::ExecutionNotFound(execution_id.to_string())),
        }
    }

    /// A finished run's result: from the live stream, else from the state store.
    pub async fn get_result(
        &self,
        entry_point_id: &str,
        execution_id: &ExecutionId,
    ) -> Option<ExecutionResult> {
        let stream = self
            .streams()
            .as_ref()
            .and_then(|streams| streams.get(entry_point_id).cloned());
        if let Some(result) = stream.and_then(|s| s.get_result(execution_id)) {
            return Some(result);
        }

        let key = format!("{}/{}", entry_point_id, execution_id);
        match self.store.get(&key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(key = %key, error = %e, "Stored result is malformed");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read stored result");
                None
            }
        }
    }

    pub fn status(&self) -> RuntimeStatus {
        let specs = self.list_entry_points();
        let guard = self.streams();
        let entry_points = specs
            .into_iter()
            .map(|spec| EntryPointStatus {
                stream: guard
                    .as_ref()
                    .and_then(|streams| streams.get(&spec.id))
                    .map(|s| s.snapshot()),
                id: spec.id,
                name: spec.name,
                entry_node: spec.entry_node,
                trigger_type: spec.trigger_type,
            })
            .collect();
        RuntimeStatus {
            running: guard.is_some(),
            graph_id: self.graph.id.clone(),
            entry_points,
        }
    }

    /// One reaper pass: purge expired results, then stop and drop streams
    /// idle past `idle_timeout_secs` with no active runs. Returns how many
    /// streams were retired.
    pub async fn reap_idle_streams(&self) -> usize {
        let idle_timeout = Duration::from_secs(self.config.runtime.idle_timeout_secs);

        let retired: Vec<Arc<ExecutionStream>> = {
            let mut guard = self.streams();
            let Some(streams) = guard.as_mut() else {
                return 0;
            };
            for stream in streams.values() {
                let purged = stream.purge_expired();
                if purged > 0 {
                    debug!(entry_point = %stream.entry_point().id, purged, "Purged expired results");
                }
            }
            let idle: Vec<String> = streams
                .iter()
                .filter(|(_, s)| s.active_count() == 0 && s.idle_for() >= idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            idle.iter().filter_map(|id| streams.remove(id)).collect()
        };

        for stream in &retired {
            info!(entry_point = %stream.entry_point().id, "Reaping idle stream");
            if let Err(e) = stream.stop().await {
                warn!(entry_point = %stream.entry_point().id, error = %e, "Idle stream failed to stop");
            }
        }
        retired.len()
    }
}

async fn reaper_loop(runtime: Weak<Runtime>, interval: Duration, cancel: CancellationToken) {
    debug!(interval_secs = interval.as_secs(), "Idle reaper started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => {
                debug!("Idle reaper stopped");
                return;
            }
        }
        let Some(runtime) = runtime.upgrade() else {
            return;
        };
        runtime.reap_idle_streams().await;
    }
}
