use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use loom_core::config::{AppConfig, StreamConfig};
use loom_core::event::RuntimeEvent;
use loom_core::types::{EntryPointSpec, ExecutionId};
use loom_engine::graph::{EdgeSpec, GraphSpec, NoBackoff, NodeRegistry, NodeSpec};
use loom_engine::runtime::{Runtime, TriggerOutcome};
use loom_engine::stream::{ExecutionStream, StreamOptions, WaitOutcome};
use loom_test_utils::{RecordingHook, ScriptedNode, SleepyNode};

fn single_node_graph() -> GraphSpec {
    GraphSpec::new("single", "work")
        .with_node(NodeSpec::new("work", "Work"))
        .with_terminal("work")
}

#[tokio::test]
async fn stream_evicts_oldest_results_past_capacity() {
    let registry = NodeRegistry::new().with("work", Arc::new(ScriptedNode::succeeding(json!({"n": 1}))));
    let stream = Arc::new(ExecutionStream::new(
        EntryPointSpec::new("main", "Main", "work"),
        Arc::new(single_node_graph()),
        registry,
        StreamOptions {
            retention: StreamConfig {
                max_retained_results: 2,
                result_ttl_secs: None,
            },
            backoff: Arc::new(NoBackoff),
            ..Default::default()
        },
    ));
    stream.start();

    let mut ids: Vec<ExecutionId> = Vec::new();
    for i in 0..3 {
        let id = stream.execute(json!({ "i": i }), None, None).unwrap();
        let outcome = stream.wait_for_completion(&id, Some(Duration::from_secs(5))).await;
        assert!(matches!(outcome, WaitOutcome::Completed(_)));
        ids.push(id);
    }

    assert!(stream.get_result(&ids[0]).is_none());
    assert!(stream.get_result(&ids[1]).is_some());
    assert!(stream.get_result(&ids[2]).is_some());
    assert_eq!(stream.retained_count(), 2);
    stream.stop().await.unwrap();
}

fn slow_runtime(delay: Duration) -> Runtime {
    let registry = NodeRegistry::new().with("work", Arc::new(SleepyNode::new(delay)));
    let rt = Runtime::new(single_node_graph(), registry, AppConfig::default())
        .unwrap()
        .with_backoff(Arc::new(NoBackoff));
    rt.register_entry_point(EntryPointSpec::new("main", "Main", "work")).unwrap();
    rt
}

#[tokio::test]
async fn trigger_and_wait_reports_timeout_and_run_continues() {
    let rt = Arc::new(slow_runtime(Duration::from_millis(300)));
    rt.start().await.unwrap();

    let outcome = rt
        .trigger_and_wait("main", json!({}), Some(Duration::from_millis(20)))
        .await
        .unwrap();
    let TriggerOutcome::TimedOut { execution_id } = outcome else {
        panic!("expected a timeout");
    };

    // The run was not cancelled by the caller giving up.
    let mut finished = None;
    for _ in 0..100 {
        finished = rt.get_result("main", &execution_id).await;
        if finished.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(finished.expect("run should finish").success);
    rt.stop().await.unwrap();
}

#[tokio::test]
async fn default_timeout_comes_from_config() {
    let registry = NodeRegistry::new().with("work", Arc::new(SleepyNode::new(Duration::from_secs(30))));
    let mut config = AppConfig::default();
    config.runtime.default_timeout_secs = 0;
    let rt = Runtime::new(single_node_graph(), registry, config).unwrap();
    rt.register_entry_point(EntryPointSpec::new("main", "Main", "work")).unwrap();
    let rt = Arc::new(rt);
    rt.start().await.unwrap();

    let outcome = rt.trigger_and_wait("main", json!({}), None).await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::TimedOut { .. }));
    rt.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_triggers_run_independently() {
    let registry = NodeRegistry::new()
        .with("a", Arc::new(ScriptedNode::succeeding(json!({"a": true}))))
        .with("b", Arc::new(SleepyNode::new(Duration::from_millis(20))));
    let graph = GraphSpec::new("pair", "a")
        .with_node(NodeSpec::new("a", "A"))
        .with_node(NodeSpec::new("b", "B"))
        .with_edge(EdgeSpec::always("a", "b"))
        .with_terminal("b");
    let hook = Arc::new(RecordingHook::new());
    let rt = Runtime::new(graph, registry, AppConfig::default())
        .unwrap()
        .with_hook(hook.clone());
    rt.register_entry_point(EntryPointSpec::new("main", "Main", "a")).unwrap();
    let rt = Arc::new(rt);
    rt.start().await.unwrap();

    let waits = (0..8).map(|i| {
        let rt = rt.clone();
        async move {
            rt.trigger_and_wait("main", json!({ "request": i }), Some(Duration::from_secs(5)))
                .await
        }
    });
    let outcomes = futures::future::join_all(waits).await;

    let mut outputs = Vec::new();
    for outcome in outcomes {
        let Ok(TriggerOutcome::Completed(result)) = outcome else {
            panic!("run did not complete");
        };
        assert_eq!(result.node_path, vec!["a", "b"]);
        outputs.push(result.output["request"].as_i64().unwrap());
    }
    outputs.sort();
    // Each run kept its own context.
    assert_eq!(outputs, (0..8).collect::<Vec<_>>());
    assert_eq!(hook.events_for("b").iter().filter(|e| *e == "end").count(), 8);
    rt.stop().await.unwrap();
}

#[tokio::test]
async fn execution_lifecycle_is_published() {
    let registry = NodeRegistry::new().with("work", Arc::new(ScriptedNode::succeeding(json!({}))));
    let rt = Runtime::new(single_node_graph(), registry, AppConfig::default()).unwrap();
    rt.register_entry_point(EntryPointSpec::new("main", "Main", "work")).unwrap();
    let rt = Arc::new(rt);
    let mut rx = rt.event_bus().subscribe();
    rt.start().await.unwrap();

    let TriggerOutcome::Completed(_) = rt
        .trigger_and_wait("main", json!({}), Some(Duration::from_secs(5)))
        .await
        .unwrap()
    else {
        panic!("expected completion");
    };

    let mut saw_start = false;
    let mut saw_end = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            RuntimeEvent::ExecutionStarted { entry_point, .. } => saw_start = entry_point == "main",
            RuntimeEvent::ExecutionCompleted { success, .. } => saw_end = success,
            _ => {}
        }
    }
    assert!(saw_start && saw_end);
    rt.stop().await.unwrap();
}

#[tokio::test]
async fn stop_interrupts_long_runs() {
    let mut config = AppConfig::default();
    config.runtime.stop_timeout_secs = 1;
    let registry = NodeRegistry::new().with("work", Arc::new(SleepyNode::new(Duration::from_secs(60))));
    let rt = Runtime::new(single_node_graph(), registry, config).unwrap();
    rt.register_entry_point(EntryPointSpec::new("main", "Main", "work")).unwrap();
    let rt = Arc::new(rt);
    rt.start().await.unwrap();

    let id = rt.trigger("main", json!({}), None).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = std::time::Instant::now();
    rt.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let result = rt.get_result("main", &id).await.expect("cancelled run is recorded");
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Execution cancelled"));
}
