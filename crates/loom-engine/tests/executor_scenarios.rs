use std::sync::Arc;

use serde_json::json;

use loom_core::event::{EventBus, RuntimeEvent};
use loom_core::types::RunContext;
use loom_engine::graph::{EdgeSpec, GraphExecutor, GraphSpec, NoBackoff, NodeRegistry, NodeSpec};
use loom_test_utils::{FailingHook, PanickingNode, RecordingHook, ScriptedNode, Step};

fn executor(registry: NodeRegistry) -> GraphExecutor {
    GraphExecutor::new(registry).with_backoff(Arc::new(NoBackoff))
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn retry_fires_start_error_start_end_and_one_retry_event() {
    let graph = GraphSpec::new("retry", "work")
        .with_node(NodeSpec::new("work", "Work").with_max_retries(2))
        .with_terminal("work");
    let registry = NodeRegistry::new().with("work", Arc::new(ScriptedNode::flaky(1, json!({"ok": true}))));

    let hook = Arc::new(RecordingHook::new());
    let bus = Arc::new(EventBus::new(64));
    let mut rx = bus.subscribe();

    let result = executor(registry)
        .with_hook(hook.clone())
        .with_event_bus(bus.clone())
        .execute(&graph, RunContext::new())
        .await;

    assert!(result.success);
    assert_eq!(hook.events_for("work"), vec!["start", "error", "start", "end"]);

    let retries: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, RuntimeEvent::NodeRetry { .. }))
        .collect();
    assert_eq!(retries.len(), 1);
    let RuntimeEvent::NodeRetry { attempt, max_retries, .. } = &retries[0] else {
        unreachable!();
    };
    assert_eq!((*attempt, *max_retries), (1, 2));
}

#[tokio::test]
async fn exhausted_retries_surface_the_last_error() {
    let graph = GraphSpec::new("retry", "work")
        .with_node(NodeSpec::new("work", "Work").with_max_retries(2))
        .with_terminal("work");
    let node = Arc::new(ScriptedNode::failing("backend down"));
    let registry = NodeRegistry::new().with("work", node.clone());
    let hook = Arc::new(RecordingHook::new());

    let result = executor(registry).with_hook(hook.clone()).execute(&graph, RunContext::new()).await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("backend down"));
    assert_eq!(node.calls(), 2);
    assert_eq!(
        hook.events_for("work"),
        vec!["start", "error", "start", "error"]
    );
}

#[tokio::test]
async fn retry_budget_counts_the_first_attempt() {
    for (max_retries, expected_calls) in [(0, 1), (1, 1), (3, 3)] {
        let graph = GraphSpec::new("retry", "work")
            .with_node(NodeSpec::new("work", "Work").with_max_retries(max_retries))
            .with_terminal("work");
        let node = Arc::new(ScriptedNode::failing("still down"));
        let registry = NodeRegistry::new().with("work", node.clone());
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();

        let result = executor(registry)
            .with_event_bus(bus.clone())
            .execute(&graph, RunContext::new())
            .await;

        assert!(!result.success);
        assert_eq!(node.calls(), expected_calls, "max_retries = {}", max_retries);
        let retries = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, RuntimeEvent::NodeRetry { .. }))
            .count();
        assert_eq!(retries, expected_calls - 1);
    }
}

#[tokio::test]
async fn misbehaving_hooks_do_not_starve_others() {
    let graph = GraphSpec::new("hooks", "a")
        .with_node(NodeSpec::new("a", "A"))
        .with_terminal("a");
    let registry = NodeRegistry::new().with("a", Arc::new(ScriptedNode::succeeding(json!({}))));
    let recorder = Arc::new(RecordingHook::new());

    let result = executor(registry)
        .with_hook(Arc::new(FailingHook::panicking()))
        .with_hook(Arc::new(FailingHook::erroring()))
        .with_hook(recorder.clone())
        .execute(&graph, RunContext::new())
        .await;

    assert!(result.success);
    assert_eq!(recorder.events(), vec!["start:a", "end:a"]);
}

#[tokio::test]
async fn registered_node_off_the_path_never_fires() {
    let graph = GraphSpec::new("branch", "a")
        .with_node(NodeSpec::new("a", "A"))
        .with_node(NodeSpec::new("b", "B"))
        .with_node(NodeSpec::new("orphan", "Orphan"))
        .with_edge(EdgeSpec::always("a", "b"))
        .with_terminal("b");
    let orphan = Arc::new(ScriptedNode::succeeding(json!({})));
    let registry = NodeRegistry::new()
        .with("a", Arc::new(ScriptedNode::succeeding(json!({}))))
        .with("b", Arc::new(ScriptedNode::succeeding(json!({}))))
        .with("orphan", orphan.clone());

    let hook = Arc::new(RecordingHook::new());
    let bus = Arc::new(EventBus::new(64));
    let mut rx = bus.subscribe();

    let result = executor(registry)
        .with_hook(hook.clone())
        .with_event_bus(bus.clone())
        .execute(&graph, RunContext::new())
        .await;

    assert_eq!(result.node_path, vec!["a", "b"]);
    assert_eq!(orphan.calls(), 0);
    assert!(hook.events_for("orphan").is_empty());
    for event in drain(&mut rx) {
        let node = match &event {
            RuntimeEvent::NodeStarted { node_id, .. }
            | RuntimeEvent::NodeCompleted { node_id, .. }
            | RuntimeEvent::NodeError { node_id, .. }
            | RuntimeEvent::NodeRetry { node_id, .. } => node_id.as_str(),
            RuntimeEvent::EdgeTraversed { target, .. } => target.as_str(),
            _ => continue,
        };
        assert_ne!(node, "orphan", "{:?}", event);
    }
}

fn scored_graph() -> GraphSpec {
    GraphSpec::new("review", "start")
        .with_node(NodeSpec::new("start", "Start"))
        .with_node(NodeSpec::new("middle", "Score"))
        .with_node(NodeSpec::new("pass", "Pass"))
        .with_node(NodeSpec::new("fail", "Fail"))
        .with_edge(EdgeSpec::always("start", "middle"))
        .with_edge(EdgeSpec::conditional("middle", "pass", "output.get('score') > 0.8"))
        .with_edge(EdgeSpec::always("middle", "fail"))
        .with_terminal("pass")
        .with_terminal("fail")
}

async fn run_scored(score: f64) -> Vec<String> {
    let registry = NodeRegistry::new()
        .with("start", Arc::new(ScriptedNode::succeeding(json!({}))))
        .with("middle", Arc::new(ScriptedNode::succeeding(json!({ "score": score }))))
        .with("pass", Arc::new(ScriptedNode::succeeding(json!({ "verdict": "pass" }))))
        .with("fail", Arc::new(ScriptedNode::succeeding(json!({ "verdict": "fail" }))));
    let result = executor(registry).execute(&scored_graph(), RunContext::new()).await;
    assert!(result.success);
    result.node_path
}

#[tokio::test]
async fn conditional_branch_follows_score() {
    assert_eq!(run_scored(0.9).await, vec!["start", "middle", "pass"]);
    assert_eq!(run_scored(0.5).await, vec!["start", "middle", "fail"]);
}

fn outcome_graph() -> GraphSpec {
    GraphSpec::new("outcomes", "try")
        .with_node(NodeSpec::new("try", "Try").with_max_retries(0))
        .with_node(NodeSpec::new("ok", "Ok"))
        .with_node(NodeSpec::new("recover", "Recover"))
        .with_node(NodeSpec::new("report", "Report"))
        .with_edge(EdgeSpec::on_success("try", "ok"))
        .with_edge(EdgeSpec::on_failure("try", "recover"))
        .with_edge(EdgeSpec::always("recover", "report"))
        .with_edge(EdgeSpec::always("ok", "report"))
        .with_terminal("report")
}

async fn run_outcome(first: Step) -> Vec<String> {
    let registry = NodeRegistry::new()
        .with("try", Arc::new(ScriptedNode::new(vec![first])))
        .with("ok", Arc::new(ScriptedNode::succeeding(json!({}))))
        .with("recover", Arc::new(ScriptedNode::succeeding(json!({}))))
        .with("report", Arc::new(ScriptedNode::succeeding(json!({}))));
    executor(registry)
        .execute(&outcome_graph(), RunContext::new())
        .await
        .node_path
}

#[tokio::test]
async fn path_is_implied_by_each_outcome() {
    assert_eq!(
        run_outcome(Step::Succeed(json!({}))).await,
        vec!["try", "ok", "report"]
    );
    assert_eq!(
        run_outcome(Step::Fail("nope".into())).await,
        vec!["try", "recover", "report"]
    );
    assert_eq!(
        run_outcome(Step::Raise("bug".into())).await,
        vec!["try", "recover", "report"]
    );
}

#[tokio::test]
async fn panicking_node_becomes_a_failed_run() {
    let graph = GraphSpec::new("boom", "a")
        .with_node(NodeSpec::new("a", "A").with_max_retries(2))
        .with_terminal("a");
    let registry = NodeRegistry::new().with("a", Arc::new(PanickingNode("kaboom")));
    let hook = Arc::new(RecordingHook::new());

    let result = executor(registry).with_hook(hook.clone()).execute(&graph, RunContext::new()).await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("kaboom"));
    assert_eq!(hook.events_for("a"), vec!["start", "error", "start", "error"]);
}

#[tokio::test]
async fn outputs_flow_into_later_conditions() {
    let graph = GraphSpec::new("memory", "fetch")
        .with_node(NodeSpec::new("fetch", "Fetch"))
        .with_node(NodeSpec::new("noop", "Noop"))
        .with_node(NodeSpec::new("big", "Big"))
        .with_node(NodeSpec::new("small", "Small"))
        .with_edge(EdgeSpec::always("fetch", "noop"))
        .with_edge(EdgeSpec::conditional("noop", "big", "memory['rows'] > 100 and region in ('eu', 'us')"))
        .with_edge(EdgeSpec::always("noop", "small"))
        .with_terminal("big")
        .with_terminal("small");
    let registry = NodeRegistry::new()
        .with("fetch", Arc::new(ScriptedNode::succeeding(json!({"rows": 250}))))
        .with("noop", Arc::new(ScriptedNode::succeeding(json!({}))))
        .with("big", Arc::new(ScriptedNode::succeeding(json!({}))))
        .with("small", Arc::new(ScriptedNode::succeeding(json!({}))));

    let result = executor(registry)
        .execute(&graph, RunContext::from_json(json!({"region": "eu"})))
        .await;

    assert_eq!(result.node_path, vec!["fetch", "noop", "big"]);
    assert_eq!(result.output["rows"], json!(250));
}
