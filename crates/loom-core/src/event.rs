use crate::types::ExecutionId;

/// Runtime event broadcast to all subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// A triggered run was scheduled on a stream.
    ExecutionStarted {
        entry_point: String,
        execution_id: ExecutionId,
    },
    /// A run finished (successfully or not).
    ExecutionCompleted {
        entry_point: String,
        execution_id: ExecutionId,
        success: bool,
    },
    /// A node attempt started.
    NodeStarted {
        execution_id: ExecutionId,
        node_id: String,
        node_type: String,
        attempt: u32,
    },
    /// A node finished successfully.
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: String,
        tokens_used: u64,
        latency_ms: u64,
    },
    /// A node failed with its retries exhausted.
    NodeError {
        execution_id: ExecutionId,
        node_id: String,
        error: String,
        attempts: u32,
    },
    /// A failed attempt is about to be retried.
    NodeRetry {
        execution_id: ExecutionId,
        node_id: String,
        attempt: u32,
        max_retries: u32,
        error: String,
    },
    /// The executor followed an edge.
    EdgeTraversed {
        execution_id: ExecutionId,
        edge_id: String,
        source: String,
        target: String,
        condition: String,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RuntimeEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    pub fn emit_node_started(&self, execution_id: &ExecutionId, node_id: &str, node_type: &str, attempt: u32) {
        self.publish(RuntimeEvent::NodeStarted {
            execution_id: execution_id.clone(),
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            attempt,
        });
    }

    pub fn emit_node_completed(&self, execution_id: &ExecutionId, node_id: &str, tokens_used: u64, latency_ms: u64) {
        self.publish(RuntimeEvent::NodeCompleted {
            execution_id: execution_id.clone(),
            node_id: node_id.to_string(),
            tokens_used,
            latency_ms,
        });
    }

    pub fn emit_node_error(&self, execution_id: &ExecutionId, node_id: &str, error: &str, attempts: u32) {
        self.publish(RuntimeEvent::NodeError {
            execution_id: execution_id.clone(),
            node_id: node_id.to_string(),
            error: error.to_string(),
            attempts,
        });
    }

    pub fn emit_node_retry(
        &self,
        execution_id: &ExecutionId,
        node_id: &str,
        attempt: u32,
        max_retries: u32,
        error: &str,
    ) {
        self.publish(RuntimeEvent::NodeRetry {
            execution_id: execution_id.clone(),
            node_id: node_id.to_string(),
            attempt,
            max_retries,
            error: error.to_string(),
        });
    }

    pub fn emit_edge_traversed(
        &self,
        execution_id: &ExecutionId,
        edge_id: &str,
        source: &str,
        target: &str,
        condition: &str,
    ) {
        self.publish(RuntimeEvent::EdgeTraversed {
            execution_id: execution_id.clone(),
            edge_id: edge_id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: condition.to_string(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let id = ExecutionId::from_string("exec-1");

        bus.emit_node_started(&id, "a", "function", 0);
        bus.emit_node_completed(&id, "a", 5, 12);

        assert!(matches!(rx.recv().await.unwrap(), RuntimeEvent::NodeStarted { ref node_id, .. } if node_id == "a"));
        assert!(matches!(rx.recv().await.unwrap(), RuntimeEvent::NodeCompleted { tokens_used: 5, .. }));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit_node_retry(&ExecutionId::new(), "a", 1, 3, "boom");
    }
}
