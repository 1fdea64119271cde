use serde::Serialize;

/// Something observable happened inside the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    ContextArchived {
        stream_id: String,
        node: String,
        context_id: String,
    },
    ContextDiscarded {
        stream_id: String,
        node: String,
        context_id: String,
    },
    NodeFailed {
        stream_id: String,
        node: String,
        error: String,
        contexts: usize,
    },
    ContextsRetryable {
        stream_id: String,
        node: String,
        batch: String,
    },
    ContextsErrored {
        stream_id: String,
        node: String,
        contexts: usize,
    },
    AsyncDispatched {
        stream_id: String,
        node: String,
        batch: String,
    },
    AsyncResumed {
        stream_id: String,
        node: String,
        batch: String,
    },
    RetryAttempted {
        batch: String,
        retry_count: u32,
    },
    RetryExhausted {
        batch: String,
    },
    FlowCompleted {
        stream_id: String,
        contexts: usize,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
