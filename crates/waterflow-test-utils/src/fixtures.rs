use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use waterflow_core::definition::{FlowDefinition, NodeDefinition, NodeType};
use waterflow_core::types::{FlowContext, FlowData, FlowNodeStatus, FlowTrace};
use waterflow_store::{LocalLockProvider, MemoryStore};

/// `start1 -> state1 -> ender1`.
pub fn linear_definition(stream_id: &str) -> FlowDefinition {
    FlowDefinition::new(
        stream_id,
        "linear",
        vec![
            NodeDefinition::new("start1", "start", NodeType::Start).to("state1"),
            NodeDefinition::new("state1", "state", NodeType::State).to("ender1"),
            NodeDefinition::new("ender1", "end", NodeType::End),
        ],
    )
}

/// `start1 -> state1 -> condi1 -> {state2 | state3} -> ender1`.
pub fn branching_definition(stream_id: &str) -> FlowDefinition {
    FlowDefinition::new(
        stream_id,
        "branching",
        vec![
            NodeDefinition::new("start1", "start", NodeType::Start).to("state1"),
            NodeDefinition::new("state1", "state", NodeType::State).to("condi1"),
            NodeDefinition::new("condi1", "condition", NodeType::Condition)
                .to("state2")
                .to("state3"),
            NodeDefinition::new("state2", "approve", NodeType::State).to("ender1"),
            NodeDefinition::new("state3", "reject", NodeType::State).to("ender1"),
            NodeDefinition::new("ender1", "end", NodeType::End),
        ],
    )
}

/// A context row at `position` with the given status.
pub fn context_at(stream_id: &str, position: &str, status: FlowNodeStatus) -> FlowContext {
    let mut ctx = FlowContext::new(stream_id, position, FlowData::default(), BTreeSet::new());
    ctx.status = status;
    ctx
}

/// A trace whose pool holds `contexts`, which are tagged with it.
pub fn trace_with(stream_id: &str, contexts: &mut [FlowContext]) -> FlowTrace {
    let mut trace = FlowTrace::new(stream_id);
    for ctx in contexts.iter_mut() {
        ctx.trace_ids.insert(trace.id.clone());
        trace.context_pool.insert(ctx.id.clone());
    }
    trace
}

/// In-memory repositories and locks, shared by reference.
#[derive(Default, Clone)]
pub struct TestStores {
    pub memory: Arc<MemoryStore>,
    pub locks: Arc<LocalLockProvider>,
}

impl TestStores {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Write `contents` to a config file in a fresh temp directory.
pub fn temp_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("waterflow.toml");
    std::fs::write(&path, contents).expect("write config");
    (dir, path)
}
