use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use waterflow_core::definition::{FlowDefinition, NodeType};
use waterflow_core::error::{FlowError, Result};
use waterflow_core::traits::{ContextRepository, DefinitionRepository, TraceRepository};
use waterflow_core::types::{FlowContext, FlowNodeStatus, FlowTrace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletenessStatus {
    Archived,
    Error,
    Running,
}

impl CompletenessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletenessStatus::Archived => "ARCHIVED",
            CompletenessStatus::Error => "ERROR",
            CompletenessStatus::Running => "RUNNING",
        }
    }
}

impl fmt::Display for CompletenessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceCompleteness {
    pub trace_id: String,
    pub stream_id: String,
    /// Archived share of reachable nodes, two decimals, e.g. `"66.67"`.
    pub percentage: String,
    pub status: CompletenessStatus,
    /// Labels of the nodes holding ERROR contexts, in topology order.
    pub error_nodes: Vec<String>,
}

/// Read-only progress reports over persisted traces.
pub struct CompletenessCalculator {
    traces: Arc<dyn TraceRepository>,
    contexts: Arc<dyn ContextRepository>,
    definitions: Arc<dyn DefinitionRepository>,
}

impl CompletenessCalculator {
    pub fn new(
        traces: Arc<dyn TraceRepository>,
        contexts: Arc<dyn ContextRepository>,
        definitions: Arc<dyn DefinitionRepository>,
    ) -> Self {
        Self {
            traces,
            contexts,
            definitions,
        }
    }

    pub async fn calculate(&self, trace_ids: Vec<String>) -> Result<Vec<TraceCompleteness>> {
        let traces = self.traces.find_trace_by_id_list(trace_ids.clone()).await?;
        let by_id: HashMap<&str, &FlowTrace> = traces.iter().map(|t| (t.id.as_str(), t)).collect();

        let mut definitions: HashMap<String, FlowDefinition> = HashMap::new();
        let mut out = Vec::with_capacity(trace_ids.len());
        for trace_id in &trace_ids {
            let trace = by_id
                .get(trace_id.as_str())
                .ok_or_else(|| FlowError::TraceNotFound(trace_id.clone()))?;

            if !definitions.contains_key(&trace.stream_id) {
                let definition = self
                    .definitions
                    .find_by_stream_id(trace.stream_id.clone())
                    .await?
                    .ok_or_else(|| FlowError::DefinitionNotFound(trace.stream_id.clone()))?;
                definitions.insert(trace.stream_id.clone(), definition);
            }
            let definition = &definitions[&trace.stream_id];

            let contexts = self
                .contexts
                .find_by_context_id_list(trace.context_pool.iter().cloned().collect())
                .await?;
            let report = compute(trace, definition, &contexts);
            debug!(
                trace_id = %trace.id,
                stream_id = %trace.stream_id,
                percentage = %report.percentage,
                status = %report.status,
                "Completeness calculated"
            );
            out.push(report);
        }
        Ok(out)
    }
}

/// Walk the topology from the start node and compare reachable nodes with
/// nodes that hold an ARCHIVED context.
///
/// At a condition only the branches whose target holds a context are
/// followed; when none does yet, every branch counts.
pub fn compute(trace: &FlowTrace, definition: &FlowDefinition, contexts: &[FlowContext]) -> TraceCompleteness {
    let mut at: HashMap<&str, Vec<&FlowContext>> = HashMap::new();
    for ctx in contexts {
        at.entry(ctx.position.as_str()).or_default().push(ctx);
    }
    let has = |node: &str, status: FlowNodeStatus| {
        at.get(node)
            .is_some_and(|cs| cs.iter().any(|c| c.status == status))
    };

    let mut reachable: Vec<&str> = Vec::new();
    if let Some(start) = definition.start_node() {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        visited.insert(start.meta_id.as_str());
        queue.push_back(start.meta_id.as_str());

        while let Some(id) = queue.pop_front() {
            reachable.push(id);
            let Some(node) = definition.node(id) else {
                continue;
            };
            let mut next: Vec<&str> = node.next.iter().map(String::as_str).collect();
            if node.node_type == NodeType::Condition {
                let taken: Vec<&str> = next.iter().copied().filter(|n| at.contains_key(n)).collect();
                if !taken.is_empty() {
                    next = taken;
                }
            }
            for n in next {
                if visited.insert(n) {
                    queue.push_back(n);
                }
            }
        }
    }

    let total = reachable.len();
    let archived = reachable
        .iter()
        .filter(|&&n| has(n, FlowNodeStatus::Archived))
        .count();
    let percentage = if total == 0 {
        "0.00".to_string()
    } else {
        format!("{:.2}", archived as f64 * 100.0 / total as f64)
    };

    let error_nodes: Vec<String> = definition
        .nodes
        .iter()
        .filter(|n| has(n.meta_id.as_str(), FlowNodeStatus::Error))
        .map(|n| n.name.clone())
        .collect();
    let any_error = contexts.iter().any(|c| c.status == FlowNodeStatus::Error);

    let status = if any_error {
        CompletenessStatus::Error
    } else if total > 0 && archived == total {
        CompletenessStatus::Archived
    } else {
        CompletenessStatus::Running
    };

    TraceCompleteness {
        trace_id: trace.id.clone(),
        stream_id: trace.stream_id.clone(),
        percentage,
        status,
        error_nodes,
    }
}
