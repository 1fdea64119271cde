use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use waterflow_core::definition::NodeType;
use waterflow_core::error::FlowError;
use waterflow_core::types::FlowContext;

use crate::operator::{FoldFn, InitFn, Operator};
use crate::window::{JoinMode, WindowTokens};

/// Typed handle to a node, valid for the builder and flow it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// One `match` or `match_to` arm of a condition node.
pub struct Route {
    pub whether: Predicate,
    pub target: NodeId,
}

/// What a node's error handler wants done with failed contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
    /// Mark RETRYABLE and schedule a retry record.
    Retry,
    /// Mark ERROR.
    Fail,
}

pub type ErrorHandler = Arc<dyn Fn(&FlowError, &[FlowContext]) -> ErrorDecision + Send + Sync>;

pub enum NodeKind {
    Start,
    State(Operator),
    Condition {
        routes: Vec<Route>,
        others: Option<NodeId>,
    },
    Parallel {
        mode: JoinMode,
        branches: Vec<NodeId>,
    },
    Join {
        fork: NodeId,
        mode: JoinMode,
        branches: usize,
        init: InitFn,
        fold: FoldFn,
        tokens: WindowTokens,
    },
    End,
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Start => NodeType::Start,
            NodeKind::State(_) => NodeType::State,
            NodeKind::Condition { .. } => NodeType::Condition,
            NodeKind::Parallel { .. } => NodeType::Parallel,
            NodeKind::Join { .. } => NodeType::Join,
            NodeKind::End => NodeType::End,
        }
    }
}

pub struct FlowNode {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    /// Human-readable label; defaults to the name.
    pub(crate) label: String,
    pub(crate) kind: NodeKind,
    /// Plain downstream subscribers. Conditions and parallels route through
    /// their own targets instead.
    pub(crate) next: Vec<NodeId>,
    pub(crate) on_error: Option<ErrorHandler>,
}

impl FlowNode {
    pub(crate) fn new(id: NodeId, name: String, kind: NodeKind) -> Self {
        Self {
            id,
            label: name.clone(),
            name,
            kind,
            next: Vec::new(),
            on_error: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Every node this one can hand contexts to.
    pub fn successors(&self) -> Vec<NodeId> {
        let mut out = self.next.clone();
        match &self.kind {
            NodeKind::Condition { routes, others } => {
                out.extend(routes.iter().map(|r| r.target));
                out.extend(others.iter().copied());
            }
            NodeKind::Parallel { branches, .. } => out.extend(branches.iter().copied()),
            _ => {}
        }
        let mut seen = Vec::with_capacity(out.len());
        out.retain(|id| {
            if seen.contains(id) {
                false
            } else {
                seen.push(*id);
                true
            }
        });
        out
    }

    /// Whether close() should wire this node to the end node.
    pub(crate) fn is_dangling(&self) -> bool {
        match &self.kind {
            NodeKind::End => false,
            NodeKind::Condition { routes, others } => {
                routes.is_empty() && others.is_none() && self.next.is_empty()
            }
            NodeKind::Parallel { branches, .. } => branches.is_empty() && self.next.is_empty(),
            _ => self.next.is_empty(),
        }
    }
}
