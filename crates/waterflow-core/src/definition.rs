use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Kind of a node in a flow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    State,
    Condition,
    Parallel,
    Join,
    End,
}

/// A node of the immutable topology, identified by its `meta_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub meta_id: String,
    /// Human-readable label, reported by completeness for error nodes.
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Downstream node ids. For conditions, one entry per branch.
    #[serde(default)]
    pub next: Vec<String>,
    /// Name of the jober this node delegates to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jober: Option<String>,
}

impl NodeDefinition {
    pub fn new(meta_id: impl Into<String>, name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            meta_id: meta_id.into(),
            name: name.into(),
            node_type,
            next: vec![],
            jober: None,
        }
    }

    pub fn to(mut self, next: impl Into<String>) -> Self {
        self.next.push(next.into());
        self
    }
}

/// Read-only topology of one flow, shared across executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub stream_id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub nodes: Vec<NodeDefinition>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl FlowDefinition {
    pub fn new(stream_id: impl Into<String>, name: impl Into<String>, nodes: Vec<NodeDefinition>) -> Self {
        Self {
            stream_id: stream_id.into(),
            name: name.into(),
            version: default_version(),
            nodes,
        }
    }

    pub fn node(&self, meta_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.meta_id == meta_id)
    }

    pub fn start_node(&self) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.node_type == NodeType::Start)
    }

    /// Check the invariants every definition must hold: one start, at
    /// most one end, unique ids and edges that point at known nodes.
    pub fn validate(&self) -> Result<()> {
        let starts = self
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Start)
            .count();
        if starts != 1 {
            return Err(FlowError::Config(format!(
                "flow '{}' must have exactly one start node, found {}",
                self.stream_id, starts
            )));
        }
        let ends = self
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::End)
            .count();
        if ends > 1 {
            return Err(FlowError::Config(format!(
                "flow '{}' has {} end nodes, only one terminal is allowed",
                self.stream_id, ends
            )));
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.meta_id.as_str()) {
                return Err(FlowError::Config(format!(
                    "duplicate node id '{}' in flow '{}'",
                    node.meta_id, self.stream_id
                )));
            }
        }
        for node in &self.nodes {
            for next in &node.next {
                if !ids.contains(next.as_str()) {
                    return Err(FlowError::NodeNotFound(format!(
                        "{} (edge from '{}')",
                        next, node.meta_id
                    )));
                }
            }
        }
        Ok(())
    }
}
