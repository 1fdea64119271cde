use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use waterflow_core::error::{FlowError, Result};
use waterflow_core::types::FlowContext;
use waterflow_jober::{Jober, JoberNode, JoberSpec};

use crate::flow::{Flow, FlowErrorCallback, FlowStore, SuccessCallback};
use crate::node::{ErrorDecision, FlowNode, NodeId, NodeKind, Predicate, Route};
use crate::operator::{Operator, ProcessScope};
use crate::window::{JoinMode, WindowSpec, WindowTokens};

/// The next edge out of `from` must land on a condition arm or fork branch.
enum PendingEdge {
    Route(Predicate),
    Others,
    Branch,
}

/// Assembles a flow from typed node handles.
///
/// Every operator method takes the upstream handle and the new node's id
/// and returns the new node's handle. Jump targets are handles too, so they
/// resolve here rather than at runtime.
pub struct FlowBuilder {
    stream_id: String,
    name: String,
    nodes: Vec<FlowNode>,
    by_name: HashMap<String, NodeId>,
    start: Option<NodeId>,
    pending: Option<(NodeId, PendingEdge)>,
    fork_tails: HashMap<NodeId, Vec<NodeId>>,
    on_success: Option<SuccessCallback>,
    on_error: Option<FlowErrorCallback>,
}

impl FlowBuilder {
    pub fn new(stream_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            name: name.into(),
            nodes: Vec::new(),
            by_name: HashMap::new(),
            start: None,
            pending: None,
            fork_tails: HashMap::new(),
            on_success: None,
            on_error: None,
        }
    }

    fn node(&self, id: NodeId) -> Result<&FlowNode> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| FlowError::NodeNotFound(id.to_string()))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut FlowNode> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| FlowError::NodeNotFound(id.to_string()))
    }

    fn add(&mut self, name: impl Into<String>, kind: NodeKind) -> Result<NodeId> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(FlowError::Config(format!("duplicate node id '{}'", name)));
        }
        let id = NodeId(self.nodes.len());
        self.by_name.insert(name.clone(), id);
        self.nodes.push(FlowNode::new(id, name, kind));
        Ok(id)
    }

    fn attach(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        self.node(to)?;
        let pending = match self.pending.take() {
            Some((owner, edge)) if owner == from => Some(edge),
            other => {
                self.pending = other;
                None
            }
        };

        let node = self.node_mut(from)?;
        match (&mut node.kind, pending) {
            (NodeKind::Condition { routes, .. }, Some(PendingEdge::Route(whether))) => {
                routes.push(Route { whether, target: to });
            }
            (NodeKind::Condition { others, .. }, Some(PendingEdge::Others)) => {
                if others.is_some() {
                    return Err(FlowError::Config(format!(
                        "condition '{}' already has an others() branch",
                        node.name
                    )));
                }
                *others = Some(to);
            }
            (NodeKind::Parallel { branches, .. }, Some(PendingEdge::Branch)) => {
                branches.push(to);
            }
            (NodeKind::Condition { .. }, _) => {
                return Err(FlowError::Config(format!(
                    "condition '{}' can only be left through match_branch, match_to or others",
                    node.name
                )));
            }
            (NodeKind::Parallel { .. }, _) => {
                return Err(FlowError::Config(format!(
                    "parallel '{}' can only be left through fork",
                    node.name
                )));
            }
            (NodeKind::End, _) => {
                return Err(FlowError::Config("the end node has no downstream".into()));
            }
            _ => node.next.push(to),
        }
        Ok(())
    }

    fn chain(&mut self, from: NodeId, id: impl Into<String>, kind: NodeKind) -> Result<NodeId> {
        self.node(from)?;
        let to = self.add(id, kind)?;
        if let Err(e) = self.attach(from, to) {
            if let Some(node) = self.nodes.pop() {
                self.by_name.remove(&node.name);
            }
            return Err(e);
        }
        Ok(to)
    }

    fn state(&mut self, from: NodeId, id: impl Into<String>, op: Operator) -> Result<NodeId> {
        self.chain(from, id, NodeKind::State(op))
    }

    /// Entry node that accepts offered data. A flow has exactly one.
    pub fn start(&mut self, id: impl Into<String>) -> Result<NodeId> {
        if self.start.is_some() {
            return Err(FlowError::Config("flow already has a start node".into()));
        }
        let start = self.add(id, NodeKind::Start)?;
        self.start = Some(start);
        Ok(start)
    }

    /// Set the label reported for a node.
    pub fn label(&mut self, node: NodeId, label: impl Into<String>) -> Result<()> {
        self.node_mut(node)?.label = label.into();
        Ok(())
    }

    pub fn just<F>(&mut self, from: NodeId, id: impl Into<String>, f: F) -> Result<NodeId>
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        self.state(from, id, Operator::Just(Arc::new(f)))
    }

    pub fn map<F>(&mut self, from: NodeId, id: impl Into<String>, f: F) -> Result<NodeId>
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.state(from, id, Operator::Map(Arc::new(f)))
    }

    pub fn flat_map<F>(&mut self, from: NodeId, id: impl Into<String>, f: F) -> Result<NodeId>
    where
        F: Fn(&Value) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        self.state(from, id, Operator::FlatMap(Arc::new(f)))
    }

    pub fn process<F>(&mut self, from: NodeId, id: impl Into<String>, f: F) -> Result<NodeId>
    where
        F: Fn(&FlowContext, &mut ProcessScope<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.state(
            from,
            id,
            Operator::Process {
                f: Arc::new(f),
                state: Mutex::new(HashMap::new()),
            },
        )
    }

    pub fn key_by<F>(&mut self, from: NodeId, id: impl Into<String>, f: F) -> Result<NodeId>
    where
        F: Fn(&Value) -> Result<String> + Send + Sync + 'static,
    {
        self.state(from, id, Operator::KeyBy(Arc::new(f)))
    }

    pub fn window(&mut self, from: NodeId, id: impl Into<String>, spec: WindowSpec) -> Result<NodeId> {
        self.state(from, id, Operator::Window(spec))
    }

    /// Fold payloads per aggregation key. Directly after a window the fold
    /// is held back until that key's window is fulfilled.
    pub fn reduce<I, F>(&mut self, from: NodeId, id: impl Into<String>, init: I, fold: F) -> Result<NodeId>
    where
        I: Fn() -> Value + Send + Sync + 'static,
        F: Fn(Value, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        let window = match &self.node(from)?.kind {
            NodeKind::State(Operator::Window(spec)) => Some((spec.clone(), WindowTokens::new())),
            _ => None,
        };
        self.state(
            from,
            id,
            Operator::Reduce {
                init: Arc::new(init),
                fold: Arc::new(fold),
                window,
            },
        )
    }

    /// A node whose work is done by a jober.
    pub fn jober(
        &mut self,
        from: NodeId,
        id: impl Into<String>,
        spec: JoberSpec,
        jober: Arc<dyn Jober>,
    ) -> Result<NodeId> {
        let id = id.into();
        if spec.is_async && !jober.can_dispatch() {
            return Err(FlowError::Config(format!(
                "node '{}': {:?} jober cannot run asynchronously",
                id,
                jober.kind()
            )));
        }
        let node = JoberNode::new(id.clone(), spec, jober);
        self.state(from, id, Operator::Jober(Arc::new(node)))
    }

    pub fn conditions(&mut self, from: NodeId, id: impl Into<String>) -> Result<NodeId> {
        self.chain(
            from,
            id,
            NodeKind::Condition {
                routes: Vec::new(),
                others: None,
            },
        )
    }

    fn expect_condition(&self, cond: NodeId) -> Result<()> {
        match self.node(cond)?.kind {
            NodeKind::Condition { .. } => Ok(()),
            _ => Err(FlowError::Config(format!(
                "node '{}' is not a condition",
                self.node(cond)?.name
            ))),
        }
    }

    fn build_branch<B>(&mut self, owner: NodeId, edge: PendingEdge, branch: B) -> Result<NodeId>
    where
        B: FnOnce(&mut Self, NodeId) -> Result<NodeId>,
    {
        self.pending = Some((owner, edge));
        let tail = branch(self, owner);
        let unconsumed = matches!(self.pending, Some((o, _)) if o == owner);
        self.pending = None;
        let tail = tail?;
        if unconsumed || tail == owner {
            return Err(FlowError::Config(format!(
                "branch of '{}' must add a node downstream of it",
                self.node(owner)?.name
            )));
        }
        Ok(tail)
    }

    /// Route contexts satisfying `whether` into a new branch. Arms are
    /// tried in the order they were added. Returns the branch's tail.
    pub fn match_branch<W, B>(&mut self, cond: NodeId, whether: W, branch: B) -> Result<NodeId>
    where
        W: Fn(&Value) -> bool + Send + Sync + 'static,
        B: FnOnce(&mut Self, NodeId) -> Result<NodeId>,
    {
        self.expect_condition(cond)?;
        self.build_branch(cond, PendingEdge::Route(Arc::new(whether)), branch)
    }

    /// Route contexts satisfying `whether` to an existing node.
    pub fn match_to<W>(&mut self, cond: NodeId, whether: W, target: NodeId) -> Result<()>
    where
        W: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.expect_condition(cond)?;
        self.node(target)?;
        self.pending = Some((cond, PendingEdge::Route(Arc::new(whether))));
        self.attach(cond, target)
    }

    /// Default branch for contexts no arm matched.
    pub fn others<B>(&mut self, cond: NodeId, branch: B) -> Result<NodeId>
    where
        B: FnOnce(&mut Self, NodeId) -> Result<NodeId>,
    {
        self.expect_condition(cond)?;
        self.build_branch(cond, PendingEdge::Others, branch)
    }

    pub fn parallel(&mut self, from: NodeId, id: impl Into<String>, mode: JoinMode) -> Result<NodeId> {
        self.chain(
            from,
            id,
            NodeKind::Parallel {
                mode,
                branches: Vec::new(),
            },
        )
    }

    /// Add a sibling branch to a parallel node. Returns the branch's tail.
    pub fn fork<B>(&mut self, parallel: NodeId, branch: B) -> Result<NodeId>
    where
        B: FnOnce(&mut Self, NodeId) -> Result<NodeId>,
    {
        if !matches!(self.node(parallel)?.kind, NodeKind::Parallel { .. }) {
            return Err(FlowError::Config(format!(
                "node '{}' is not a parallel",
                self.node(parallel)?.name
            )));
        }
        let tail = self.build_branch(parallel, PendingEdge::Branch, branch)?;
        self.fork_tails.entry(parallel).or_default().push(tail);
        Ok(tail)
    }

    /// Fan the parallel's branches back in, folding one payload per branch.
    pub fn join<I, F>(&mut self, parallel: NodeId, id: impl Into<String>, init: I, fold: F) -> Result<NodeId>
    where
        I: Fn() -> Value + Send + Sync + 'static,
        F: Fn(Value, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        let mode = match &self.node(parallel)?.kind {
            NodeKind::Parallel { mode, .. } => *mode,
            _ => {
                return Err(FlowError::Config(format!(
                    "node '{}' is not a parallel",
                    self.node(parallel)?.name
                )))
            }
        };
        let tails = self.fork_tails.remove(&parallel).unwrap_or_default();
        if tails.is_empty() {
            return Err(FlowError::Config(format!(
                "parallel '{}' has no forks to join",
                self.node(parallel)?.name
            )));
        }

        let join = self.add(
            id,
            NodeKind::Join {
                fork: parallel,
                mode,
                branches: tails.len(),
                init: Arc::new(init),
                fold: Arc::new(fold),
                tokens: WindowTokens::new(),
            },
        )?;
        for tail in tails {
            self.attach(tail, join)?;
        }
        Ok(join)
    }

    /// Explicit edge to an existing node, for jumps and loops.
    pub fn to(&mut self, from: NodeId, target: NodeId) -> Result<()> {
        self.node(from)?;
        self.attach(from, target)
    }

    /// Local error handler for one node.
    pub fn error<H>(&mut self, node: NodeId, handler: H) -> Result<()>
    where
        H: Fn(&FlowError, &[FlowContext]) -> ErrorDecision + Send + Sync + 'static,
    {
        self.node_mut(node)?.on_error = Some(Arc::new(handler));
        Ok(())
    }

    /// Called with the contexts that reach the end node.
    pub fn on_success<F>(&mut self, f: F)
    where
        F: Fn(&[FlowContext]) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
    }

    /// Called for node failures that have no local handler.
    pub fn on_error<F>(&mut self, f: F)
    where
        F: Fn(&FlowError, &[FlowContext]) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
    }

    /// Add the end node, wire every node without a downstream to it, and
    /// produce the runnable flow.
    pub fn close(mut self, end_id: impl Into<String>, store: FlowStore) -> Result<Flow> {
        let start = self
            .start
            .ok_or_else(|| FlowError::Config(format!("flow '{}' has no start node", self.name)))?;
        if let Some((&parallel, _)) = self.fork_tails.iter().next() {
            debug!(
                stream_id = %self.stream_id,
                parallel = %self.node(parallel)?.name,
                "Forks without a join end at the end node"
            );
        }

        let end = self.add(end_id, NodeKind::End)?;
        let dangling: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.is_dangling())
            .map(|n| n.id)
            .collect();
        for id in dangling {
            self.nodes[id.0].next.push(end);
        }

        Ok(Flow::new(
            self.stream_id,
            self.name,
            self.nodes,
            self.by_name,
            start,
            end,
            store,
            self.on_success,
            self.on_error,
        ))
    }
}
