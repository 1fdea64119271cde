use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use waterflow_core::definition::{FlowDefinition, NodeDefinition};
use waterflow_core::error::{FlowError, Result};
use waterflow_core::event::{EventBus, FlowEvent};
use waterflow_core::lock::{node_key, HeldLock, LockPhase};
use waterflow_core::policy::RetryPolicy;
use waterflow_core::traits::{ContextRepository, LockProvider, RetryRepository, TraceRepository};
use waterflow_core::types::{FlowContext, FlowData, FlowNodeStatus, FlowRetry, FlowTrace, ForkMarker};
use waterflow_jober::JoberNode;

use crate::node::{ErrorDecision, FlowNode, NodeId, NodeKind};
use crate::operator::{Operator, ProcessScope};
use crate::window::JoinOutcome;

pub type SuccessCallback = Arc<dyn Fn(&[FlowContext]) + Send + Sync>;
pub type FlowErrorCallback = Arc<dyn Fn(&FlowError, &[FlowContext]) + Send + Sync>;

/// Collaborators a flow persists through.
#[derive(Clone)]
pub struct FlowStore {
    pub contexts: Arc<dyn ContextRepository>,
    pub traces: Arc<dyn TraceRepository>,
    pub retries: Arc<dyn RetryRepository>,
    pub locks: Arc<dyn LockProvider>,
    pub events: Arc<EventBus>,
    pub policy: RetryPolicy,
}

/// Handle to an outstanding async jober call, for resume or fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchToken {
    pub stream_id: String,
    pub node: String,
    pub batch: String,
}

/// Result of offering data to a flow.
#[derive(Debug, Clone, Serialize)]
pub struct OfferReceipt {
    pub trace_id: String,
    /// Ids of the contexts created at the start node.
    pub context_ids: Vec<String>,
    /// Async dispatches still waiting for completion.
    pub dispatches: Vec<DispatchToken>,
}

/// One output of a node: data for a child of input `parent`.
struct Emission {
    parent: usize,
    data: FlowData,
    targets: Vec<NodeId>,
    /// Traces of the child when it aggregates several inputs.
    trace_ids: Option<BTreeSet<String>>,
}

#[derive(Default)]
struct NodeOutcome {
    emissions: Vec<Emission>,
    /// Inputs dropped without output (unmatched conditions, late EITHER branches).
    discarded: HashSet<usize>,
}

impl NodeOutcome {
    fn pass(outputs: Vec<FlowData>, targets: &[NodeId]) -> Self {
        Self {
            emissions: outputs
                .into_iter()
                .enumerate()
                .map(|(parent, data)| Emission {
                    parent,
                    data,
                    targets: targets.to_vec(),
                    trace_ids: None,
                })
                .collect(),
            discarded: HashSet::new(),
        }
    }

    fn emit(&mut self, parent: usize, data: FlowData, targets: &[NodeId]) {
        self.emissions.push(Emission {
            parent,
            data,
            targets: targets.to_vec(),
            trace_ids: None,
        });
    }
}

/// All contexts share one retry batch.
fn shared_batch(contexts: &[FlowContext]) -> Option<String> {
    let first = contexts.first()?.to_batch.clone()?;
    contexts
        .iter()
        .all(|c| c.to_batch.as_deref() == Some(first.as_str()))
        .then_some(first)
}

/// Spread async results over `n` contexts: one each, or one for all.
fn spread(deltas: Vec<Value>, n: usize) -> Result<Vec<Value>> {
    match deltas.len() {
        len if len == n => Ok(deltas),
        1 => Ok(vec![deltas.into_iter().next().unwrap_or(Value::Null); n]),
        len => Err(FlowError::Config(format!(
            "async result has {} entries for {} contexts",
            len, n
        ))),
    }
}

/// An executable flow: immutable topology plus the stores it runs against.
pub struct Flow {
    stream_id: String,
    name: String,
    nodes: Vec<FlowNode>,
    by_name: HashMap<String, NodeId>,
    start: NodeId,
    end: NodeId,
    store: FlowStore,
    on_success: Option<SuccessCallback>,
    on_error: Option<FlowErrorCallback>,
}

impl Flow {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream_id: String,
        name: String,
        nodes: Vec<FlowNode>,
        by_name: HashMap<String, NodeId>,
        start: NodeId,
        end: NodeId,
        store: FlowStore,
        on_success: Option<SuccessCallback>,
        on_error: Option<FlowErrorCallback>,
    ) -> Self {
        Self {
            stream_id,
            name,
            nodes,
            by_name,
            start,
            end,
            store,
            on_success,
            on_error,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> NodeId {
        self.start
    }

    pub fn end(&self) -> NodeId {
        self.end
    }

    pub fn store(&self) -> &FlowStore {
        &self.store
    }

    pub fn node(&self, id: NodeId) -> Option<&FlowNode> {
        self.nodes.get(id.0)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&FlowNode> {
        self.by_name.get(name).and_then(|id| self.node(*id))
    }

    /// The topology as a serializable definition.
    pub fn definition(&self) -> FlowDefinition {
        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                let mut def = NodeDefinition::new(&n.name, &n.label, n.kind.node_type());
                def.next = n
                    .successors()
                    .into_iter()
                    .map(|id| self.nodes[id.0].name.clone())
                    .collect();
                if let NodeKind::State(Operator::Jober(jober)) = &n.kind {
                    def.jober = Some(jober.spec().name.clone());
                }
                def
            })
            .collect();
        FlowDefinition::new(&self.stream_id, &self.name, nodes)
    }

    /// Offer data at the start node under a new trace.
    pub async fn offer(&self, data: Vec<FlowData>) -> Result<OfferReceipt> {
        let trace = FlowTrace::new(&self.stream_id);
        self.store.traces.save(trace.clone()).await?;

        let trace_ids: BTreeSet<String> = [trace.id.clone()].into_iter().collect();
        let start_name = &self.nodes[self.start.0].name;
        let contexts: Vec<FlowContext> = data
            .into_iter()
            .map(|d| FlowContext::new(&self.stream_id, start_name, d, trace_ids.clone()))
            .collect();
        self.record(&contexts).await?;

        let context_ids = contexts.iter().map(|c| c.id.clone()).collect();
        info!(
            stream_id = %self.stream_id,
            trace_id = %trace.id,
            contexts = contexts.len(),
            "Offered data to flow"
        );
        let dispatches = self.deliver(self.start, contexts).await?;
        Ok(OfferReceipt {
            trace_id: trace.id,
            context_ids,
            dispatches,
        })
    }

    /// Push READY contexts back through the nodes they sit at.
    pub async fn readmit(&self, contexts: Vec<FlowContext>) -> Result<Vec<DispatchToken>> {
        let mut by_node: BTreeMap<NodeId, Vec<FlowContext>> = BTreeMap::new();
        for ctx in contexts {
            if ctx.stream_id != self.stream_id {
                return Err(FlowError::Config(format!(
                    "context {} belongs to stream '{}', not '{}'",
                    ctx.id, ctx.stream_id, self.stream_id
                )));
            }
            let id = *self
                .by_name
                .get(&ctx.position)
                .ok_or_else(|| FlowError::NodeNotFound(ctx.position.clone()))?;
            by_node.entry(id).or_default().push(ctx);
        }

        let mut tokens = Vec::new();
        for (node, batch) in by_node {
            debug!(stream_id = %self.stream_id, node = %self.nodes[node.0].name, contexts = batch.len(), "Readmitting contexts");
            tokens.extend(self.deliver(node, batch).await?);
        }
        Ok(tokens)
    }

    /// Mark failed contexts RETRYABLE and make sure a retry record covers
    /// them. Returns the retry batch id.
    pub async fn mark_retryable(&self, contexts: Vec<FlowContext>) -> Result<String> {
        let Some(node) = contexts.first().map(|c| c.position.clone()) else {
            return Err(FlowError::Config("no contexts to mark retryable".into()));
        };
        self.retry_later(&node, contexts).await
    }

    /// Complete an async dispatch with one business-data delta per context,
    /// or a single delta for all of them, and continue downstream.
    pub async fn resume_async_job(
        &self,
        token: &DispatchToken,
        deltas: Vec<Value>,
    ) -> Result<Vec<DispatchToken>> {
        let (node, jober) = self.async_node(token)?;
        let guard = HeldLock::acquire(
            &*self.store.locks,
            &node_key(&self.stream_id, &node.name, LockPhase::Resume),
        )
        .await?;
        let contexts = self.dispatched(node, &token.batch).await?;

        let outputs: Result<Vec<FlowData>> = spread(deltas, contexts.len()).and_then(|deltas| {
            contexts
                .iter()
                .zip(deltas)
                .map(|(ctx, delta)| jober.complete(&ctx.data, delta, &token.batch))
                .collect()
        });
        let outputs = match outputs {
            Ok(outputs) => outputs,
            Err(e) => {
                let e = e.at_node(&node.name, jober.spec().error_code);
                self.fail_path(node, contexts, e).await?;
                return Ok(Vec::new());
            }
        };

        info!(stream_id = %self.stream_id, node = %node.name, batch = %token.batch, contexts = contexts.len(), "Async job resumed");
        self.publish(FlowEvent::AsyncResumed {
            stream_id: self.stream_id.clone(),
            node: node.name.clone(),
            batch: token.batch.clone(),
        });

        let children = self
            .advance(node, contexts, NodeOutcome::pass(outputs, &node.next))
            .await?;
        drop(guard);
        self.deliver_all(children).await
    }

    /// Report an async dispatch as failed; its contexts take the node's
    /// failure path.
    pub async fn fail_async_job(&self, token: &DispatchToken, err: FlowError) -> Result<()> {
        let (node, jober) = self.async_node(token)?;
        let _guard = HeldLock::acquire(
            &*self.store.locks,
            &node_key(&self.stream_id, &node.name, LockPhase::Resume),
        )
        .await?;
        let contexts = self.dispatched(node, &token.batch).await?;
        warn!(stream_id = %self.stream_id, node = %node.name, batch = %token.batch, error = %err, "Async job failed");
        let err = err.at_node(&node.name, jober.spec().error_code);
        self.fail_path(node, contexts, err).await
    }

    fn async_node(&self, token: &DispatchToken) -> Result<(&FlowNode, &Arc<JoberNode>)> {
        if token.stream_id != self.stream_id {
            return Err(FlowError::Config(format!(
                "dispatch token for stream '{}' offered to '{}'",
                token.stream_id, self.stream_id
            )));
        }
        let node = self
            .node_by_name(&token.node)
            .ok_or_else(|| FlowError::NodeNotFound(token.node.clone()))?;
        match &node.kind {
            NodeKind::State(Operator::Jober(jober)) if jober.is_async() => Ok((node, jober)),
            _ => Err(FlowError::Config(format!(
                "node '{}' is not an async jober",
                node.name
            ))),
        }
    }

    /// Contexts still in flight for `batch` at `node`, oldest first.
    async fn dispatched(&self, node: &FlowNode, batch: &str) -> Result<Vec<FlowContext>> {
        let mut contexts: Vec<FlowContext> = self
            .store
            .contexts
            .get_by_to_batch(vec![batch.to_string()])
            .await?
            .into_iter()
            .filter(|c| c.position == node.name && c.status == FlowNodeStatus::Processing)
            .collect();
        if contexts.is_empty() {
            return Err(FlowError::DispatchNotFound(batch.to_string()));
        }
        contexts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(contexts)
    }

    fn deliver_all(
        &self,
        children: BTreeMap<NodeId, Vec<FlowContext>>,
    ) -> BoxFuture<'_, Result<Vec<DispatchToken>>> {
        Box::pin(async move {
            let mut tokens = Vec::new();
            for (next, batch) in children {
                tokens.extend(self.deliver(next, batch).await?);
            }
            Ok(tokens)
        })
    }

    /// Run `contexts` through `node` and everything downstream of it.
    fn deliver(
        &self,
        node_id: NodeId,
        mut contexts: Vec<FlowContext>,
    ) -> BoxFuture<'_, Result<Vec<DispatchToken>>> {
        Box::pin(async move {
            if contexts.is_empty() {
                return Ok(Vec::new());
            }
            let node = &self.nodes[node_id.0];
            let jober = node_jober(node);

            let guard = match jober {
                Some(_) => Some(
                    HeldLock::acquire(
                        &*self.store.locks,
                        &node_key(&self.stream_id, &node.name, LockPhase::Admission),
                    )
                    .await?,
                ),
                None => None,
            };

            for ctx in contexts.iter_mut() {
                ctx.claim()?;
            }

            if let Some(jober) = jober.filter(|j| j.is_async()) {
                return self.dispatch_async(node, jober, contexts).await;
            }
            self.store.contexts.save(contexts.clone()).await?;

            let outcome = match jober {
                Some(jober) => {
                    let inputs = contexts.iter().map(|c| c.data.clone()).collect();
                    jober
                        .execute(inputs)
                        .await
                        .map(|outputs| NodeOutcome::pass(outputs, &node.next))
                }
                None => self.run(node, &contexts),
            };
            drop(guard);

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.fail_path(node, contexts, e).await?;
                    return Ok(Vec::new());
                }
            };
            let children = self.advance(node, contexts, outcome).await?;
            self.deliver_all(children).await
        })
    }

    async fn dispatch_async(
        &self,
        node: &FlowNode,
        jober: &JoberNode,
        mut contexts: Vec<FlowContext>,
    ) -> Result<Vec<DispatchToken>> {
        let batch = shared_batch(&contexts).unwrap_or_else(|| Uuid::new_v4().to_string());
        let prepared: Vec<FlowData> = contexts.iter().map(|c| jober.prepare(&c.data)).collect();
        for (ctx, data) in contexts.iter_mut().zip(&prepared) {
            ctx.to_batch = Some(batch.clone());
            ctx.data = data.clone();
        }
        // Persisted before dispatch so in-flight work survives a crash.
        self.store.contexts.save(contexts.clone()).await?;

        if let Err(e) = jober.dispatch(&batch, prepared).await {
            self.fail_path(node, contexts, e).await?;
            return Ok(Vec::new());
        }
        self.publish(FlowEvent::AsyncDispatched {
            stream_id: self.stream_id.clone(),
            node: node.name.clone(),
            batch: batch.clone(),
        });
        Ok(vec![DispatchToken {
            stream_id: self.stream_id.clone(),
            node: node.name.clone(),
            batch,
        }])
    }

    /// Operator work for every node kind except jobers.
    fn run(&self, node: &FlowNode, contexts: &[FlowContext]) -> Result<NodeOutcome> {
        let mut out = NodeOutcome::default();
        match &node.kind {
            NodeKind::Start => {
                for (i, ctx) in contexts.iter().enumerate() {
                    out.emit(i, ctx.data.clone(), &node.next);
                }
            }
            NodeKind::End => {}
            NodeKind::State(op) => self.run_operator(node, op, contexts, &mut out)?,
            NodeKind::Condition { routes, others } => {
                for (i, ctx) in contexts.iter().enumerate() {
                    let business = &ctx.data.business_data;
                    let target = routes
                        .iter()
                        .find(|r| (r.whether)(business))
                        .map(|r| r.target)
                        .or(*others);
                    match target {
                        Some(target) => out.emit(i, ctx.data.clone(), &[target]),
                        None => {
                            warn!(
                                stream_id = %self.stream_id,
                                node = %node.name,
                                context_id = %ctx.id,
                                "No branch matched and no others() branch, archiving context at condition"
                            );
                            out.discarded.insert(i);
                        }
                    }
                }
            }
            NodeKind::Parallel { branches, .. } => {
                for (i, ctx) in contexts.iter().enumerate() {
                    for (branch, target) in branches.iter().enumerate() {
                        let mut data = ctx.data.clone();
                        data.push_fork(ForkMarker {
                            fork: node.name.clone(),
                            origin: ctx.id.clone(),
                            branch,
                        });
                        out.emit(i, data, &[*target]);
                    }
                }
            }
            NodeKind::Join {
                fork,
                mode,
                branches,
                init,
                fold,
                tokens,
            } => {
                let fork_name = &self.nodes[fork.0].name;
                for (i, ctx) in contexts.iter().enumerate() {
                    let marker = ctx
                        .data
                        .fork()
                        .filter(|m| &m.fork == fork_name)
                        .ok_or_else(|| {
                            FlowError::Config(format!(
                                "context {} reached join '{}' without a fork marker of '{}'",
                                ctx.id, node.name, fork_name
                            ))
                        })?;
                    let outcome = tokens.join_arrival(
                        &marker.origin,
                        marker.branch,
                        *branches,
                        *mode,
                        &ctx.data.business_data,
                        &ctx.trace_ids,
                        init,
                        fold,
                    )?;
                    match outcome {
                        JoinOutcome::Emit { acc, trace_ids } => {
                            let mut data = ctx.data.with_business(acc);
                            data.pop_fork();
                            out.emissions.push(Emission {
                                parent: i,
                                data,
                                targets: node.next.clone(),
                                trace_ids: Some(trace_ids),
                            });
                        }
                        JoinOutcome::Pending => {}
                        JoinOutcome::Discard => {
                            out.discarded.insert(i);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn run_operator(
        &self,
        node: &FlowNode,
        op: &Operator,
        contexts: &[FlowContext],
        out: &mut NodeOutcome,
    ) -> Result<()> {
        let next = &node.next;
        match op {
            Operator::Just(f) => {
                for (i, ctx) in contexts.iter().enumerate() {
                    f(&ctx.data.business_data)?;
                    out.emit(i, ctx.data.clone(), next);
                }
            }
            Operator::Map(f) => {
                for (i, ctx) in contexts.iter().enumerate() {
                    let value = f(&ctx.data.business_data)?;
                    out.emit(i, ctx.data.with_business(value), next);
                }
            }
            Operator::FlatMap(f) => {
                for (i, ctx) in contexts.iter().enumerate() {
                    for value in f(&ctx.data.business_data)? {
                        out.emit(i, ctx.data.with_business(value), next);
                    }
                }
            }
            Operator::Process { f, state } => {
                let mut state = state
                    .lock()
                    .map_err(|_| FlowError::Lock(format!("process state of '{}' poisoned", node.name)))?;
                for (i, ctx) in contexts.iter().enumerate() {
                    let key = ctx.data.window_key().unwrap_or_default().to_string();
                    let slot = state.entry(key.clone()).or_insert_with(Map::new);
                    let mut scope = ProcessScope::new(&key, slot);
                    f(ctx, &mut scope)?;
                    for value in scope.into_emitted() {
                        out.emit(i, ctx.data.with_business(value), next);
                    }
                }
            }
            Operator::KeyBy(f) => {
                for (i, ctx) in contexts.iter().enumerate() {
                    let key = f(&ctx.data.business_data)?;
                    let mut data = ctx.data.clone();
                    data.set_window_key(key);
                    out.emit(i, data, next);
                }
            }
            Operator::Window(_) => {
                for (i, ctx) in contexts.iter().enumerate() {
                    out.emit(i, ctx.data.clone(), next);
                }
            }
            Operator::Reduce {
                init,
                fold,
                window: None,
            } => {
                let mut running: HashMap<String, Value> = HashMap::new();
                for (i, ctx) in contexts.iter().enumerate() {
                    let key = ctx.data.window_key().unwrap_or_default().to_string();
                    let acc = running.remove(&key).unwrap_or_else(|| init());
                    let acc = fold(acc, &ctx.data.business_data)?;
                    out.emit(i, ctx.data.with_business(acc.clone()), next);
                    running.insert(key, acc);
                }
            }
            Operator::Reduce {
                init,
                fold,
                window: Some((spec, tokens)),
            } => {
                for (i, ctx) in contexts.iter().enumerate() {
                    let key = ctx.data.window_key().unwrap_or_default();
                    let fulfilled = tokens.window_arrival(
                        key,
                        spec,
                        &ctx.data.business_data,
                        &ctx.trace_ids,
                        init,
                        fold,
                    )?;
                    if let Some((acc, trace_ids)) = fulfilled {
                        debug!(stream_id = %self.stream_id, node = %node.name, key = %key, "Window fulfilled");
                        out.emissions.push(Emission {
                            parent: i,
                            data: ctx.data.with_business(acc),
                            targets: next.clone(),
                            trace_ids: Some(trace_ids),
                        });
                    }
                }
            }
            Operator::Jober(jober) => {
                return Err(FlowError::Config(format!(
                    "jober '{}' cannot run as a plain operator",
                    jober.spec().name
                )))
            }
        }
        Ok(())
    }

    /// Record children, archive the inputs, and hand back the children
    /// grouped by the node they go to.
    async fn advance(
        &self,
        node: &FlowNode,
        mut contexts: Vec<FlowContext>,
        outcome: NodeOutcome,
    ) -> Result<BTreeMap<NodeId, Vec<FlowContext>>> {
        let mut children: BTreeMap<NodeId, Vec<FlowContext>> = BTreeMap::new();
        let mut created = Vec::new();
        for emission in outcome.emissions {
            let parent = &contexts[emission.parent];
            for target in emission.targets {
                let mut child = parent.generate(emission.data.clone(), &self.nodes[target.0].name);
                if let Some(trace_ids) = &emission.trace_ids {
                    child.trace_ids = trace_ids.clone();
                }
                created.push(child.clone());
                children.entry(target).or_default().push(child);
            }
        }
        self.record(&created).await?;

        for ctx in contexts.iter_mut() {
            ctx.transition(FlowNodeStatus::Archived)?;
        }
        self.store.contexts.save(contexts.clone()).await?;

        let batches: BTreeSet<String> = contexts.iter().filter_map(|c| c.to_batch.clone()).collect();
        if !batches.is_empty() {
            self.store.retries.delete(batches.into_iter().collect()).await?;
        }

        for (i, ctx) in contexts.iter().enumerate() {
            let event = if outcome.discarded.contains(&i) {
                FlowEvent::ContextDiscarded {
                    stream_id: self.stream_id.clone(),
                    node: node.name.clone(),
                    context_id: ctx.id.clone(),
                }
            } else {
                FlowEvent::ContextArchived {
                    stream_id: self.stream_id.clone(),
                    node: node.name.clone(),
                    context_id: ctx.id.clone(),
                }
            };
            self.publish(event);
        }

        if node.id == self.end {
            info!(stream_id = %self.stream_id, contexts = contexts.len(), "Contexts reached the end node");
            if let Some(cb) = &self.on_success {
                cb(&contexts);
            }
            self.publish(FlowEvent::FlowCompleted {
                stream_id: self.stream_id.clone(),
                contexts: contexts.len(),
            });
        }
        Ok(children)
    }

    /// Route a node failure: local handler first, otherwise the flow-level
    /// callback and a classification by error kind.
    async fn fail_path(&self, node: &FlowNode, contexts: Vec<FlowContext>, err: FlowError) -> Result<()> {
        error!(
            stream_id = %self.stream_id,
            node = %node.name,
            contexts = contexts.len(),
            error = %err,
            "Node failed"
        );
        self.publish(FlowEvent::NodeFailed {
            stream_id: self.stream_id.clone(),
            node: node.name.clone(),
            error: err.to_string(),
            contexts: contexts.len(),
        });

        let decision = match &node.on_error {
            Some(handler) => handler(&err, &contexts),
            None => {
                if let Some(cb) = &self.on_error {
                    cb(&err, &contexts);
                }
                if err.is_retryable() {
                    ErrorDecision::Retry
                } else {
                    ErrorDecision::Fail
                }
            }
        };

        match decision {
            ErrorDecision::Retry => self.retry_later(&node.name, contexts).await.map(|_| ()),
            ErrorDecision::Fail => self.fail_contexts(&node.name, contexts).await,
        }
    }

    async fn retry_later(&self, node: &str, mut contexts: Vec<FlowContext>) -> Result<String> {
        let batch = shared_batch(&contexts).unwrap_or_else(|| Uuid::new_v4().to_string());
        let existing = self.store.retries.find(batch.clone()).await?;
        let exhausted = match &existing {
            Some(record) => record.is_exhausted(),
            None => self.store.policy.max_retry == 0,
        };
        if exhausted {
            warn!(stream_id = %self.stream_id, node = %node, batch = %batch, "Retry budget exhausted");
            self.publish(FlowEvent::RetryExhausted { batch: batch.clone() });
            self.fail_contexts(node, contexts).await?;
            return Ok(batch);
        }

        for ctx in contexts.iter_mut() {
            ctx.to_batch = Some(batch.clone());
            ctx.transition(FlowNodeStatus::Retryable)?;
        }
        self.store.contexts.save(contexts).await?;

        if existing.is_none() {
            let record = FlowRetry::new(
                batch.clone(),
                self.store.policy.next_retry_time(Utc::now(), 0),
                self.store.policy.max_retry,
            );
            self.store.retries.save(record).await?;
        }
        info!(stream_id = %self.stream_id, node = %node, batch = %batch, "Contexts marked retryable");
        self.publish(FlowEvent::ContextsRetryable {
            stream_id: self.stream_id.clone(),
            node: node.to_string(),
            batch: batch.clone(),
        });
        Ok(batch)
    }

    async fn fail_contexts(&self, node: &str, mut contexts: Vec<FlowContext>) -> Result<()> {
        contexts.retain(|c| c.status != FlowNodeStatus::Error);
        if contexts.is_empty() {
            return Ok(());
        }
        for ctx in contexts.iter_mut() {
            ctx.transition(FlowNodeStatus::Error)?;
        }
        let count = contexts.len();
        let batches: BTreeSet<String> = contexts.iter().filter_map(|c| c.to_batch.clone()).collect();
        self.store.contexts.save(contexts).await?;
        self.close_retries(batches).await?;
        self.publish(FlowEvent::ContextsErrored {
            stream_id: self.stream_id.clone(),
            node: node.to_string(),
            contexts: count,
        });
        Ok(())
    }

    /// Drop the retry records of batches with nothing RETRYABLE left.
    async fn close_retries(&self, batches: BTreeSet<String>) -> Result<()> {
        if batches.is_empty() {
            return Ok(());
        }
        let live: BTreeSet<String> = self
            .store
            .contexts
            .get_by_to_batch(batches.iter().cloned().collect())
            .await?
            .into_iter()
            .filter(|c| c.status == FlowNodeStatus::Retryable)
            .filter_map(|c| c.to_batch)
            .collect();
        let closed: Vec<String> = batches.difference(&live).cloned().collect();
        if !closed.is_empty() {
            debug!(stream_id = %self.stream_id, batches = ?closed, "Closing retry records");
            self.store.retries.delete(closed).await?;
        }
        Ok(())
    }

    /// Persist new contexts and add them to the pools of their traces.
    async fn record(&self, contexts: &[FlowContext]) -> Result<()> {
        if contexts.is_empty() {
            return Ok(());
        }
        self.store.contexts.save(contexts.to_vec()).await?;

        let mut pools: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for ctx in contexts {
            for trace in &ctx.trace_ids {
                pools.entry(trace.as_str()).or_default().push(ctx.id.clone());
            }
        }
        for (trace, ids) in pools {
            self.store
                .traces
                .append_to_pool(vec![trace.to_string()], ids)
                .await?;
        }
        Ok(())
    }

    fn publish(&self, event: FlowEvent) {
        self.store.events.publish(event);
    }
}

fn node_jober(node: &FlowNode) -> Option<&JoberNode> {
    match &node.kind {
        NodeKind::State(Operator::Jober(jober)) => Some(jober.as_ref()),
        _ => None,
    }
}
