use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use waterflow_core::error::Result;
use waterflow_core::types::FlowContext;
use waterflow_jober::JoberNode;

use crate::window::{WindowSpec, WindowTokens};

pub type JustFn = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;
pub type MapFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;
pub type FlatMapFn = Arc<dyn Fn(&Value) -> Result<Vec<Value>> + Send + Sync>;
pub type KeyFn = Arc<dyn Fn(&Value) -> Result<String> + Send + Sync>;
pub type ProcessFn = Arc<dyn Fn(&FlowContext, &mut ProcessScope<'_>) -> Result<()> + Send + Sync>;
pub type InitFn = Arc<dyn Fn() -> Value + Send + Sync>;
pub type FoldFn = Arc<dyn Fn(Value, &Value) -> Result<Value> + Send + Sync>;

/// The work a state node performs on each arriving context.
pub enum Operator {
    /// Observe the payload and pass it on unchanged.
    Just(JustFn),
    Map(MapFn),
    /// One payload in, any number out.
    FlatMap(FlatMapFn),
    /// Full-context access with per-key state and explicit emission.
    Process {
        f: ProcessFn,
        state: Mutex<HashMap<String, Map<String, Value>>>,
    },
    /// Assign the aggregation key used by downstream reduces.
    KeyBy(KeyFn),
    /// Pass-through marker; the following reduce takes over its window.
    Window(WindowSpec),
    Reduce {
        init: InitFn,
        fold: FoldFn,
        window: Option<(WindowSpec, WindowTokens)>,
    },
    Jober(Arc<JoberNode>),
}

impl Operator {
    pub fn label(&self) -> &'static str {
        match self {
            Operator::Just(_) => "just",
            Operator::Map(_) => "map",
            Operator::FlatMap(_) => "flat_map",
            Operator::Process { .. } => "process",
            Operator::KeyBy(_) => "key_by",
            Operator::Window(_) => "window",
            Operator::Reduce { .. } => "reduce",
            Operator::Jober(_) => "jober",
        }
    }

    pub fn jober(&self) -> Option<&Arc<JoberNode>> {
        match self {
            Operator::Jober(node) => Some(node),
            _ => None,
        }
    }
}

/// Handle given to `process` operators.
///
/// State lives per aggregation key for the lifetime of the flow; emitted
/// values become the node's output, in order.
pub struct ProcessScope<'a> {
    key: &'a str,
    state: &'a mut Map<String, Value>,
    emitted: Vec<Value>,
}

impl<'a> ProcessScope<'a> {
    pub(crate) fn new(key: &'a str, state: &'a mut Map<String, Value>) -> Self {
        Self {
            key,
            state,
            emitted: Vec::new(),
        }
    }

    pub fn key(&self) -> &str {
        self.key
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.state.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.state.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.state.remove(name)
    }

    pub fn emit(&mut self, value: Value) {
        self.emitted.push(value);
    }

    pub(crate) fn into_emitted(self) -> Vec<Value> {
        self.emitted
    }
}
