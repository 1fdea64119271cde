use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use waterflow_core::error::{FlowError, Result};

use crate::operator::{FoldFn, InitFn};

/// How a join decides that its parallel branches are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Wait for every branch.
    #[default]
    All,
    /// Emit on the first branch, discard the rest.
    Either,
}

pub type WindowPredicate = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;

/// Fulfillment rule of a window, evaluated on the payloads that have
/// arrived for one key.
#[derive(Clone)]
pub struct WindowSpec {
    predicate: WindowPredicate,
}

impl WindowSpec {
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&[Value]) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Fulfilled once `n` payloads have arrived.
    pub fn count(n: usize) -> Self {
        Self::when(move |arrived| arrived.len() >= n)
    }

    pub fn is_fulfilled(&self, arrived: &[Value]) -> bool {
        (self.predicate)(arrived)
    }
}

impl fmt::Debug for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WindowSpec")
    }
}

/// Aggregation state for one key at one fan-in point.
#[derive(Debug)]
pub struct WindowToken {
    /// Join branches that have not reported yet.
    todo: BTreeSet<usize>,
    arrived: Vec<Value>,
    acc: Value,
    trace_ids: BTreeSet<String>,
    emitted: bool,
}

impl WindowToken {
    fn new(acc: Value, branches: usize) -> Self {
        Self {
            todo: (0..branches).collect(),
            arrived: Vec::new(),
            acc,
            trace_ids: BTreeSet::new(),
            emitted: false,
        }
    }
}

/// What a join arrival produced.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// The window is fulfilled: the aggregate and the traces it covers.
    Emit {
        acc: Value,
        trace_ids: BTreeSet<String>,
    },
    /// Still waiting for other branches.
    Pending,
    /// An EITHER join already emitted for this key.
    Discard,
}

/// Live window tokens of one fan-in point, keyed by aggregation key.
///
/// Every arrival runs as one critical section: remove from to-do,
/// accumulate, check fulfillment, clear the token.
#[derive(Debug, Default)]
pub struct WindowTokens {
    tokens: Mutex<HashMap<String, WindowToken>>,
}

impl WindowTokens {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, WindowToken>>> {
        self.tokens
            .lock()
            .map_err(|_| FlowError::Lock("window token state poisoned".into()))
    }

    /// Number of tokens awaiting fulfillment.
    pub fn len(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record branch `branch` of a parallel with `branches` branches
    /// arriving at a join.
    #[allow(clippy::too_many_arguments)]
    pub fn join_arrival(
        &self,
        key: &str,
        branch: usize,
        branches: usize,
        mode: JoinMode,
        payload: &Value,
        trace_ids: &BTreeSet<String>,
        init: &InitFn,
        fold: &FoldFn,
    ) -> Result<JoinOutcome> {
        let mut tokens = self.guard()?;
        let token = tokens
            .entry(key.to_string())
            .or_insert_with(|| WindowToken::new(init(), branches));

        if !token.todo.remove(&branch) {
            return Err(FlowError::Config(format!(
                "branch {} reported twice to join window '{}'",
                branch, key
            )));
        }
        let remaining = token.todo.len();

        let outcome = match mode {
            JoinMode::All => {
                let acc = std::mem::take(&mut token.acc);
                token.acc = fold(acc, payload)?;
                token.trace_ids.extend(trace_ids.iter().cloned());
                if remaining == 0 {
                    JoinOutcome::Emit {
                        acc: std::mem::take(&mut token.acc),
                        trace_ids: std::mem::take(&mut token.trace_ids),
                    }
                } else {
                    JoinOutcome::Pending
                }
            }
            JoinMode::Either if token.emitted => JoinOutcome::Discard,
            JoinMode::Either => {
                token.emitted = true;
                let acc = std::mem::take(&mut token.acc);
                JoinOutcome::Emit {
                    acc: fold(acc, payload)?,
                    trace_ids: trace_ids.clone(),
                }
            }
        };

        if remaining == 0 {
            tokens.remove(key);
        }
        Ok(outcome)
    }

    /// Fold `payload` into the window for `key`. Returns the aggregate once
    /// the window is fulfilled, at which point the token is gone.
    pub fn window_arrival(
        &self,
        key: &str,
        spec: &WindowSpec,
        payload: &Value,
        trace_ids: &BTreeSet<String>,
        init: &InitFn,
        fold: &FoldFn,
    ) -> Result<Option<(Value, BTreeSet<String>)>> {
        let mut tokens = self.guard()?;
        let token = tokens
            .entry(key.to_string())
            .or_insert_with(|| WindowToken::new(init(), 0));

        let acc = std::mem::take(&mut token.acc);
        token.acc = fold(acc, payload)?;
        token.arrived.push(payload.clone());
        token.trace_ids.extend(trace_ids.iter().cloned());

        if !spec.is_fulfilled(&token.arrived) {
            return Ok(None);
        }
        Ok(tokens.remove(key).map(|t| (t.acc, t.trace_ids)))
    }
}
