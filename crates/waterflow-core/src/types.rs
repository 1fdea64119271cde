use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{FlowError, Result};

/// Engine-internal key holding the aggregation key assigned by `key_by`.
pub const KEY_WINDOW: &str = "_window_key";
/// Engine-internal stack of fork markers set by parallel nodes.
pub const KEY_FORK: &str = "_forks";
/// Engine-internal key recording which business fields a converter produced.
pub const KEY_CONVERTED: &str = "_converted_fields";
/// Business key stamped on contexts resumed from an async jober.
pub const KEY_ASYNC_TASK: &str = "_async_task_id";

/// Status of one execution context at its current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowNodeStatus {
    New,
    Ready,
    Processing,
    Archived,
    Error,
    Retryable,
}

impl FlowNodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Ready => "READY",
            Self::Processing => "PROCESSING",
            Self::Archived => "ARCHIVED",
            Self::Error => "ERROR",
            Self::Retryable => "RETRYABLE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Archived | Self::Error)
    }

    /// Legal edges of the context status machine.
    ///
    /// ERROR only leaves through RETRYABLE, and only when a caller
    /// resubmits the batch.
    pub fn can_transition_to(&self, next: FlowNodeStatus) -> bool {
        use FlowNodeStatus::*;
        matches!(
            (self, next),
            (New, Ready)
                | (New, Processing)
                | (Ready, Processing)
                | (Processing, Archived)
                | (Processing, Error)
                | (Processing, Retryable)
                | (Retryable, Ready)
                | (Retryable, Error)
                | (Error, Retryable)
        )
    }
}

impl fmt::Display for FlowNodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowNodeStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(Self::New),
            "READY" => Ok(Self::Ready),
            "PROCESSING" => Ok(Self::Processing),
            "ARCHIVED" => Ok(Self::Archived),
            "ERROR" => Ok(Self::Error),
            "RETRYABLE" => Ok(Self::Retryable),
            other => Err(FlowError::Config(format!("unknown context status: {other}"))),
        }
    }
}

/// Where a forked context came from: the parallel node, the context that
/// entered it, and the branch taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkMarker {
    pub fork: String,
    pub origin: String,
    pub branch: usize,
}

/// Payload carried by a context.
///
/// `business_data` is what operators and jobers see. `pass_data` travels
/// untouched alongside it, `context_data` is reserved for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowData {
    #[serde(default = "empty_object")]
    pub business_data: Value,
    #[serde(default)]
    pub pass_data: Map<String, Value>,
    #[serde(default)]
    pub context_data: Map<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Default for FlowData {
    fn default() -> Self {
        Self::new(empty_object())
    }
}

impl FlowData {
    pub fn new(business_data: Value) -> Self {
        Self {
            business_data,
            pass_data: Map::new(),
            context_data: Map::new(),
        }
    }

    /// Same pass-through and engine fields, different business payload.
    pub fn with_business(&self, business_data: Value) -> Self {
        Self {
            business_data,
            pass_data: self.pass_data.clone(),
            context_data: self.context_data.clone(),
        }
    }

    /// Merge top-level keys of `delta` into the business payload.
    ///
    /// A non-object payload is replaced by an object first.
    pub fn merge_business(&mut self, delta: &Map<String, Value>) {
        if !self.business_data.is_object() {
            self.business_data = empty_object();
        }
        if let Value::Object(obj) = &mut self.business_data {
            for (k, v) in delta {
                obj.insert(k.clone(), v.clone());
            }
        }
    }

    pub fn business_field(&self, key: &str) -> Option<&Value> {
        self.business_data.get(key)
    }

    pub fn window_key(&self) -> Option<&str> {
        self.context_data.get(KEY_WINDOW).and_then(|v| v.as_str())
    }

    pub fn set_window_key(&mut self, key: impl Into<String>) {
        self.context_data
            .insert(KEY_WINDOW.to_string(), Value::String(key.into()));
    }

    /// Innermost fork marker when the context travels a forked branch.
    pub fn fork(&self) -> Option<ForkMarker> {
        let top = self.context_data.get(KEY_FORK)?.as_array()?.last()?;
        serde_json::from_value(top.clone()).ok()
    }

    /// Enter a forked branch. Markers nest for parallels inside parallels.
    pub fn push_fork(&mut self, marker: ForkMarker) {
        let entry = serde_json::json!({
            "fork": marker.fork,
            "origin": marker.origin,
            "branch": marker.branch,
        });
        match self.context_data.get_mut(KEY_FORK) {
            Some(Value::Array(stack)) => stack.push(entry),
            _ => {
                self.context_data
                    .insert(KEY_FORK.to_string(), Value::Array(vec![entry]));
            }
        }
    }

    /// Leave the innermost forked branch.
    pub fn pop_fork(&mut self) {
        let empty = match self.context_data.get_mut(KEY_FORK) {
            Some(Value::Array(stack)) => {
                stack.pop();
                stack.is_empty()
            }
            _ => true,
        };
        if empty {
            self.context_data.remove(KEY_FORK);
        }
    }
}

/// One payload's presence at one node of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowContext {
    pub id: String,
    pub root_id: String,
    #[serde(default)]
    pub previous: Option<String>,
    pub stream_id: String,
    pub position: String,
    #[serde(default)]
    pub trace_ids: BTreeSet<String>,
    pub status: FlowNodeStatus,
    #[serde(default)]
    pub to_batch: Option<String>,
    pub data: FlowData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl FlowContext {
    /// A fresh root context, as offered at a start node.
    pub fn new(
        stream_id: impl Into<String>,
        position: impl Into<String>,
        data: FlowData,
        trace_ids: BTreeSet<String>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            root_id: id.clone(),
            id,
            previous: None,
            stream_id: stream_id.into(),
            position: position.into(),
            trace_ids,
            status: FlowNodeStatus::New,
            to_batch: None,
            data,
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    /// The context this one produces at `position`, chained via `previous`.
    pub fn generate(&self, data: FlowData, position: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            root_id: self.root_id.clone(),
            previous: Some(self.id.clone()),
            stream_id: self.stream_id.clone(),
            position: position.into(),
            trace_ids: self.trace_ids.clone(),
            status: FlowNodeStatus::New,
            to_batch: None,
            data,
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    /// Move to `to`, rejecting edges the status machine does not allow.
    pub fn transition(&mut self, to: FlowNodeStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(FlowError::InvalidTransition {
                context: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        if to == FlowNodeStatus::Archived {
            self.archived_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Claim for processing: NEW/READY -> PROCESSING.
    pub fn claim(&mut self) -> Result<()> {
        if self.status == FlowNodeStatus::New {
            self.transition(FlowNodeStatus::Ready)?;
        }
        self.transition(FlowNodeStatus::Processing)
    }
}

/// Contexts produced by one top-level invocation of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTrace {
    pub id: String,
    pub stream_id: String,
    #[serde(default)]
    pub context_pool: BTreeSet<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl FlowTrace {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            stream_id: stream_id.into(),
            context_pool: BTreeSet::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// Retry bookkeeping for one retryable batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRetry {
    /// The `to_batch` id shared by the retried contexts.
    pub entity_id: String,
    pub entity_type: String,
    pub next_retry_time: DateTime<Utc>,
    #[serde(default)]
    pub last_retry_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retry: u32,
    #[serde(default)]
    pub version: u32,
}

pub const RETRY_ENTITY_CONTEXT: &str = "CONTEXT";

impl FlowRetry {
    pub fn new(batch: impl Into<String>, next_retry_time: DateTime<Utc>, max_retry: u32) -> Self {
        Self {
            entity_id: batch.into(),
            entity_type: RETRY_ENTITY_CONTEXT.to_string(),
            next_retry_time,
            last_retry_time: None,
            retry_count: 0,
            max_retry,
            version: 0,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retry
    }
}
