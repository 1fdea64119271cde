use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::definition::FlowDefinition;
use crate::error::Result;
use crate::types::*;

/// Context repository: persistence of execution contexts.
pub trait ContextRepository: Send + Sync + 'static {
    /// Insert or replace contexts by id.
    fn save(&self, contexts: Vec<FlowContext>) -> BoxFuture<'_, Result<()>>;

    /// Set `status` on the given contexts.
    ///
    /// With `only_if`, rows not currently in that status are left alone;
    /// the check and the write form one atomic step. Returns the number
    /// of rows updated.
    fn update_status(
        &self,
        ids: Vec<String>,
        status: FlowNodeStatus,
        only_if: Option<FlowNodeStatus>,
    ) -> BoxFuture<'_, Result<usize>>;

    /// Replace the payload of the given contexts.
    fn update_flow_data(&self, updates: Vec<(String, FlowData)>) -> BoxFuture<'_, Result<()>>;

    /// All contexts belonging to any of the given retry batches.
    fn get_by_to_batch(&self, batches: Vec<String>) -> BoxFuture<'_, Result<Vec<FlowContext>>>;

    fn find_by_context_id_list(&self, ids: Vec<String>) -> BoxFuture<'_, Result<Vec<FlowContext>>>;
}

/// Trace repository: context pools per top-level invocation.
pub trait TraceRepository: Send + Sync + 'static {
    fn save(&self, trace: FlowTrace) -> BoxFuture<'_, Result<()>>;

    fn find_trace_by_id_list(&self, ids: Vec<String>) -> BoxFuture<'_, Result<Vec<FlowTrace>>>;

    /// Record `context_ids` in the pool of every listed trace.
    fn append_to_pool(
        &self,
        trace_ids: Vec<String>,
        context_ids: Vec<String>,
    ) -> BoxFuture<'_, Result<()>>;
}

/// Retry repository: one record per retryable batch.
pub trait RetryRepository: Send + Sync + 'static {
    /// Insert or replace a record keyed by `entity_id`.
    fn save(&self, retry: FlowRetry) -> BoxFuture<'_, Result<()>>;

    fn find(&self, entity_id: String) -> BoxFuture<'_, Result<Option<FlowRetry>>>;

    /// Records due at `now` that still have attempts left, oldest first.
    fn filter_by_next_retry_time(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<FlowRetry>>>;

    /// Optimistic update: applies only when the stored version equals
    /// `retry.version`, then bumps it. Returns whether the row changed.
    fn update_retry_record(&self, retry: FlowRetry) -> BoxFuture<'_, Result<bool>>;

    fn delete(&self, entity_ids: Vec<String>) -> BoxFuture<'_, Result<()>>;
}

/// Flow definition repository: immutable topologies by stream id.
pub trait DefinitionRepository: Send + Sync + 'static {
    fn save(&self, definition: FlowDefinition) -> BoxFuture<'_, Result<()>>;

    fn find_by_stream_id(&self, stream_id: String) -> BoxFuture<'_, Result<Option<FlowDefinition>>>;
}

/// A named mutual-exclusion handle.
pub trait FlowLock: Send + Sync {
    /// Acquire without waiting. `Ok(false)` means another owner holds it.
    fn try_lock(&self) -> Result<bool>;

    /// Wait until the lock is acquired.
    fn lock(&self) -> BoxFuture<'_, Result<()>>;

    fn unlock(&self) -> Result<()>;
}

/// Lock provider: deterministic keys to shared locks.
pub trait LockProvider: Send + Sync + 'static {
    fn distributed_lock(&self, key: &str) -> Arc<dyn FlowLock>;
}

/// Transport: invocation of remote task implementations by id.
pub trait Transport: Send + Sync + 'static {
    /// Call `target` and wait for its result.
    fn invoke(
        &self,
        target: String,
        args: Vec<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Fire-and-forget submission. The default waits for `invoke` and drops the result.
    fn submit(
        &self,
        target: String,
        args: Vec<serde_json::Value>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.invoke(target, args, None).await?;
            Ok(())
        })
    }
}
