use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use waterflow_core::definition::FlowDefinition;
use waterflow_core::error::{FlowError, Result};
use waterflow_core::traits::{
    ContextRepository, DefinitionRepository, RetryRepository, TraceRepository,
};
use waterflow_core::types::{FlowContext, FlowData, FlowNodeStatus, FlowRetry, FlowTrace};

#[derive(Default)]
struct State {
    contexts: HashMap<String, FlowContext>,
    traces: HashMap<String, FlowTrace>,
    retries: HashMap<String, FlowRetry>,
    definitions: HashMap<String, FlowDefinition>,
}

/// Process-local implementation of every repository contract.
///
/// All reads and writes go through one mutex, so conditional updates are
/// atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))
    }

    /// Every stored context, oldest first.
    pub fn all_contexts(&self) -> Result<Vec<FlowContext>> {
        let state = self.state()?;
        let mut out: Vec<FlowContext> = state.contexts.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Stored contexts sitting at `position`, oldest first.
    pub fn contexts_at(&self, position: &str) -> Result<Vec<FlowContext>> {
        Ok(self
            .all_contexts()?
            .into_iter()
            .filter(|c| c.position == position)
            .collect())
    }
}

impl ContextRepository for MemoryStore {
    fn save(&self, contexts: Vec<FlowContext>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state()?;
            for ctx in contexts {
                state.contexts.insert(ctx.id.clone(), ctx);
            }
            Ok(())
        })
    }

    fn update_status(
        &self,
        ids: Vec<String>,
        status: FlowNodeStatus,
        only_if: Option<FlowNodeStatus>,
    ) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let mut state = self.state()?;
            let now = Utc::now();
            let mut updated = 0;
            for id in &ids {
                let Some(ctx) = state.contexts.get_mut(id) else {
                    continue;
                };
                if only_if.is_some_and(|expected| ctx.status != expected) {
                    continue;
                }
                ctx.status = status;
                ctx.updated_at = now;
                if status == FlowNodeStatus::Archived {
                    ctx.archived_at = Some(now);
                }
                updated += 1;
            }
            Ok(updated)
        })
    }

    fn update_flow_data(&self, updates: Vec<(String, FlowData)>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state()?;
            for (id, data) in updates {
                if let Some(ctx) = state.contexts.get_mut(&id) {
                    ctx.data = data;
                    ctx.updated_at = Utc::now();
                }
            }
            Ok(())
        })
    }

    fn get_by_to_batch(&self, batches: Vec<String>) -> BoxFuture<'_, Result<Vec<FlowContext>>> {
        Box::pin(async move {
            let state = self.state()?;
            let mut out: Vec<FlowContext> = state
                .contexts
                .values()
                .filter(|c| c.to_batch.as_ref().is_some_and(|b| batches.contains(b)))
                .cloned()
                .collect();
            out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            Ok(out)
        })
    }

    fn find_by_context_id_list(&self, ids: Vec<String>) -> BoxFuture<'_, Result<Vec<FlowContext>>> {
        Box::pin(async move {
            let state = self.state()?;
            Ok(ids
                .iter()
                .filter_map(|id| state.contexts.get(id).cloned())
                .collect())
        })
    }
}

impl TraceRepository for MemoryStore {
    fn save(&self, trace: FlowTrace) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.state()?.traces.insert(trace.id.clone(), trace);
            Ok(())
        })
    }

    fn find_trace_by_id_list(&self, ids: Vec<String>) -> BoxFuture<'_, Result<Vec<FlowTrace>>> {
        Box::pin(async move {
            let state = self.state()?;
            Ok(ids
                .iter()
                .filter_map(|id| state.traces.get(id).cloned())
                .collect())
        })
    }

    fn append_to_pool(
        &self,
        trace_ids: Vec<String>,
        context_ids: Vec<String>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state()?;
            for trace_id in &trace_ids {
                let trace = state
                    .traces
                    .get_mut(trace_id)
                    .ok_or_else(|| FlowError::TraceNotFound(trace_id.clone()))?;
                trace.context_pool.extend(context_ids.iter().cloned());
            }
            Ok(())
        })
    }
}

impl RetryRepository for MemoryStore {
    fn save(&self, retry: FlowRetry) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.state()?.retries.insert(retry.entity_id.clone(), retry);
            Ok(())
        })
    }

    fn find(&self, entity_id: String) -> BoxFuture<'_, Result<Option<FlowRetry>>> {
        Box::pin(async move { Ok(self.state()?.retries.get(&entity_id).cloned()) })
    }

    fn filter_by_next_retry_time(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<FlowRetry>>> {
        Box::pin(async move {
            let state = self.state()?;
            let mut due: Vec<FlowRetry> = state
                .retries
                .values()
                .filter(|r| r.next_retry_time <= now && !r.is_exhausted())
                .cloned()
                .collect();
            due.sort_by(|a, b| {
                a.next_retry_time
                    .cmp(&b.next_retry_time)
                    .then_with(|| a.entity_id.cmp(&b.entity_id))
            });
            due.truncate(limit);
            Ok(due)
        })
    }

    fn update_retry_record(&self, retry: FlowRetry) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let mut state = self.state()?;
            match state.retries.get_mut(&retry.entity_id) {
                Some(stored) if stored.version == retry.version => {
                    *stored = FlowRetry {
                        version: retry.version + 1,
                        ..retry
                    };
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn delete(&self, entity_ids: Vec<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state()?;
            for id in &entity_ids {
                state.retries.remove(id);
            }
            Ok(())
        })
    }
}

impl DefinitionRepository for MemoryStore {
    fn save(&self, definition: FlowDefinition) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.state()?
                .definitions
                .insert(definition.stream_id.clone(), definition);
            Ok(())
        })
    }

    fn find_by_stream_id(&self, stream_id: String) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        Box::pin(async move { Ok(self.state()?.definitions.get(&stream_id).cloned()) })
    }
}
