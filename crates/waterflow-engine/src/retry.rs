use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use waterflow_core::config::RetryConfig;
use waterflow_core::error::{FlowError, Result};
use waterflow_core::event::FlowEvent;
use waterflow_core::lock::{node_key, retry_batch_key, HeldLock, LockPhase};
use waterflow_core::types::{FlowNodeStatus, FlowRetry};
use waterflow_graph::FlowStore;

use crate::registry::FlowRegistry;

/// What one retry cycle did, by batch id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryReport {
    /// Batches moved back to READY with their record advanced.
    pub retried: Vec<String>,
    /// Batches whose locks were held elsewhere, whose stream has no flow
    /// registered, or that had nothing left to move.
    pub skipped: Vec<String>,
    /// Batches that failed with an error this cycle.
    pub failed: Vec<String>,
}

enum BatchOutcome {
    Retried,
    Skipped,
}

/// Bounded, locked re-delivery of retryable batches.
pub struct RetryService {
    store: FlowStore,
    registry: Arc<FlowRegistry>,
    batch_limit: usize,
}

impl RetryService {
    pub fn new(store: FlowStore, registry: Arc<FlowRegistry>, batch_limit: usize) -> Self {
        Self {
            store,
            registry,
            batch_limit,
        }
    }

    /// Run one retry cycle over every due record.
    pub async fn retry_jober(&self) -> Result<RetryReport> {
        let due = self
            .store
            .retries
            .filter_by_next_retry_time(Utc::now(), self.batch_limit)
            .await?;
        debug!(due = due.len(), "Retry scan");

        let mut report = RetryReport::default();
        for record in due {
            let batch = record.entity_id.clone();
            match self.retry_batch(record).await {
                Ok(BatchOutcome::Retried) => report.retried.push(batch),
                Ok(BatchOutcome::Skipped) => report.skipped.push(batch),
                Err(e) => {
                    error!(batch = %batch, error = %e, "Retry attempt failed");
                    report.failed.push(batch);
                }
            }
        }
        if !report.retried.is_empty() || !report.failed.is_empty() {
            info!(
                retried = report.retried.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "Retry cycle finished"
            );
        }
        Ok(report)
    }

    async fn retry_batch(&self, record: FlowRetry) -> Result<BatchOutcome> {
        let batch = record.entity_id.clone();
        let locks = &*self.store.locks;

        let Some(batch_lock) = HeldLock::try_acquire(locks, &retry_batch_key(&batch))? else {
            debug!(batch = %batch, "Retry batch locked elsewhere, skipping");
            return Ok(BatchOutcome::Skipped);
        };

        let retryable: Vec<_> = self
            .store
            .contexts
            .get_by_to_batch(vec![batch.clone()])
            .await?
            .into_iter()
            .filter(|c| c.status == FlowNodeStatus::Retryable)
            .collect();
        let Some(first) = retryable.first() else {
            info!(batch = %batch, "No retryable contexts left in batch, closing retry record");
            self.store.retries.delete(vec![batch]).await?;
            return Ok(BatchOutcome::Skipped);
        };
        let stream_id = first.stream_id.clone();
        let position = first.position.clone();

        let Some(flow) = self.registry.get(&stream_id) else {
            warn!(
                stream_id = %stream_id,
                batch = %batch,
                "No flow registered for stream, deferring retry"
            );
            let deferred = FlowRetry {
                next_retry_time: self
                    .store
                    .policy
                    .next_retry_time(Utc::now(), record.retry_count + 1),
                ..record
            };
            self.store.retries.update_retry_record(deferred).await?;
            return Ok(BatchOutcome::Skipped);
        };

        let Some(node_lock) = HeldLock::try_acquire(
            locks,
            &node_key(&stream_id, &position, LockPhase::Admission),
        )?
        else {
            debug!(batch = %batch, node = %position, "Node busy, skipping retry");
            return Ok(BatchOutcome::Skipped);
        };

        let ids: Vec<String> = retryable.iter().map(|c| c.id.clone()).collect();
        let moved = self
            .store
            .contexts
            .update_status(ids.clone(), FlowNodeStatus::Ready, Some(FlowNodeStatus::Retryable))
            .await?;
        if moved == 0 {
            return Ok(BatchOutcome::Skipped);
        }

        let now = Utc::now();
        let attempt = record.retry_count + 1;
        let updated = FlowRetry {
            retry_count: attempt,
            last_retry_time: Some(now),
            next_retry_time: self.store.policy.next_retry_time(now, attempt),
            ..record
        };
        if !self.store.retries.update_retry_record(updated).await? {
            warn!(batch = %batch, "Retry record changed concurrently");
        }
        info!(
            stream_id = %stream_id,
            node = %position,
            batch = %batch,
            attempt,
            contexts = moved,
            "Retry batch requeued"
        );
        self.store.events.publish(FlowEvent::RetryAttempted {
            batch: batch.clone(),
            retry_count: attempt,
        });

        node_lock.release()?;
        batch_lock.release()?;

        let ready: Vec<_> = self
            .store
            .contexts
            .find_by_context_id_list(ids.clone())
            .await?
            .into_iter()
            .filter(|c| c.status == FlowNodeStatus::Ready)
            .collect();
        if let Err(e) = flow.readmit(ready).await {
            let reverted = self
                .store
                .contexts
                .update_status(ids, FlowNodeStatus::Retryable, Some(FlowNodeStatus::Ready))
                .await?;
            warn!(
                batch = %batch,
                contexts = reverted,
                error = %e,
                "Readmission failed, contexts returned to RETRYABLE"
            );
            return Err(e);
        }
        Ok(BatchOutcome::Retried)
    }
}

/// Drives `retry_jober` on a fixed interval or a cron schedule.
pub struct RetryScheduler {
    service: Arc<RetryService>,
    enabled: bool,
    interval: Duration,
    schedule: Option<Schedule>,
    cancel: CancellationToken,
}

impl RetryScheduler {
    pub fn new(
        config: &RetryConfig,
        service: Arc<RetryService>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let schedule = config
            .schedule
            .as_deref()
            .map(|expr| {
                Schedule::from_str(expr).map_err(|e| {
                    FlowError::Config(format!("invalid retry schedule '{}': {}", expr, e))
                })
            })
            .transpose()?;

        Ok(Self {
            service,
            enabled: config.enabled,
            interval: Duration::from_secs(config.scan_interval_secs.max(1)),
            schedule,
            cancel,
        })
    }

    fn next_delay(&self) -> Duration {
        match &self.schedule {
            Some(schedule) => schedule
                .upcoming(Utc)
                .next()
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .unwrap_or(self.interval),
            None => self.interval,
        }
    }

    /// Run the retry loop. Blocks until cancelled.
    pub async fn run(&self) {
        if !self.enabled {
            info!("Retry subsystem disabled, scheduler idle");
            self.cancel.cancelled().await;
            return;
        }

        info!(
            interval_secs = self.interval.as_secs(),
            cron = self.schedule.is_some(),
            "Retry scheduler started"
        );

        loop {
            let delay = self.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.service.retry_jober().await {
                        error!(error = %e, "Retry cycle failed");
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("Retry scheduler shutting down");
                    break;
                }
            }
        }
    }
}
