use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use waterflow_core::config::RetryConfig;
use waterflow_core::event::{EventBus, FlowEvent};
use waterflow_core::lock::{node_key, retry_batch_key, HeldLock, LockPhase};
use waterflow_core::policy::RetryPolicy;
use waterflow_core::traits::{ContextRepository, FlowLock, LockProvider, RetryRepository};
use waterflow_core::types::{FlowData, FlowNodeStatus, FlowRetry};
use waterflow_engine::{FlowRegistry, RetryScheduler, RetryService};
use waterflow_graph::{Flow, FlowBuilder, FlowStore};
use waterflow_jober::{JoberKind, JoberSpec, RpcJober};
use waterflow_test_utils::{context_at, MockTransport, TestStores};

fn flow_store(stores: &TestStores, max_retry: u32) -> FlowStore {
    FlowStore {
        contexts: stores.memory.clone(),
        traces: stores.memory.clone(),
        retries: stores.memory.clone(),
        locks: stores.locks.clone(),
        events: Arc::new(EventBus::default()),
        policy: RetryPolicy {
            max_retry,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            jitter: false,
        },
    }
}

/// Two RETRYABLE contexts at `state1` of stream `s1` in batch `b1`.
async fn seed_batch(stores: &TestStores, max_retry: u32) -> Vec<String> {
    let mut contexts = vec![
        context_at("s1", "state1", FlowNodeStatus::Retryable),
        context_at("s1", "state1", FlowNodeStatus::Retryable),
    ];
    for ctx in contexts.iter_mut() {
        ctx.to_batch = Some("b1".into());
    }
    let ids = contexts.iter().map(|c| c.id.clone()).collect();
    ContextRepository::save(&*stores.memory, contexts).await.unwrap();

    let due = Utc::now() - chrono::Duration::seconds(1);
    RetryRepository::save(&*stores.memory, FlowRetry::new("b1", due, max_retry))
        .await
        .unwrap();
    ids
}

fn service(stores: &TestStores, store: FlowStore) -> (RetryService, Arc<FlowRegistry>) {
    let registry = Arc::new(FlowRegistry::new(stores.memory.clone()));
    (RetryService::new(store, registry.clone(), 100), registry)
}

/// Register stream `s1` as `start1 -> <node> -> ender1`.
async fn register_s1(registry: &FlowRegistry, store: FlowStore, node: &str) -> Arc<Flow> {
    let mut b = FlowBuilder::new("s1", "s1");
    let start = b.start("start1").unwrap();
    b.map(start, node, |v| Ok(v.clone())).unwrap();
    registry.register(b.close("ender1", store).unwrap()).await.unwrap()
}

#[tokio::test]
async fn test_retry_readmits_batch_at_its_node() {
    let stores = TestStores::new();
    let ids = seed_batch(&stores, 1).await;
    let store = flow_store(&stores, 1);
    let (service, registry) = service(&stores, store.clone());
    register_s1(&registry, store.clone(), "state1").await;
    let mut rx = store.events.subscribe();

    let report = service.retry_jober().await.unwrap();
    assert_eq!(report.retried, vec!["b1"]);

    let mut attempted = None;
    while let Ok(ev) = rx.try_recv() {
        if let FlowEvent::RetryAttempted { batch, retry_count } = ev {
            attempted = Some((batch, retry_count));
        }
    }
    assert_eq!(attempted, Some(("b1".to_string(), 1)));

    let contexts = stores.memory.find_by_context_id_list(ids).await.unwrap();
    assert_eq!(contexts.len(), 2);
    assert!(contexts
        .iter()
        .all(|c| c.status == FlowNodeStatus::Archived && c.position == "state1"));
    assert_eq!(stores.memory.contexts_at("ender1").unwrap().len(), 2);
    // the batch went through, so its record is gone
    assert!(stores.memory.find("b1".into()).await.unwrap().is_none());

    // both locks were released after the attempt
    for key in [
        retry_batch_key("b1"),
        node_key("s1", "state1", LockPhase::Admission),
    ] {
        let lock = stores.locks.distributed_lock(&key);
        assert!(lock.try_lock().unwrap());
        lock.unlock().unwrap();
    }

    let again = service.retry_jober().await.unwrap();
    assert!(again.retried.is_empty() && again.skipped.is_empty());
}

#[tokio::test]
async fn test_retry_advances_record_before_redispatch() {
    let stores = TestStores::new();
    let ids = seed_batch(&stores, 1).await;
    let store = flow_store(&stores, 1);
    let (service, registry) = service(&stores, store.clone());
    let transport = Arc::new(MockTransport::new());

    let mut b = FlowBuilder::new("s1", "s1");
    let start = b.start("start1").unwrap();
    b.jober(
        start,
        "state1",
        JoberSpec::new("remote", JoberKind::Rpc)
            .with_fitables(vec!["svc".into()])
            .asynchronous(),
        Arc::new(RpcJober::new(transport.clone())),
    )
    .unwrap();
    registry.register(b.close("ender1", store).unwrap()).await.unwrap();

    let report = service.retry_jober().await.unwrap();
    assert_eq!(report.retried, vec!["b1"]);

    let record = stores.memory.find("b1".into()).await.unwrap().unwrap();
    assert_eq!(record.retry_count, 1);
    assert!(record.last_retry_time.is_some());

    // READY contexts were claimed again by the async node, same batch
    let contexts = stores.memory.find_by_context_id_list(ids).await.unwrap();
    assert!(contexts.iter().all(|c| c.status == FlowNodeStatus::Processing
        && c.position == "state1"
        && c.to_batch.as_deref() == Some("b1")));
    assert_eq!(transport.submissions().len(), 1);
}

#[tokio::test]
async fn test_unregistered_stream_leaves_batch_retryable() {
    let stores = TestStores::new();
    let ids = seed_batch(&stores, 3).await;
    let (service, _) = service(&stores, flow_store(&stores, 3));

    let report = service.retry_jober().await.unwrap();
    assert_eq!(report.skipped, vec!["b1"]);
    assert!(report.retried.is_empty());

    let contexts = stores.memory.find_by_context_id_list(ids).await.unwrap();
    assert!(contexts.iter().all(|c| c.status == FlowNodeStatus::Retryable));
    let record = stores.memory.find("b1".into()).await.unwrap().unwrap();
    assert_eq!(record.retry_count, 0);
    assert!(record.last_retry_time.is_none());

    // once the flow shows up the batch is picked up again
    let store = flow_store(&stores, 3);
    let registry = Arc::new(FlowRegistry::new(stores.memory.clone()));
    register_s1(&registry, store.clone(), "state1").await;
    let report = RetryService::new(store, registry, 100)
        .retry_jober()
        .await
        .unwrap();
    assert_eq!(report.retried, vec!["b1"]);
}

#[tokio::test]
async fn test_failed_readmission_returns_contexts_to_retryable() {
    let stores = TestStores::new();
    let ids = seed_batch(&stores, 3).await;
    let store = flow_store(&stores, 3);
    let (service, registry) = service(&stores, store.clone());
    // the flow has no `state1`, so readmission cannot place the contexts
    register_s1(&registry, store, "state2").await;

    let report = service.retry_jober().await.unwrap();
    assert_eq!(report.failed, vec!["b1"]);

    let contexts = stores.memory.find_by_context_id_list(ids).await.unwrap();
    assert_eq!(contexts.len(), 2);
    assert!(contexts.iter().all(|c| c.status == FlowNodeStatus::Retryable));
    let record = stores.memory.find("b1".into()).await.unwrap().unwrap();
    assert_eq!(record.retry_count, 1);
}

#[tokio::test]
async fn test_batch_without_retryable_contexts_closes_record() {
    let stores = TestStores::new();
    let due = Utc::now() - chrono::Duration::seconds(5);
    RetryRepository::save(&*stores.memory, FlowRetry::new("gone", due, 3))
        .await
        .unwrap();
    seed_batch(&stores, 3).await;
    let store = flow_store(&stores, 3);
    let registry = Arc::new(FlowRegistry::new(stores.memory.clone()));
    register_s1(&registry, store.clone(), "state1").await;
    let service = RetryService::new(store, registry, 1);

    let report = service.retry_jober().await.unwrap();
    assert_eq!(report.skipped, vec!["gone"]);
    assert!(stores.memory.find("gone".into()).await.unwrap().is_none());

    let report = service.retry_jober().await.unwrap();
    assert_eq!(report.retried, vec!["b1"]);
}

#[tokio::test]
async fn test_held_batch_lock_skips_without_touching_record() {
    let stores = TestStores::new();
    let ids = seed_batch(&stores, 3).await;
    let store = flow_store(&stores, 3);
    let (service, registry) = service(&stores, store.clone());
    register_s1(&registry, store, "state1").await;

    let held = HeldLock::try_acquire(&*stores.locks, &retry_batch_key("b1"))
        .unwrap()
        .unwrap();
    let report = service.retry_jober().await.unwrap();
    assert_eq!(report.skipped, vec!["b1"]);

    let record = stores.memory.find("b1".into()).await.unwrap().unwrap();
    assert_eq!(record.retry_count, 0);
    assert!(record.last_retry_time.is_none());
    let contexts = stores.memory.find_by_context_id_list(ids).await.unwrap();
    assert!(contexts.iter().all(|c| c.status == FlowNodeStatus::Retryable));

    held.release().unwrap();
    let report = service.retry_jober().await.unwrap();
    assert_eq!(report.retried, vec!["b1"]);
}

#[tokio::test]
async fn test_busy_node_skips_batch() {
    let stores = TestStores::new();
    seed_batch(&stores, 3).await;
    let store = flow_store(&stores, 3);
    let (service, registry) = service(&stores, store.clone());
    register_s1(&registry, store, "state1").await;

    let _busy = HeldLock::try_acquire(
        &*stores.locks,
        &node_key("s1", "state1", LockPhase::Admission),
    )
    .unwrap()
    .unwrap();
    let report = service.retry_jober().await.unwrap();
    assert_eq!(report.skipped, vec!["b1"]);
    let record = stores.memory.find("b1".into()).await.unwrap().unwrap();
    assert_eq!(record.retry_count, 0);
    // the batch lock was dropped with the skip
    assert!(stores
        .locks
        .distributed_lock(&retry_batch_key("b1"))
        .try_lock()
        .unwrap());
}

async fn failing_flow(
    stores: &TestStores,
    transport: Arc<MockTransport>,
    max_retry: u32,
    batch_limit: usize,
) -> (RetryService, Arc<Flow>) {
    let store = flow_store(stores, max_retry);
    let registry = Arc::new(FlowRegistry::new(stores.memory.clone()));
    let service = RetryService::new(store.clone(), registry.clone(), batch_limit);

    let mut b = FlowBuilder::new("scores", "scores");
    let start = b.start("start1").unwrap();
    b.jober(
        start,
        "state1",
        JoberSpec::new("score", JoberKind::Rpc).with_fitables(vec!["svc".into()]),
        Arc::new(RpcJober::new(transport)),
    )
    .unwrap();
    let flow = registry.register(b.close("ender1", store).unwrap()).await.unwrap();
    (service, flow)
}

#[tokio::test]
async fn test_retries_end_in_error_once_budget_is_spent() {
    let stores = TestStores::new();
    let transport = Arc::new(MockTransport::new().fail("svc"));
    let (service, flow) = failing_flow(&stores, transport.clone(), 2, 100).await;
    let mut rx = flow.store().events.subscribe();

    flow.offer(vec![FlowData::default()]).await.unwrap();
    let ctx = stores.memory.contexts_at("state1").unwrap().remove(0);
    assert_eq!(ctx.status, FlowNodeStatus::Retryable);
    let batch = ctx.to_batch.clone().unwrap();

    for attempt in 1..=2 {
        let report = service.retry_jober().await.unwrap();
        assert_eq!(report.retried, vec![batch.clone()], "attempt {attempt}");
    }
    let report = service.retry_jober().await.unwrap();
    assert!(report.retried.is_empty());

    let ctx = &stores.memory.contexts_at("state1").unwrap()[0];
    assert_eq!(ctx.status, FlowNodeStatus::Error);
    assert_eq!(transport.calls().len(), 3);
    assert!(stores.memory.find(batch.clone()).await.unwrap().is_none());

    let mut exhausted = false;
    while let Ok(ev) = rx.try_recv() {
        if ev == (FlowEvent::RetryExhausted { batch: batch.clone() }) {
            exhausted = true;
        }
    }
    assert!(exhausted);
}

#[tokio::test]
async fn test_recovered_target_completes_on_retry() {
    let stores = TestStores::new();
    let transport = Arc::new(MockTransport::new().fail("svc"));
    let (service, flow) = failing_flow(&stores, transport.clone(), 3, 100).await;

    flow.offer(vec![FlowData::default()]).await.unwrap();
    let batch = stores.memory.contexts_at("state1").unwrap()[0]
        .to_batch
        .clone()
        .unwrap();

    transport.recover("svc");
    let report = service.retry_jober().await.unwrap();
    assert_eq!(report.retried, vec![batch.clone()]);

    let state = stores.memory.contexts_at("state1").unwrap();
    assert!(state.iter().all(|c| c.status == FlowNodeStatus::Archived));
    assert_eq!(stores.memory.contexts_at("ender1").unwrap().len(), 1);
    assert!(stores.memory.find(batch).await.unwrap().is_none());
}

#[tokio::test]
async fn test_errored_retry_frees_its_scan_slot() {
    let stores = TestStores::new();
    let transport = Arc::new(MockTransport::new().fail("svc"));
    let (service, flow) = failing_flow(&stores, transport.clone(), 3, 1).await;

    flow.offer(vec![FlowData::default()]).await.unwrap();
    let first = stores.memory.contexts_at("state1").unwrap()[0]
        .to_batch
        .clone()
        .unwrap();

    // the retry fails for good
    transport.set_failing("svc", false);
    let report = service.retry_jober().await.unwrap();
    assert_eq!(report.retried, vec![first.clone()]);
    let ctx = &stores.memory.contexts_at("state1").unwrap()[0];
    assert_eq!(ctx.status, FlowNodeStatus::Error);
    assert!(stores.memory.find(first).await.unwrap().is_none());

    transport.set_failing("svc", true);
    flow.offer(vec![FlowData::default()]).await.unwrap();
    let second = stores
        .memory
        .contexts_at("state1")
        .unwrap()
        .into_iter()
        .find(|c| c.status == FlowNodeStatus::Retryable)
        .and_then(|c| c.to_batch)
        .unwrap();

    transport.recover("svc");
    let report = service.retry_jober().await.unwrap();
    assert_eq!(report.retried, vec![second]);
    assert_eq!(stores.memory.contexts_at("ender1").unwrap().len(), 1);
}

#[tokio::test]
async fn test_scheduler_stops_on_cancel() {
    let stores = TestStores::new();
    let (service, _) = service(&stores, flow_store(&stores, 1));
    let cancel = CancellationToken::new();
    let config = RetryConfig {
        scan_interval_secs: 3600,
        ..RetryConfig::default()
    };
    let scheduler = RetryScheduler::new(&config, Arc::new(service), cancel.clone()).unwrap();

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), scheduler.run())
        .await
        .expect("scheduler did not stop");
}

#[tokio::test]
async fn test_disabled_scheduler_idles_until_cancel() {
    let stores = TestStores::new();
    let (service, _) = service(&stores, flow_store(&stores, 1));
    seed_batch(&stores, 1).await;
    let cancel = CancellationToken::new();
    let config = RetryConfig {
        enabled: false,
        scan_interval_secs: 1,
        ..RetryConfig::default()
    };
    let scheduler = RetryScheduler::new(&config, Arc::new(service), cancel.clone()).unwrap();

    let run = scheduler.run();
    tokio::pin!(run);
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut run)
        .await
        .is_err());
    cancel.cancel();
    run.await;

    let record = stores.memory.find("b1".into()).await.unwrap().unwrap();
    assert_eq!(record.retry_count, 0);
}

#[test]
fn test_invalid_cron_schedule_is_rejected() {
    let stores = TestStores::new();
    let (service, _) = service(&stores, flow_store(&stores, 1));
    let config = RetryConfig {
        schedule: Some("not a cron".into()),
        ..RetryConfig::default()
    };
    let err = RetryScheduler::new(&config, Arc::new(service), CancellationToken::new()).err();
    assert!(err.is_some());
}
