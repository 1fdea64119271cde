use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use waterflow_core::error::FlowError;
use waterflow_core::event::{EventBus, FlowEvent};
use waterflow_core::policy::RetryPolicy;
use waterflow_core::traits::RetryRepository;
use waterflow_core::types::{FlowData, FlowNodeStatus, KEY_ASYNC_TASK};
use waterflow_graph::{ErrorDecision, FlowBuilder, FlowStore, JoinMode, NodeKind, WindowSpec};
use waterflow_jober::{EchoJober, JoberKind, JoberSpec, RpcJober};
use waterflow_test_utils::{MockTransport, TestStores};

fn flow_store(stores: &TestStores) -> FlowStore {
    FlowStore {
        contexts: stores.memory.clone(),
        traces: stores.memory.clone(),
        retries: stores.memory.clone(),
        locks: stores.locks.clone(),
        events: Arc::new(EventBus::default()),
        policy: RetryPolicy {
            max_retry: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            jitter: false,
        },
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<FlowEvent>) -> Vec<FlowEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test]
async fn test_linear_flow_archives_every_hop() {
    let stores = TestStores::new();
    let finished = Arc::new(Mutex::new(Vec::new()));

    let mut b = FlowBuilder::new("linear", "linear");
    let start = b.start("start1").unwrap();
    b.map(start, "state1", |v| Ok(json!({ "n": v["n"].as_i64().unwrap_or(0) + 1 })))
        .unwrap();
    let sink = finished.clone();
    b.on_success(move |contexts| {
        sink.lock()
            .unwrap()
            .extend(contexts.iter().map(|c| c.data.business_data.clone()));
    });
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    let receipt = flow.offer(vec![FlowData::new(json!({"n": 1}))]).await.unwrap();
    assert!(receipt.dispatches.is_empty());
    assert_eq!(*finished.lock().unwrap(), vec![json!({"n": 2})]);

    let all = stores.memory.all_contexts().unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|c| c.status == FlowNodeStatus::Archived));
    assert!(all.iter().all(|c| c.trace_ids.contains(&receipt.trace_id)));

    let end = &stores.memory.contexts_at("ender1").unwrap()[0];
    let state = &stores.memory.contexts_at("state1").unwrap()[0];
    assert_eq!(end.previous.as_deref(), Some(state.id.as_str()));
    assert_eq!(end.root_id, receipt.context_ids[0]);
}

#[tokio::test]
async fn test_all_join_emits_once_per_fork_instance() {
    let stores = TestStores::new();
    let mut b = FlowBuilder::new("fanout", "fanout");
    let start = b.start("start1").unwrap();
    let par = b.parallel(start, "par1", JoinMode::All).unwrap();
    for i in 0..3 {
        b.fork(par, move |b, from| {
            b.map(from, format!("branch{i}"), move |v| {
                Ok(json!({ "branch": i, "input": v["input"].clone() }))
            })
        })
        .unwrap();
    }
    b.join(par, "join1", || json!([]), |mut acc, v| {
        if let Some(items) = acc.as_array_mut() {
            items.push(v.clone());
        }
        Ok(acc)
    })
    .unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    for round in 0..3 {
        flow.offer(vec![FlowData::new(json!({"input": round}))])
            .await
            .unwrap();
    }

    let ended = stores.memory.contexts_at("ender1").unwrap();
    assert_eq!(ended.len(), 3);
    for ctx in &ended {
        let items = ctx.data.business_data.as_array().unwrap();
        assert_eq!(items.len(), 3);
        let order: Vec<i64> = items.iter().map(|v| v["branch"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(ctx.data.fork().is_none());
    }

    match flow.node_by_name("join1").unwrap().kind() {
        NodeKind::Join { tokens, .. } => assert!(tokens.is_empty()),
        _ => panic!("join1 is not a join"),
    }
}

#[tokio::test]
async fn test_either_join_takes_first_branch() {
    let stores = TestStores::new();
    let mut b = FlowBuilder::new("race", "race");
    let start = b.start("start1").unwrap();
    let par = b.parallel(start, "par1", JoinMode::Either).unwrap();
    b.fork(par, |b, from| b.map(from, "fast", |_| Ok(json!("fast")))).unwrap();
    b.fork(par, |b, from| b.map(from, "slow", |_| Ok(json!("slow")))).unwrap();
    b.join(par, "join1", || json!([]), |mut acc, v| {
        if let Some(items) = acc.as_array_mut() {
            items.push(v.clone());
        }
        Ok(acc)
    })
    .unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();
    let mut rx = flow.store().events.subscribe();

    flow.offer(vec![FlowData::default()]).await.unwrap();

    let ended = stores.memory.contexts_at("ender1").unwrap();
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].data.business_data, json!(["fast"]));
    let discarded = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, FlowEvent::ContextDiscarded { node, .. } if node == "join1"))
        .count();
    assert_eq!(discarded, 1);
}

#[tokio::test]
async fn test_condition_routes_each_context_exactly_once() {
    let stores = TestStores::new();
    let mut b = FlowBuilder::new("route", "route");
    let start = b.start("start1").unwrap();
    let cond = b.conditions(start, "condi1").unwrap();
    b.match_branch(cond, |v| v["n"].as_i64().unwrap_or(0) > 10, |b, from| {
        b.just(from, "big", |_| Ok(()))
    })
    .unwrap();
    b.match_branch(cond, |v| v["n"].as_i64().unwrap_or(0) > 5, |b, from| {
        b.just(from, "medium", |_| Ok(()))
    })
    .unwrap();
    b.others(cond, |b, from| b.just(from, "small", |_| Ok(()))).unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    let inputs: Vec<FlowData> = [20, 7, 1, 11, 6]
        .iter()
        .map(|n| FlowData::new(json!({ "n": n })))
        .collect();
    flow.offer(inputs).await.unwrap();

    assert_eq!(stores.memory.contexts_at("big").unwrap().len(), 2);
    assert_eq!(stores.memory.contexts_at("medium").unwrap().len(), 2);
    assert_eq!(stores.memory.contexts_at("small").unwrap().len(), 1);
    assert_eq!(stores.memory.contexts_at("ender1").unwrap().len(), 5);
}

#[tokio::test]
async fn test_unmatched_without_others_is_archived_and_reported() {
    let stores = TestStores::new();
    let mut b = FlowBuilder::new("strict", "strict");
    let start = b.start("start1").unwrap();
    let cond = b.conditions(start, "condi1").unwrap();
    b.match_branch(cond, |v| v["ok"] == true, |b, from| b.just(from, "state1", |_| Ok(())))
        .unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();
    let mut rx = flow.store().events.subscribe();

    flow.offer(vec![FlowData::new(json!({"ok": false}))])
        .await
        .unwrap();

    let at_cond = stores.memory.contexts_at("condi1").unwrap();
    assert_eq!(at_cond.len(), 1);
    assert_eq!(at_cond[0].status, FlowNodeStatus::Archived);
    assert!(stores.memory.contexts_at("state1").unwrap().is_empty());
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, FlowEvent::ContextDiscarded { node, .. } if node == "condi1")));
}

#[tokio::test]
async fn test_match_to_jumps_back_for_loops() {
    let stores = TestStores::new();
    let mut b = FlowBuilder::new("loop", "loop");
    let start = b.start("start1").unwrap();
    let inc = b
        .map(start, "inc", |v| Ok(json!({ "n": v["n"].as_i64().unwrap_or(0) + 1 })))
        .unwrap();
    let cond = b.conditions(inc, "check").unwrap();
    b.match_to(cond, |v| v["n"].as_i64().unwrap_or(0) < 3, inc).unwrap();
    b.others(cond, |b, from| b.just(from, "done", |_| Ok(()))).unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    flow.offer(vec![FlowData::new(json!({"n": 0}))]).await.unwrap();

    assert_eq!(stores.memory.contexts_at("inc").unwrap().len(), 3);
    let ended = stores.memory.contexts_at("ender1").unwrap();
    assert_eq!(ended[0].data.business_data, json!({"n": 3}));
}

#[tokio::test]
async fn test_windowed_reduce_emits_per_key_when_fulfilled() {
    let stores = TestStores::new();
    let mut b = FlowBuilder::new("window", "window");
    let start = b.start("start1").unwrap();
    let keyed = b
        .key_by(start, "key", |v| Ok(v["group"].as_str().unwrap_or("").to_string()))
        .unwrap();
    let win = b.window(keyed, "win", WindowSpec::count(2)).unwrap();
    b.reduce(win, "sum", || json!(0), |acc, v| {
        Ok(json!(acc.as_i64().unwrap_or(0) + v["n"].as_i64().unwrap_or(0)))
    })
    .unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    flow.offer(vec![
        FlowData::new(json!({"group": "a", "n": 1})),
        FlowData::new(json!({"group": "b", "n": 10})),
        FlowData::new(json!({"group": "a", "n": 2})),
    ])
    .await
    .unwrap();

    let ended = stores.memory.contexts_at("ender1").unwrap();
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].data.business_data, json!(3));
    assert_eq!(ended[0].data.window_key(), Some("a"));
}

#[tokio::test]
async fn test_reduce_without_window_folds_continuously() {
    let stores = TestStores::new();
    let mut b = FlowBuilder::new("running", "running");
    let start = b.start("start1").unwrap();
    b.reduce(start, "sum", || json!(0), |acc, v| {
        Ok(json!(acc.as_i64().unwrap_or(0) + v.as_i64().unwrap_or(0)))
    })
    .unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    flow.offer(vec![FlowData::new(json!(1)), FlowData::new(json!(2)), FlowData::new(json!(3))])
        .await
        .unwrap();

    let totals: Vec<Value> = stores
        .memory
        .contexts_at("ender1")
        .unwrap()
        .into_iter()
        .map(|c| c.data.business_data)
        .collect();
    assert_eq!(totals.len(), 3);
    assert!(totals.contains(&json!(6)));
}

#[tokio::test]
async fn test_process_keeps_state_per_key() {
    let stores = TestStores::new();
    let mut b = FlowBuilder::new("dedupe", "dedupe");
    let start = b.start("start1").unwrap();
    let keyed = b
        .key_by(start, "key", |v| Ok(v["user"].as_str().unwrap_or("").to_string()))
        .unwrap();
    b.process(keyed, "first_only", |ctx, scope| {
        if scope.get("seen").is_none() {
            scope.set("seen", json!(true));
            scope.emit(ctx.data.business_data.clone());
        }
        Ok(())
    })
    .unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    for user in ["u1", "u2", "u1", "u1"] {
        flow.offer(vec![FlowData::new(json!({ "user": user }))])
            .await
            .unwrap();
    }
    assert_eq!(stores.memory.contexts_at("ender1").unwrap().len(), 2);
}

#[tokio::test]
async fn test_flat_map_fans_out() {
    let stores = TestStores::new();
    let mut b = FlowBuilder::new("split", "split");
    let start = b.start("start1").unwrap();
    b.flat_map(start, "split", |v| {
        Ok(v["items"].as_array().cloned().unwrap_or_default())
    })
    .unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    flow.offer(vec![FlowData::new(json!({"items": [1, 2, 3]}))])
        .await
        .unwrap();
    assert_eq!(stores.memory.contexts_at("ender1").unwrap().len(), 3);
}

fn remote_async() -> JoberSpec {
    JoberSpec::new("remote", JoberKind::Rpc)
        .with_fitables(vec!["svc".into()])
        .asynchronous()
}

#[test]
fn test_async_node_needs_dispatching_strategy() {
    let mut b = FlowBuilder::new("async", "async");
    let start = b.start("start1").unwrap();
    let err = b
        .jober(
            start,
            "state1",
            JoberSpec::new("remote", JoberKind::Echo).asynchronous(),
            Arc::new(EchoJober),
        )
        .unwrap_err();
    assert!(matches!(err, FlowError::Config(_)));
}

#[tokio::test]
async fn test_async_resume_continues_downstream() {
    let stores = TestStores::new();
    let transport = Arc::new(MockTransport::new());
    let mut b = FlowBuilder::new("async", "async");
    let start = b.start("start1").unwrap();
    let job = b
        .jober(
            start,
            "state1",
            remote_async(),
            Arc::new(RpcJober::new(transport.clone())),
        )
        .unwrap();
    b.just(job, "state2", |_| Ok(())).unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    let receipt = flow.offer(vec![FlowData::default()]).await.unwrap();
    assert_eq!(receipt.dispatches.len(), 1);
    let token = &receipt.dispatches[0];
    assert_eq!(transport.submissions().len(), 1);

    let pending = stores.memory.contexts_at("state1").unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, FlowNodeStatus::Processing);
    assert_eq!(pending[0].to_batch.as_deref(), Some(token.batch.as_str()));
    assert!(stores.memory.contexts_at("state2").unwrap().is_empty());

    flow.resume_async_job(
        token,
        vec![json!({"k1": "v1", "k2": {"secondLayerK1": "secondLayerV1"}})],
    )
    .await
    .unwrap();

    let post = stores.memory.contexts_at("state2").unwrap();
    assert_eq!(post.len(), 1);
    let business = post[0].data.business_data.as_object().unwrap();
    assert_eq!(business.len(), 3);
    assert_eq!(business[KEY_ASYNC_TASK], token.batch.as_str());
    assert_eq!(post[0].previous.as_deref(), Some(pending[0].id.as_str()));
    assert_eq!(stores.memory.contexts_at("ender1").unwrap().len(), 1);

    // a second resume finds nothing in flight
    let err = flow.resume_async_job(token, vec![json!({})]).await.unwrap_err();
    assert!(matches!(err, FlowError::DispatchNotFound(_)));
}

#[tokio::test]
async fn test_async_failure_marks_batch_retryable() {
    let stores = TestStores::new();
    let mut b = FlowBuilder::new("async", "async");
    let start = b.start("start1").unwrap();
    b.jober(
        start,
        "state1",
        remote_async(),
        Arc::new(RpcJober::new(Arc::new(MockTransport::new()))),
    )
    .unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    let receipt = flow.offer(vec![FlowData::default()]).await.unwrap();
    let token = &receipt.dispatches[0];
    flow.fail_async_job(
        token,
        FlowError::Timeout {
            target: "remote".into(),
            timeout_ms: 100,
        },
    )
    .await
    .unwrap();

    let ctx = &stores.memory.contexts_at("state1").unwrap()[0];
    assert_eq!(ctx.status, FlowNodeStatus::Retryable);
    let record = stores.memory.find(token.batch.clone()).await.unwrap().unwrap();
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.max_retry, 1);
}

#[tokio::test]
async fn test_transport_failure_is_retryable() {
    let stores = TestStores::new();
    let transport = Arc::new(MockTransport::new().fail("svc"));
    let mut b = FlowBuilder::new("rpc", "rpc");
    let start = b.start("start1").unwrap();
    b.jober(
        start,
        "state1",
        JoberSpec::new("score", JoberKind::Rpc).with_fitables(vec!["svc".into()]),
        Arc::new(RpcJober::new(transport.clone())),
    )
    .unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();
    let mut rx = flow.store().events.subscribe();

    flow.offer(vec![FlowData::default()]).await.unwrap();

    let ctx = &stores.memory.contexts_at("state1").unwrap()[0];
    assert_eq!(ctx.status, FlowNodeStatus::Retryable);
    let batch = ctx.to_batch.clone().unwrap();
    assert!(stores.memory.find(batch).await.unwrap().is_some());
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, FlowEvent::NodeFailed { .. })));
    assert!(events.iter().any(|e| matches!(e, FlowEvent::ContextsRetryable { .. })));
}

#[tokio::test]
async fn test_permanent_failure_reaches_flow_callback() {
    let stores = TestStores::new();
    let transport = Arc::new(MockTransport::new().fail_permanently("svc"));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut b = FlowBuilder::new("rpc", "rpc");
    let start = b.start("start1").unwrap();
    b.jober(
        start,
        "state1",
        JoberSpec::new("score", JoberKind::Rpc).with_fitables(vec!["svc".into()]),
        Arc::new(RpcJober::new(transport)),
    )
    .unwrap();
    let sink = seen.clone();
    b.on_error(move |err, contexts| {
        sink.lock().unwrap().push((err.code(), contexts.len()));
    });
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    flow.offer(vec![FlowData::default(), FlowData::default()])
        .await
        .unwrap();

    let at_node = stores.memory.contexts_at("state1").unwrap();
    assert!(at_node.iter().all(|c| c.status == FlowNodeStatus::Error));
    assert_eq!(*seen.lock().unwrap(), vec![(20_000, 2)]);

    // the owner can still hand them to the retry subsystem
    let batch = flow.mark_retryable(at_node).await.unwrap();
    let moved = stores.memory.contexts_at("state1").unwrap();
    assert!(moved.iter().all(|c| c.status == FlowNodeStatus::Retryable));
    assert!(stores.memory.find(batch).await.unwrap().is_some());
}

#[tokio::test]
async fn test_mark_retryable_rejects_empty_batch() {
    let stores = TestStores::new();
    let mut b = FlowBuilder::new("empty", "empty");
    let start = b.start("start1").unwrap();
    b.map(start, "state1", |v| Ok(v.clone())).unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    let err = flow.mark_retryable(vec![]).await.unwrap_err();
    assert!(matches!(err, FlowError::Config(_)));
}

#[tokio::test]
async fn test_failing_a_retried_batch_closes_its_record() {
    let stores = TestStores::new();
    let fail = Arc::new(Mutex::new(false));
    let mut b = FlowBuilder::new("handled", "handled");
    let start = b.start("start1").unwrap();
    let node = b
        .map(start, "state1", |_| Err(FlowError::Config("bad input".into())))
        .unwrap();
    let give_up = fail.clone();
    b.error(node, move |_, _| {
        if *give_up.lock().unwrap() {
            ErrorDecision::Fail
        } else {
            ErrorDecision::Retry
        }
    })
    .unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    flow.offer(vec![FlowData::default()]).await.unwrap();
    let ctx = stores.memory.contexts_at("state1").unwrap().remove(0);
    let batch = ctx.to_batch.clone().unwrap();
    assert!(stores.memory.find(batch.clone()).await.unwrap().is_some());

    // second attempt is given up by the node handler
    *fail.lock().unwrap() = true;
    let ready: Vec<_> = stores
        .memory
        .contexts_at("state1")
        .unwrap()
        .into_iter()
        .map(|mut c| {
            c.status = FlowNodeStatus::Ready;
            c
        })
        .collect();
    flow.readmit(ready).await.unwrap();

    let ctx = &stores.memory.contexts_at("state1").unwrap()[0];
    assert_eq!(ctx.status, FlowNodeStatus::Error);
    assert!(stores.memory.find(batch).await.unwrap().is_none());
}

#[tokio::test]
async fn test_local_handler_overrides_classification() {
    let stores = TestStores::new();
    let mut b = FlowBuilder::new("handled", "handled");
    let start = b.start("start1").unwrap();
    let node = b
        .map(start, "state1", |_| Err(FlowError::Config("bad input".into())))
        .unwrap();
    b.error(node, |_, _| ErrorDecision::Retry).unwrap();
    let called = Arc::new(Mutex::new(false));
    let flag = called.clone();
    b.on_error(move |_, _| *flag.lock().unwrap() = true);
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    flow.offer(vec![FlowData::default()]).await.unwrap();

    let ctx = &stores.memory.contexts_at("state1").unwrap()[0];
    assert_eq!(ctx.status, FlowNodeStatus::Retryable);
    assert!(!*called.lock().unwrap());
}

#[tokio::test]
async fn test_definition_export_is_valid() {
    let stores = TestStores::new();
    let mut b = FlowBuilder::new("def", "def");
    let start = b.start("start1").unwrap();
    let state = b.map(start, "state1", |v| Ok(v.clone())).unwrap();
    let cond = b.conditions(state, "condi1").unwrap();
    b.match_branch(cond, |_| true, |b, from| b.just(from, "state2", |_| Ok(())))
        .unwrap();
    b.others(cond, |b, from| b.just(from, "state3", |_| Ok(()))).unwrap();
    b.label(state, "Enrich").unwrap();
    let flow = b.close("ender1", flow_store(&stores)).unwrap();

    let def = flow.definition();
    def.validate().unwrap();
    assert_eq!(def.nodes.len(), 6);
    assert_eq!(def.node("condi1").unwrap().next, vec!["state2", "state3"]);
    assert_eq!(def.node("state1").unwrap().name, "Enrich");
    assert_eq!(def.node("state2").unwrap().next, vec!["ender1"]);
}
