use std::sync::Arc;

use serde_json::{json, Value};

use waterflow_core::error::FlowError;
use waterflow_engine::FlowRegistry;
use waterflow_graph::{Flow, FlowBuilder, FlowStore};
use waterflow_jober::{JoberKind, JoberSpec, LocalJober};

pub const LINEAR_STREAM: &str = "demo-linear";
pub const BRANCHING_STREAM: &str = "demo-branching";

/// `start1 -> state1 (local jober) -> ender1`.
fn linear(store: FlowStore) -> anyhow::Result<Flow> {
    let enrich = LocalJober::new().register("enrich", |entity, inputs| {
        Ok(inputs
            .iter()
            .map(|input| {
                let name = input["name"].as_str().unwrap_or("anonymous");
                json!({ "greeting": format!("hello, {name}"), "by": entity.clone() })
            })
            .collect())
    });

    let mut b = FlowBuilder::new(LINEAR_STREAM, "Demo linear flow");
    let start = b.start("start1")?;
    b.jober(
        start,
        "state1",
        JoberSpec::new("enrich", JoberKind::Local)
            .with_fitables(vec!["enrich".into()])
            .with_entity(json!("demo")),
        Arc::new(enrich),
    )?;
    Ok(b.close("ender1", store)?)
}

/// `start1 -> state1 -> condi1 -> {approve | reject} -> ender1`.
fn branching(store: FlowStore) -> anyhow::Result<Flow> {
    let mut b = FlowBuilder::new(BRANCHING_STREAM, "Demo branching flow");
    let start = b.start("start1")?;
    let score = b.map(start, "state1", |v| {
        let amount = v["amount"]
            .as_f64()
            .ok_or_else(|| FlowError::Config("amount must be a number".into()))?;
        Ok(json!({ "amount": amount, "risky": amount > 1000.0 }))
    })?;
    b.label(score, "score")?;
    let cond = b.conditions(score, "condi1")?;
    let approve = b.match_branch(cond, |v| v["risky"] == false, |b, from| {
        b.map(from, "state2", |v| Ok(json!({ "approved": v["amount"].clone() })))
    })?;
    b.label(approve, "approve")?;
    let reject = b.others(cond, |b, from| {
        b.map(from, "state3", |v| Ok(json!({ "rejected": v["amount"].clone() })))
    })?;
    b.label(reject, "reject")?;
    Ok(b.close("ender1", store)?)
}

/// Register both demo flows so their definitions are stored and their
/// streams can be re-admitted by the retry subsystem.
pub async fn register(
    registry: &FlowRegistry,
    store: &FlowStore,
) -> anyhow::Result<(Arc<Flow>, Arc<Flow>)> {
    let linear = registry.register(linear(store.clone())?).await?;
    let branching = registry.register(branching(store.clone())?).await?;
    Ok((linear, branching))
}

pub fn linear_inputs() -> Vec<Value> {
    vec![json!({ "name": "ada" }), json!({ "name": "grace" })]
}

pub fn branching_inputs() -> Vec<Value> {
    vec![json!({ "amount": 250 }), json!({ "amount": 4800 })]
}
