use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use waterflow_core::error::{FlowError, Result};
use waterflow_core::types::{FlowData, KEY_ASYNC_TASK};

use crate::config::{EffectiveConfig, JoberSpec};
use crate::converter::attach_result;
use crate::strategy::Jober;

/// A jober bound to one node of a flow.
pub struct JoberNode {
    node_id: String,
    spec: JoberSpec,
    jober: Arc<dyn Jober>,
}

impl JoberNode {
    pub fn new(node_id: impl Into<String>, spec: JoberSpec, jober: Arc<dyn Jober>) -> Self {
        Self {
            node_id: node_id.into(),
            spec,
            jober,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn spec(&self) -> &JoberSpec {
        &self.spec
    }

    pub fn is_async(&self) -> bool {
        self.spec.is_async
    }

    /// Apply the input converter, if any.
    pub fn prepare(&self, data: &FlowData) -> FlowData {
        match &self.spec.converter {
            Some(converter) => converter.convert_input(data),
            None => data.clone(),
        }
    }

    /// Split prepared inputs into runs sharing one effective config,
    /// keeping input indices so results land back in order.
    fn group(&self, prepared: &[FlowData]) -> Vec<(EffectiveConfig, Vec<usize>)> {
        let mut groups: Vec<(EffectiveConfig, Vec<usize>)> = Vec::new();
        for (idx, data) in prepared.iter().enumerate() {
            let config = self.spec.effective(&self.node_id, data);
            match groups.iter_mut().find(|(c, _)| *c == config) {
                Some((_, members)) => members.push(idx),
                None => groups.push((config, vec![idx])),
            }
        }
        groups
    }

    /// Run the jober and wait. Returns one output per input, in input order.
    pub async fn execute(&self, inputs: Vec<FlowData>) -> Result<Vec<FlowData>> {
        let prepared: Vec<FlowData> = inputs.iter().map(|d| self.prepare(d)).collect();
        let mut outputs: Vec<Option<FlowData>> = vec![None; prepared.len()];

        for (config, members) in self.group(&prepared) {
            debug!(
                node = %self.node_id,
                jober = %self.spec.name,
                inputs = members.len(),
                fitables = ?config.fitables,
                "Executing jober"
            );
            let values = members
                .iter()
                .map(|&i| prepared[i].business_data.clone())
                .collect();
            let results = self
                .jober
                .execute(config, values)
                .await
                .map_err(|e| e.at_node(&self.node_id, self.spec.error_code))?;
            if results.len() != members.len() {
                return Err(FlowError::Config(format!(
                    "jober '{}' returned {} results for {} inputs",
                    self.spec.name,
                    results.len(),
                    members.len()
                ))
                .at_node(&self.node_id, self.spec.error_code));
            }

            for (&idx, result) in members.iter().zip(results) {
                let mut out = prepared[idx].clone();
                attach_result(self.spec.converter.as_ref(), &self.node_id, &mut out, result)
                    .map_err(|e| e.at_node(&self.node_id, self.spec.error_code))?;
                outputs[idx] = Some(out);
            }
        }

        Ok(outputs.into_iter().flatten().collect())
    }

    /// Hand prepared inputs to the jober without waiting for results.
    pub async fn dispatch(&self, batch: &str, prepared: Vec<FlowData>) -> Result<()> {
        for (config, members) in self.group(&prepared) {
            let values = members
                .iter()
                .map(|&i| prepared[i].business_data.clone())
                .collect();
            self.jober
                .dispatch(config, batch.to_string(), values)
                .await
                .map_err(|e| e.at_node(&self.node_id, self.spec.error_code))?;
        }
        info!(node = %self.node_id, batch = %batch, contexts = prepared.len(), "Async jober dispatched");
        Ok(())
    }

    /// Fold an async result into `data` and stamp the task id.
    pub fn complete(&self, data: &FlowData, delta: Value, batch: &str) -> Result<FlowData> {
        let mut out = data.clone();
        attach_result(self.spec.converter.as_ref(), &self.node_id, &mut out, delta)
            .map_err(|e| e.at_node(&self.node_id, self.spec.error_code))?;
        let mut stamp = Map::new();
        stamp.insert(KEY_ASYNC_TASK.to_string(), Value::String(batch.to_string()));
        out.merge_business(&stamp);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JoberKind;
    use crate::converter::ConverterSpec;
    use crate::strategy::{EchoJober, LocalJober};
    use serde_json::json;
    use waterflow_core::error::FlowError;

    fn counting_jober() -> Arc<dyn Jober> {
        Arc::new(LocalJober::new().register("count", |entity, inputs| {
            Ok(inputs
                .iter()
                .map(|_| json!({ "batch_size": inputs.len(), "via": entity.clone() }))
                .collect())
        }))
    }

    #[tokio::test]
    async fn test_execute_preserves_order_and_merges_results() {
        let spec = JoberSpec::new("count", JoberKind::Local)
            .with_fitables(vec!["count".into()])
            .with_entity(json!("default"));
        let node = JoberNode::new("state1", spec, counting_jober());

        let inputs = vec![
            FlowData::new(json!({"n": 1})),
            FlowData::new(json!({"n": 2, "_jober_config": {"state1": {"entity": "custom"}}})),
            FlowData::new(json!({"n": 3})),
        ];
        let out = node.execute(inputs).await.unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].business_data["n"], 1);
        assert_eq!(out[0].business_data["batch_size"], 2);
        assert_eq!(out[1].business_data["via"], "custom");
        assert_eq!(out[1].business_data["batch_size"], 1);
        assert_eq!(out[2].business_data["n"], 3);
        assert_eq!(out[2].business_data["via"], "default");
    }

    #[tokio::test]
    async fn test_execute_applies_converter() {
        let spec = JoberSpec::new("echo", JoberKind::Echo).with_converter(
            ConverterSpec::new()
                .input("customer", "order.customer")
                .output("echoed"),
        );
        let node = JoberNode::new("state1", spec, Arc::new(EchoJober));
        let out = node
            .execute(vec![FlowData::new(json!({"order": {"customer": "c-7"}}))])
            .await
            .unwrap();
        assert_eq!(out[0].business_data["customer"], "c-7");
        assert_eq!(out[0].business_data["echoed"]["customer"], "c-7");
    }

    #[tokio::test]
    async fn test_execute_wraps_errors_with_node_code() {
        let spec = JoberSpec::new("missing", JoberKind::Local)
            .with_fitables(vec!["nope".into()]);
        let node = JoberNode::new("state9", spec, Arc::new(LocalJober::new()));
        let err = node.execute(vec![FlowData::default()]).await.unwrap_err();
        match err {
            FlowError::Jober { node, code, retryable, .. } => {
                assert_eq!(node, "state9");
                assert_eq!(code, 20_000);
                assert!(!retryable);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Answers every call with a fixed number of results.
    struct ShortJober(usize);

    impl Jober for ShortJober {
        fn kind(&self) -> JoberKind {
            JoberKind::Local
        }

        fn execute(
            &self,
            _config: EffectiveConfig,
            _inputs: Vec<Value>,
        ) -> futures::future::BoxFuture<'_, Result<Vec<Value>>> {
            let n = self.0;
            Box::pin(async move { Ok(vec![json!({"done": true}); n]) })
        }
    }

    #[tokio::test]
    async fn test_execute_rejects_result_count_mismatch() {
        for returned in [0, 1, 3] {
            let spec = JoberSpec::new("short", JoberKind::Local).with_fitables(vec!["x".into()]);
            let node = JoberNode::new("state1", spec, Arc::new(ShortJober(returned)));
            let err = node
                .execute(vec![FlowData::default(), FlowData::default()])
                .await
                .unwrap_err();
            match err {
                FlowError::Jober { node, retryable, message, .. } => {
                    assert_eq!(node, "state1");
                    assert!(!retryable);
                    assert!(message.contains("for 2 inputs"), "{message}");
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_complete_stamps_task_id() {
        let spec = JoberSpec::new("async", JoberKind::Echo).asynchronous();
        let node = JoberNode::new("state1", spec, Arc::new(EchoJober));
        let out = node
            .complete(
                &FlowData::default(),
                json!({"k1": "v1", "k2": {"secondLayerK1": "secondLayerV1"}}),
                "batch-1",
            )
            .unwrap();
        let obj = out.business_data.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert_eq!(obj[KEY_ASYNC_TASK], "batch-1");
    }

    #[test]
    fn test_complete_rejects_scalar_without_output_key() {
        let node = JoberNode::new(
            "state1",
            JoberSpec::new("async", JoberKind::Echo).asynchronous(),
            Arc::new(EchoJober),
        );
        let err = node
            .complete(&FlowData::default(), json!(42), "b")
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
