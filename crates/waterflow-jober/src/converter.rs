use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use waterflow_core::error::{FlowError, Result};
use waterflow_core::types::{FlowData, KEY_CONVERTED};

/// Maps business fields into jober inputs and the jober result back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConverterSpec {
    /// Input field name -> dotted path into the business payload.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Business key the result is stored under. Without it, an object
    /// result is merged into the payload.
    #[serde(default)]
    pub output: Option<String>,
}

impl ConverterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, field: impl Into<String>, path: impl Into<String>) -> Self {
        self.inputs.insert(field.into(), path.into());
        self
    }

    pub fn output(mut self, key: impl Into<String>) -> Self {
        self.output = Some(key.into());
        self
    }

    /// Add converted input fields to a copy of `data`, recording their
    /// names in the engine fields. Paths that resolve to nothing are skipped.
    pub fn convert_input(&self, data: &FlowData) -> FlowData {
        let mut converted = Map::new();
        for (field, path) in &self.inputs {
            if let Some(value) = lookup(&data.business_data, path) {
                converted.insert(field.clone(), value.clone());
            }
        }

        let mut out = data.clone();
        if converted.is_empty() {
            return out;
        }
        let names: Vec<Value> = converted.keys().cloned().map(Value::String).collect();
        debug!(fields = ?names, "Converted jober input");
        out.merge_business(&converted);
        out.context_data
            .insert(KEY_CONVERTED.to_string(), Value::Array(names));
        out
    }
}

/// Resolve a dotted path such as `order.customer.id`.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(value, |current, seg| match current {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Merge a jober result into `data`.
///
/// A non-object result can only be kept when a converter names the key
/// to store it under; otherwise the node is misconfigured.
pub fn attach_result(
    converter: Option<&ConverterSpec>,
    node: &str,
    data: &mut FlowData,
    result: Value,
) -> Result<()> {
    if let Some(key) = converter.and_then(|c| c.output.as_deref()) {
        let mut delta = Map::new();
        delta.insert(key.to_string(), result);
        data.merge_business(&delta);
        return Ok(());
    }

    match result {
        Value::Object(delta) => {
            data.merge_business(&delta);
            Ok(())
        }
        Value::Null => Ok(()),
        other => Err(FlowError::Config(format!(
            "node '{}' returned a {} result but has no output converter to attach it",
            node,
            value_kind(&other)
        ))),
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
