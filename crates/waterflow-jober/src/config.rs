use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use waterflow_core::types::FlowData;

use crate::converter::ConverterSpec;

/// Business key under which a payload may override jober settings,
/// as `{ "<node id>": { "fitables": [...], "entity": {...} } }`.
pub const KEY_JOBER_OVERRIDES: &str = "_jober_config";

/// Which strategy runs the node's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoberKind {
    Local,
    Rpc,
    Http,
    Echo,
}

/// Static jober declaration attached to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoberSpec {
    pub name: String,
    pub kind: JoberKind,
    /// Target implementation ids, tried in order.
    #[serde(default)]
    pub fitables: Vec<String>,
    /// Literal payload handed to every call.
    #[serde(default)]
    pub entity: Value,
    #[serde(default)]
    pub is_async: bool,
    /// Call every target instead of stopping at the first success.
    #[serde(default)]
    pub fan_out: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub converter: Option<ConverterSpec>,
    /// Code used to wrap failures raised by this node.
    #[serde(default = "default_error_code")]
    pub error_code: i32,
}

fn default_error_code() -> i32 {
    20_000
}

impl JoberSpec {
    pub fn new(name: impl Into<String>, kind: JoberKind) -> Self {
        Self {
            name: name.into(),
            kind,
            fitables: vec![],
            entity: Value::Null,
            is_async: false,
            fan_out: false,
            timeout_ms: None,
            converter: None,
            error_code: default_error_code(),
        }
    }

    pub fn with_fitables(mut self, fitables: Vec<String>) -> Self {
        self.fitables = fitables;
        self
    }

    pub fn with_entity(mut self, entity: Value) -> Self {
        self.entity = entity;
        self
    }

    pub fn with_converter(mut self, converter: ConverterSpec) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Resolve the settings for one call, applying overrides embedded in
    /// `data` for `node_id`. The declaration itself is never modified.
    pub fn effective(&self, node_id: &str, data: &FlowData) -> EffectiveConfig {
        let mut config = EffectiveConfig {
            fitables: self.fitables.clone(),
            entity: self.entity.clone(),
            fan_out: self.fan_out,
            timeout: self.timeout_ms.map(Duration::from_millis),
        };

        let Some(overrides) = data
            .business_data
            .get(KEY_JOBER_OVERRIDES)
            .and_then(|v| v.get(node_id))
        else {
            return config;
        };

        if let Some(fitables) = overrides.get("fitables").and_then(|v| v.as_array()) {
            config.fitables = fitables
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
        }
        if let Some(entity) = overrides.get("entity") {
            config.entity = entity.clone();
        }
        config
    }
}

/// Settings in force for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub fitables: Vec<String>,
    pub entity: Value,
    pub fan_out: bool,
    pub timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> JoberSpec {
        JoberSpec::new("score", JoberKind::Rpc)
            .with_fitables(vec!["svc-a".into(), "svc-b".into()])
            .with_entity(json!({"mode": "default"}))
            .with_timeout_ms(250)
    }

    #[test]
    fn test_effective_without_overrides() {
        let cfg = spec().effective("state1", &FlowData::default());
        assert_eq!(cfg.fitables, vec!["svc-a", "svc-b"]);
        assert_eq!(cfg.entity, json!({"mode": "default"}));
        assert_eq!(cfg.timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_effective_applies_node_overrides() {
        let data = FlowData::new(json!({
            "_jober_config": {
                "state1": {"fitables": ["svc-c"], "entity": {"mode": "fast"}},
                "state2": {"fitables": ["ignored"]}
            }
        }));
        let s = spec();
        let cfg = s.effective("state1", &data);
        assert_eq!(cfg.fitables, vec!["svc-c"]);
        assert_eq!(cfg.entity, json!({"mode": "fast"}));
        // the declaration is untouched
        assert_eq!(s.fitables, vec!["svc-a", "svc-b"]);
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let s: JoberSpec =
            serde_json::from_value(json!({"name": "echo", "kind": "echo"})).unwrap();
        assert_eq!(s.kind, JoberKind::Echo);
        assert!(!s.is_async);
        assert_eq!(s.error_code, 20_000);
        assert!(s.converter.is_none());
    }
}
