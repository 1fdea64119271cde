use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use serde_json::{json, Value};
use tracing::{debug, warn};

use waterflow_core::config::JoberConfig;
use waterflow_core::error::{FlowError, Result};
use waterflow_core::traits::Transport;

use crate::config::{EffectiveConfig, JoberKind};

/// A strategy that performs a node's work.
pub trait Jober: Send + Sync + 'static {
    fn kind(&self) -> JoberKind;

    /// Run the work and wait for one result per input.
    fn execute(
        &self,
        config: EffectiveConfig,
        inputs: Vec<Value>,
    ) -> BoxFuture<'_, Result<Vec<Value>>>;

    /// Whether `dispatch` hands work off for real. Async nodes need it.
    fn can_dispatch(&self) -> bool {
        false
    }

    /// Hand the work off without waiting for results. Completion is
    /// reported later against `batch`.
    fn dispatch(
        &self,
        _config: EffectiveConfig,
        batch: String,
        _inputs: Vec<Value>,
    ) -> BoxFuture<'_, Result<()>> {
        let kind = self.kind();
        Box::pin(async move {
            Err(FlowError::Config(format!(
                "{:?} jober cannot dispatch batch '{}' asynchronously",
                kind, batch
            )))
        })
    }
}

/// Spread a generic call result over `expected` inputs.
///
/// An array of matching length is taken element-wise; anything else is
/// the result of every input.
fn reinterpret(target: &str, value: Value, expected: usize) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) if items.len() == expected => Ok(items),
        Value::Array(items) if expected != 1 => Err(FlowError::Config(format!(
            "target '{}' returned {} results for {} inputs",
            target,
            items.len(),
            expected
        ))),
        other => Ok(vec![other; expected]),
    }
}

/// Try each target in order until one succeeds.
async fn first_success<F, Fut>(targets: &[String], mut call: F) -> Result<Vec<Value>>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Vec<Value>>>,
{
    if targets.is_empty() {
        return Err(FlowError::Config("no fitable configured for jober".into()));
    }
    let mut last_err = None;
    for target in targets {
        match call(target.clone()).await {
            Ok(results) => return Ok(results),
            Err(e) => {
                warn!(target = %target, error = %e, "Jober target failed, trying next");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| FlowError::Config("all jober targets failed".into())))
}

/// Call every target and merge object results per input; later targets win.
async fn fan_out<F, Fut>(targets: &[String], expected: usize, call: F) -> Result<Vec<Value>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Vec<Value>>>,
{
    let outcomes = join_all(targets.iter().cloned().map(&call)).await;
    let mut merged: Vec<Value> = vec![Value::Null; expected];
    let mut last_err = None;
    let mut any_ok = false;
    for (target, outcome) in targets.iter().zip(outcomes) {
        match outcome {
            Ok(results) => {
                any_ok = true;
                for (slot, value) in merged.iter_mut().zip(results) {
                    match (slot.as_object_mut(), value) {
                        (Some(acc), Value::Object(obj)) => acc.extend(obj),
                        (_, value) => *slot = value,
                    }
                }
            }
            Err(e) => {
                warn!(target = %target, error = %e, "Fan-out target failed");
                last_err = Some(e);
            }
        }
    }
    if any_ok {
        Ok(merged)
    } else {
        Err(last_err.unwrap_or_else(|| FlowError::Config("no fitable configured for jober".into())))
    }
}

/// In-process function registered under a fitable id.
pub type LocalHandler = Arc<dyn Fn(&Value, Vec<Value>) -> Result<Vec<Value>> + Send + Sync>;

/// Direct in-process calls.
#[derive(Default, Clone)]
pub struct LocalJober {
    handlers: HashMap<String, LocalHandler>,
}

impl LocalJober {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, fitable: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Value, Vec<Value>) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        self.handlers.insert(fitable.into(), Arc::new(handler));
        self
    }
}

impl Jober for LocalJober {
    fn kind(&self) -> JoberKind {
        JoberKind::Local
    }

    fn execute(
        &self,
        config: EffectiveConfig,
        inputs: Vec<Value>,
    ) -> BoxFuture<'_, Result<Vec<Value>>> {
        Box::pin(async move {
            let expected = inputs.len();
            first_success(&config.fitables, |target| {
                let handler = self.handlers.get(&target).cloned();
                let inputs = inputs.clone();
                let entity = config.entity.clone();
                async move {
                    let handler = handler.ok_or_else(|| {
                        FlowError::NodeNotFound(format!("local fitable '{}'", target))
                    })?;
                    let results = handler(&entity, inputs)?;
                    if results.len() != expected {
                        return Err(FlowError::Config(format!(
                            "local fitable '{}' returned {} results for {} inputs",
                            target,
                            results.len(),
                            expected
                        )));
                    }
                    Ok(results)
                }
            })
            .await
        })
    }
}

/// Remote calls over the injected transport.
pub struct RpcJober {
    transport: Arc<dyn Transport>,
}

impl RpcJober {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    async fn call(&self, target: String, config: &EffectiveConfig, inputs: &[Value]) -> Result<Vec<Value>> {
        debug!(target = %target, inputs = inputs.len(), "Invoking remote fitable");
        let args = vec![Value::Array(inputs.to_vec()), config.entity.clone()];
        let value = self
            .transport
            .invoke(target.clone(), args, config.timeout)
            .await?;
        reinterpret(&target, value, inputs.len())
    }
}

impl Jober for RpcJober {
    fn kind(&self) -> JoberKind {
        JoberKind::Rpc
    }

    fn execute(
        &self,
        config: EffectiveConfig,
        inputs: Vec<Value>,
    ) -> BoxFuture<'_, Result<Vec<Value>>> {
        Box::pin(async move {
            if config.fan_out {
                fan_out(&config.fitables, inputs.len(), |t| self.call(t, &config, &inputs)).await
            } else {
                first_success(&config.fitables, |t| self.call(t, &config, &inputs)).await
            }
        })
    }

    fn can_dispatch(&self) -> bool {
        true
    }

    fn dispatch(
        &self,
        config: EffectiveConfig,
        batch: String,
        inputs: Vec<Value>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let args = vec![
                Value::Array(inputs),
                config.entity.clone(),
                json!({ "batch": batch }),
            ];
            first_success(&config.fitables, |target| {
                let args = args.clone();
                async move {
                    self.transport.submit(target, args).await?;
                    Ok(vec![])
                }
            })
            .await?;
            Ok(())
        })
    }
}

/// Calls through the fixed internal HTTP relay.
pub struct HttpJober {
    client: reqwest::Client,
    relay_url: String,
    /// Applied when a node sets no timeout of its own.
    default_timeout: Option<Duration>,
}

impl HttpJober {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            relay_url: relay_url.into(),
            default_timeout: None,
        }
    }

    pub fn from_config(config: &JoberConfig) -> Self {
        Self {
            default_timeout: Some(Duration::from_millis(config.default_timeout_ms)),
            ..Self::new(&config.http_relay_url)
        }
    }

    async fn call(&self, target: String, config: &EffectiveConfig, inputs: &[Value]) -> Result<Vec<Value>> {
        let body = json!({
            "fitable": target,
            "entity": config.entity,
            "inputs": inputs,
        });
        let timeout = config.timeout.or(self.default_timeout);
        let mut request = self.client.post(&self.relay_url).json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FlowError::Timeout {
                    target: target.clone(),
                    timeout_ms: timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
                }
            } else {
                FlowError::Transport {
                    target: target.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status.is_client_error() {
            return Err(FlowError::Config(format!(
                "relay rejected call to '{}': {}",
                target, status
            )));
        }
        if !status.is_success() {
            return Err(FlowError::Transport {
                target,
                message: format!("relay returned {}", status),
            });
        }

        let value: Value = response.json().await.map_err(|e| FlowError::Transport {
            target: target.clone(),
            message: e.to_string(),
        })?;
        reinterpret(&target, value, inputs.len())
    }
}

impl Jober for HttpJober {
    fn kind(&self) -> JoberKind {
        JoberKind::Http
    }

    fn execute(
        &self,
        config: EffectiveConfig,
        inputs: Vec<Value>,
    ) -> BoxFuture<'_, Result<Vec<Value>>> {
        Box::pin(async move {
            first_success(&config.fitables, |t| self.call(t, &config, &inputs)).await
        })
    }
}

/// Returns its inputs, with an object entity merged in. For tests and demos.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoJober;

impl Jober for EchoJober {
    fn kind(&self) -> JoberKind {
        JoberKind::Echo
    }

    fn execute(
        &self,
        config: EffectiveConfig,
        inputs: Vec<Value>,
    ) -> BoxFuture<'_, Result<Vec<Value>>> {
        Box::pin(async move {
            let Value::Object(entity) = config.entity else {
                return Ok(inputs);
            };
            Ok(inputs
                .into_iter()
                .map(|mut input| {
                    if let Some(obj) = input.as_object_mut() {
                        obj.extend(entity.clone());
                    }
                    input
                })
                .collect())
        })
    }
}
