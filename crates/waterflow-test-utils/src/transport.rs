use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use waterflow_core::error::{FlowError, Result};
use waterflow_core::traits::Transport;

#[derive(Default)]
struct Script {
    responses: HashMap<String, Value>,
    failing: HashMap<String, bool>,
    calls: Vec<(String, Vec<Value>)>,
    submissions: Vec<(String, Vec<Value>)>,
}

/// Transport double with canned per-target responses.
///
/// Targets without a canned response echo their first argument. Failing
/// targets return a retryable transport error, or a non-retryable config
/// error when registered with `fail_permanently`.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<Script>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, target: &str, value: Value) -> Self {
        if let Ok(mut s) = self.script.lock() {
            s.responses.insert(target.to_string(), value);
        }
        self
    }

    pub fn fail(self, target: &str) -> Self {
        self.set_failing(target, true);
        self
    }

    pub fn fail_permanently(self, target: &str) -> Self {
        self.set_failing(target, false);
        self
    }

    /// Start failing `target` from now on.
    pub fn set_failing(&self, target: &str, retryable: bool) {
        if let Ok(mut s) = self.script.lock() {
            s.failing.insert(target.to_string(), retryable);
        }
    }

    /// Stop failing `target`.
    pub fn recover(&self, target: &str) {
        if let Ok(mut s) = self.script.lock() {
            s.failing.remove(target);
        }
    }

    /// Targets invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.script
            .lock()
            .map(|s| s.calls.iter().map(|(t, _)| t.clone()).collect())
            .unwrap_or_default()
    }

    /// Arguments of every fire-and-forget submission.
    pub fn submissions(&self) -> Vec<(String, Vec<Value>)> {
        self.script
            .lock()
            .map(|s| s.submissions.clone())
            .unwrap_or_default()
    }

    fn outcome(&self, target: &str) -> Option<FlowError> {
        let s = self.script.lock().ok()?;
        match s.failing.get(target) {
            Some(true) => Some(FlowError::Transport {
                target: target.to_string(),
                message: "connection refused".into(),
            }),
            Some(false) => Some(FlowError::Config(format!("{} rejected the call", target))),
            None => None,
        }
    }
}

impl Transport for MockTransport {
    fn invoke(
        &self,
        target: String,
        args: Vec<Value>,
        _timeout: Option<Duration>,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            if let Ok(mut s) = self.script.lock() {
                s.calls.push((target.clone(), args.clone()));
            }
            if let Some(err) = self.outcome(&target) {
                return Err(err);
            }
            let canned = self
                .script
                .lock()
                .ok()
                .and_then(|s| s.responses.get(&target).cloned());
            Ok(canned.unwrap_or_else(|| args.into_iter().next().unwrap_or(Value::Null)))
        })
    }

    fn submit(&self, target: String, args: Vec<Value>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(err) = self.outcome(&target) {
                return Err(err);
            }
            if let Ok(mut s) = self.script.lock() {
                s.submissions.push((target, args));
            }
            Ok(())
        })
    }
}
