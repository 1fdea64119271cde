use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level Waterflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub jober: JoberConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. `~/` is expanded against `$HOME`.
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Seconds after which a lock row left by a dead process may be taken
    /// over. Keep it above the longest jober timeout.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            lock_lease_secs: default_lock_lease_secs(),
        }
    }
}

fn default_store_path() -> String { "~/.waterflow/waterflow.db".to_string() }
fn default_lock_lease_secs() -> u64 { 300 }

/// Retry subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_enabled")]
    pub enabled: bool,
    /// Attempts granted to a new retry batch.
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Seconds between scans when no cron schedule is set.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Cron expression driving scans (overrides `scan_interval_secs`).
    #[serde(default)]
    pub schedule: Option<String>,
    /// Maximum records fetched per scan.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_retry_enabled(),
            max_retry: default_max_retry(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            scan_interval_secs: default_scan_interval(),
            schedule: None,
            batch_limit: default_batch_limit(),
        }
    }
}

fn default_retry_enabled() -> bool { true }
fn default_max_retry() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 60_000 }
fn default_scan_interval() -> u64 { 10 }
fn default_batch_limit() -> usize { 100 }

/// Defaults shared by every jober.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoberConfig {
    /// Internal relay that HTTP jobers post to.
    #[serde(default = "default_http_relay_url")]
    pub http_relay_url: String,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for JoberConfig {
    fn default() -> Self {
        Self {
            http_relay_url: default_http_relay_url(),
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_http_relay_url() -> String { "http://127.0.0.1:8080/waterflow/relay".to_string() }
fn default_timeout_ms() -> u64 { 30_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize { 256 }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Resolve the SQLite path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        let path = &self.store.path;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WATERFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WATERFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WATERFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WATERFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WATERFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert!(config.retry.enabled);
        assert_eq!(config.retry.max_retry, 3);
        assert_eq!(config.retry.scan_interval_secs, 10);
        assert!(config.retry.schedule.is_none());
        assert_eq!(config.jober.default_timeout_ms, 30_000);
        assert_eq!(config.events.capacity, 256);
    }

    #[test]
    fn test_partial_retry_section() {
        let toml_str = r#"
[retry]
max_retry = 5
schedule = "0/30 * * * * *"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.retry.max_retry, 5);
        assert_eq!(config.retry.initial_backoff_ms, 1000);
        assert_eq!(config.retry.schedule.as_deref(), Some("0/30 * * * * *"));
    }

    #[test]
    fn test_store_path_absolute_is_kept() {
        let mut config = EngineConfig::default();
        config.store.path = "/var/lib/waterflow.db".into();
        assert_eq!(config.store_path(), PathBuf::from("/var/lib/waterflow.db"));
    }
}
