use thiserror::Error;

use crate::types::FlowNodeStatus;

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph construction errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Flow definition not found for stream: {0}")]
    DefinitionNotFound(String),

    #[error("Flow trace not found: {0}")]
    TraceNotFound(String),

    // Status machine errors
    #[error("Illegal status transition for context {context}: {from} -> {to}")]
    InvalidTransition {
        context: String,
        from: FlowNodeStatus,
        to: FlowNodeStatus,
    },

    // Jober errors
    #[error("Jober failed at node {node} (code {code}): {message}")]
    Jober {
        node: String,
        code: i32,
        message: String,
        retryable: bool,
    },

    #[error("No pending async dispatch for batch: {0}")]
    DispatchNotFound(String),

    // Transport errors
    #[error("Transport error: {target}: {message}")]
    Transport { target: String, message: String },

    #[error("Invocation timeout after {timeout_ms}ms: {target}")]
    Timeout { target: String, timeout_ms: u64 },

    // Collaborator errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Lock error: {0}")]
    Lock(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Generic code for failures that carry no node-specific code.
pub const CODE_GENERIC: i32 = 10_000;
pub const CODE_CONFIG: i32 = 10_001;
pub const CODE_TRANSITION: i32 = 10_002;
pub const CODE_TRANSPORT: i32 = 10_003;
pub const CODE_TIMEOUT: i32 = 10_004;
pub const CODE_STORAGE: i32 = 10_005;

impl FlowError {
    /// Wrap any failure with a node-scoped error code.
    ///
    /// Retryability of the wrapped error is preserved so the node's error
    /// handler can still classify it.
    pub fn at_node(self, node: impl Into<String>, code: i32) -> Self {
        match self {
            FlowError::Jober { .. } => self,
            other => FlowError::Jober {
                node: node.into(),
                code,
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            FlowError::Transport { .. } | FlowError::Timeout { .. } => true,
            FlowError::Jober { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            FlowError::Config(_)
            | FlowError::ConfigNotFound(_)
            | FlowError::NodeNotFound(_)
            | FlowError::DefinitionNotFound(_) => CODE_CONFIG,
            FlowError::InvalidTransition { .. } => CODE_TRANSITION,
            FlowError::Jober { code, .. } => *code,
            FlowError::Transport { .. } => CODE_TRANSPORT,
            FlowError::Timeout { .. } => CODE_TIMEOUT,
            FlowError::Database(_) | FlowError::Lock(_) => CODE_STORAGE,
            _ => CODE_GENERIC,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
