pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod lock;
pub mod policy;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use definition::{FlowDefinition, NodeDefinition, NodeType};
pub use error::{FlowError, Result};
pub use event::{EventBus, FlowEvent};
pub use policy::RetryPolicy;
pub use types::*;
