//! Services that run beside flows: re-delivery of retryable batches,
//! completeness reporting, and the registry tying stream ids to flows.

pub mod completeness;
pub mod registry;
pub mod retry;

pub use completeness::{CompletenessCalculator, CompletenessStatus, TraceCompleteness};
pub use registry::FlowRegistry;
pub use retry::{RetryReport, RetryScheduler, RetryService};
