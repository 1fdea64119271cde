//! Mocks and fixtures shared by the Waterflow test suites.

mod fixtures;
mod transport;

pub use fixtures::{
    branching_definition, context_at, linear_definition, temp_config, trace_with, TestStores,
};
pub use transport::MockTransport;
