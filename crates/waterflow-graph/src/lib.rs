//! Node graph and flow runtime.
//!
//! A [`FlowBuilder`] composes start, state, condition, parallel/join and
//! end nodes into a [`Flow`]. Offering data to a flow creates execution
//! contexts at the start node and pushes them through the graph, persisting
//! every status change through the [`FlowStore`] collaborators.

pub mod builder;
pub mod flow;
pub mod node;
pub mod operator;
pub mod window;

pub use builder::FlowBuilder;
pub use flow::{DispatchToken, Flow, FlowErrorCallback, FlowStore, OfferReceipt, SuccessCallback};
pub use node::{ErrorDecision, FlowNode, NodeId, NodeKind};
pub use operator::{Operator, ProcessScope};
pub use window::{JoinMode, JoinOutcome, WindowSpec, WindowTokens};
