//! Jobers: pluggable business-logic execution for flow nodes.
//!
//! A jober runs one node's work against a batch of contexts. The node
//! declares a [`JoberSpec`]; per invocation the spec is resolved into an
//! immutable [`EffectiveConfig`] (payload overrides applied), inputs pass
//! through the node's [`ConverterSpec`], and a [`Jober`] strategy does the
//! actual call: in-process, over the RPC transport, through the HTTP
//! relay, or a plain echo.

pub mod config;
pub mod converter;
pub mod executor;
pub mod strategy;

pub use config::{EffectiveConfig, JoberKind, JoberSpec, KEY_JOBER_OVERRIDES};
pub use converter::ConverterSpec;
pub use executor::JoberNode;
pub use strategy::{EchoJober, HttpJober, Jober, LocalHandler, LocalJober, RpcJober};
