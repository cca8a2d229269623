//! qdepth-core — shared vocabulary for the qdepth autoscaler.
//!
//! Holds the domain types exchanged between the control-loop crates, the
//! capability traits for the broker, orchestrator and status sink, and the
//! `qdepth.toml` config parser.

pub mod config;
pub mod interfaces;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use config::{ConfigError, QdepthConfig, Timings};
pub use interfaces::{
    Broker, CollaboratorError, CollaboratorResult, Orchestrator, StatusSink, with_timeout,
};
pub use types::*;
