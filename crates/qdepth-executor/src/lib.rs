//! qdepth-executor — applies promoted scale operations.
//!
//! On every poll the executor drains the store's ready set, resolves each
//! operation's watcher to a deployment, and asks the orchestrator to add or
//! remove one replica. Every drained operation is finished whether or not
//! the call succeeded; a failed scale is not retried, the watcher will
//! record a fresh intent if the condition still holds.

pub mod executor;

pub use executor::{ExecutionOutcome, ExecutionReport, ScaleExecutor};
