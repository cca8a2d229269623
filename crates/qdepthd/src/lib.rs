//! qdepthd — assembles the qdepth control loop.
//!
//! The binary in `main.rs` reads the config, builds the concrete adapters
//! and hands them to a [`ControlPlane`]. Everything below the adapters is
//! reachable from here so it can be driven with fakes in tests.

pub mod control;
pub mod host;
pub mod logging;

pub use control::{Collaborators, ControlPlane, RunningControlPlane};
