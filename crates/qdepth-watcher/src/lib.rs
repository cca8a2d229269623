//! qdepth-watcher — per-deployment queue watchers and their registry.
//!
//! A [`Watcher`] samples one job queue and one deployment on a fixed
//! interval and records scale intents in the operation store. The
//! [`WatcherRegistry`] starts and stops watchers as deployment definitions
//! appear and disappear.

pub mod error;
pub mod registry;
pub mod watcher;

pub use error::{RegistryError, RegistryResult};
pub use registry::{AddOutcome, WatcherDirectory, WatcherInfo, WatcherRegistry, WatcherSettings};
pub use watcher::{DepthSample, ScaleIntents, TickOutcome, Watcher, evaluate};
