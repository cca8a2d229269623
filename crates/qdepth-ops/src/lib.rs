//! qdepth-ops — the debounced operation store.
//!
//! Watchers record scale intents here; the store deduplicates them by
//! content, drops the ones that stop being re-affirmed, and promotes the
//! ones that persist long enough. The executor drains promoted operations.
//!
//! # Lifecycle
//!
//! ```text
//! create() ──► pending ──(age >= promote_after)──► promoted ──ready()──► executor ──finish()
//!                 │
//!                 └──(idle > expire_after)──► expired (deleted)
//! ```
//!
//! A pending operation is re-affirmed by calling `create()` again with the
//! same data. That refresh is what turns a single sample into a debounced
//! decision: the intent only promotes if the condition held for the whole
//! `promote_after` window without a gap longer than `expire_after`.

pub mod error;
pub mod store;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use store::{OperationDefaults, OperationStore, SweepHandle, SweepReport};
pub use types::{OperationData, OperationId, ScaleOperation};
