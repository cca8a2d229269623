//! Operation types held by the store.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tokio::time::Instant;

use qdepth_core::{ScaleOp, WatcherId};

/// Unique identifier for a scale operation.
pub type OperationId = String;

/// The defining content of an operation. Two operations with equal data
/// share a fingerprint.
///
/// Field order is part of the fingerprint: serde_json emits struct fields in
/// declaration order, which keeps the encoding canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationData {
    /// Watcher that derived this intent.
    pub watcher: WatcherId,
    pub op: ScaleOp,
    /// Job type the intent was derived from.
    pub queue: String,
}

impl OperationData {
    pub fn new(watcher: impl Into<WatcherId>, op: ScaleOp, queue: impl Into<String>) -> Self {
        Self {
            watcher: watcher.into(),
            op,
            queue: queue.into(),
        }
    }

    /// Hex SHA-512 digest of the canonical JSON encoding.
    pub fn fingerprint(&self) -> String {
        // Serializing a struct of strings and a unit enum cannot fail.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha512::digest(&canonical))
    }
}

/// A pending or promoted scale operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleOperation {
    pub id: OperationId,
    pub data: OperationData,
    pub fingerprint: String,
    pub created_at: Instant,
    /// Last time a watcher re-affirmed this intent.
    pub updated_at: Instant,
    /// Age at which the operation becomes executable.
    pub promote_after: Duration,
    /// Idle time after which an unpromoted operation is dropped.
    pub expire_after: Duration,
    /// Set once the operation has moved to the ready set. Never cleared.
    pub promoted: bool,
}

impl ScaleOperation {
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.updated_at) > self.expire_after
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.promote_after
    }
}
