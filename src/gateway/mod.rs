use crate::core::{ConsistencyLevel, ObjectWrite, ReferenceWrite, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

mod in_memory;

pub use in_memory::{InMemoryGateway, StoredObject};

/// Per-item errors of an accepted batch, keyed by index in the sent batch.
/// Indexes that are absent succeeded.
pub type ItemErrors = BTreeMap<usize, String>;

/// Batch queue telemetry reported by the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ClusterStatus {
    /// Objects waiting in the server-side batch queue.
    pub queue_length: u64,
    /// Objects the server processes per second.
    pub rate_per_second: f64,
    /// Server workers consuming the batch queue.
    pub worker_count: usize,
}

/// Transport to the object store.
///
/// Implementations own serialization, timeouts and authentication. A batch that
/// could not be delivered at all must fail with
/// [`BatchError::Transport`](crate::BatchError::Transport); per-item rejections
/// of a delivered batch are returned as [`ItemErrors`].
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Upserts a batch of objects.
    async fn send_objects(
        &self,
        objects: &[ObjectWrite],
        consistency: Option<ConsistencyLevel>,
    ) -> Result<ItemErrors>;

    /// Adds a batch of cross-references.
    async fn send_references(
        &self,
        references: &[ReferenceWrite],
        consistency: Option<ConsistencyLevel>,
    ) -> Result<ItemErrors>;

    /// Reports batch queue congestion, or `None` when the server does not
    /// publish such telemetry.
    async fn cluster_status(&self) -> Result<Option<ClusterStatus>> {
        Ok(None)
    }
}
