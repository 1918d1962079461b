use crate::core::{BatchError, BatchItem, ObjectWrite, ReferenceWrite};
use crate::gateway::ItemErrors;
use crate::queue::Pending;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Why an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The whole batch never reached the store.
    Transport,
    /// The store received the batch and rejected this item.
    Application,
}

/// One failed item, carrying the original operation so it can be retried.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure<T> {
    pub message: String,
    pub kind: FailureKind,
    pub operation: T,
    /// Zero-based delivery attempt that produced this failure.
    pub attempt: u32,
}

impl<T> BatchFailure<T> {
    pub fn is_transport(&self) -> bool {
        self.kind == FailureKind::Transport
    }
}

/// Outcome of a single gateway call.
#[derive(Debug, Clone)]
pub struct BatchResult<T> {
    pub elapsed: Duration,
    /// Ids of succeeded items, keyed by index in the sent batch.
    pub uuids: BTreeMap<usize, Uuid>,
    /// Failed items, keyed by index in the sent batch.
    pub errors: BTreeMap<usize, BatchFailure<T>>,
    /// Set when the call failed as a whole.
    pub transport_failure: bool,
}

impl<T: BatchItem> BatchResult<T> {
    /// Builds the result of a delivered batch from the per-item errors.
    pub fn from_item_errors(
        batch: &[Pending<T>],
        mut item_errors: ItemErrors,
        elapsed: Duration,
    ) -> Self {
        let mut uuids = BTreeMap::new();
        let mut errors = BTreeMap::new();

        for (index, pending) in batch.iter().enumerate() {
            match item_errors.remove(&index) {
                Some(message) => {
                    errors.insert(
                        index,
                        BatchFailure {
                            message,
                            kind: FailureKind::Application,
                            operation: pending.operation.clone(),
                            attempt: pending.attempt,
                        },
                    );
                }
                None => {
                    uuids.insert(index, pending.operation.item_uuid());
                }
            }
        }

        Self {
            elapsed,
            uuids,
            errors,
            transport_failure: false,
        }
    }

    /// Every item of `batch` failed with the same transport error.
    pub fn from_transport_error(
        batch: &[Pending<T>],
        error: &BatchError,
        elapsed: Duration,
    ) -> Self {
        let message = error.to_string();
        let errors = batch
            .iter()
            .enumerate()
            .map(|(index, pending)| {
                (
                    index,
                    BatchFailure {
                        message: message.clone(),
                        kind: FailureKind::Transport,
                        operation: pending.operation.clone(),
                        attempt: pending.attempt,
                    },
                )
            })
            .collect();

        Self {
            elapsed,
            uuids: BTreeMap::new(),
            errors,
            transport_failure: true,
        }
    }
}

impl<T> BatchResult<T> {
    /// Number of items in the batch.
    pub fn count(&self) -> usize {
        self.uuids.len() + self.errors.len()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Items per second for this call, if measurable.
    pub fn throughput(&self) -> Option<f64> {
        let seconds = self.elapsed.as_secs_f64();
        (seconds > 0.0 && !self.transport_failure).then(|| self.count() as f64 / seconds)
    }
}

/// Everything a batch session produced.
///
/// Failures listed here are permanent: they were not retried, or ran out of
/// attempts. Items that failed once and later went through only appear as
/// successes.
#[derive(Debug, Clone)]
pub struct BatchResults {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub object_uuids: Vec<Uuid>,
    pub references_added: usize,
    pub failed_objects: Vec<BatchFailure<ObjectWrite>>,
    pub failed_references: Vec<BatchFailure<ReferenceWrite>>,
    /// Gateway calls made, retries included.
    pub batches: usize,
}

impl Default for BatchResults {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchResults {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            object_uuids: Vec::new(),
            references_added: 0,
            failed_objects: Vec::new(),
            failed_references: Vec::new(),
            batches: 0,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.failed_objects.is_empty() || !self.failed_references.is_empty()
    }

    pub(crate) fn record_objects(
        &mut self,
        result: &BatchResult<ObjectWrite>,
        abandoned: Vec<BatchFailure<ObjectWrite>>,
    ) {
        self.batches += 1;
        self.object_uuids.extend(result.uuids.values().copied());
        self.failed_objects.extend(abandoned);
    }

    pub(crate) fn record_references(
        &mut self,
        result: &BatchResult<ReferenceWrite>,
        abandoned: Vec<BatchFailure<ReferenceWrite>>,
    ) {
        self.batches += 1;
        self.references_added += result.uuids.len();
        self.failed_references.extend(abandoned);
    }

    pub(crate) fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

impl std::fmt::Display for BatchResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Batch results: {} objects, {} references added, {} failed objects, \
             {} failed references in {} batches",
            self.object_uuids.len(),
            self.references_added,
            self.failed_objects.len(),
            self.failed_references.len(),
            self.batches
        )
    }
}
