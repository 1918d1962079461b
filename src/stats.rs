use crate::result::BatchResult;
use crate::sizing::{BatchCategory, SizeController, SizingMode};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Live counters of a batch session, updated by flush tasks and the monitor.
#[derive(Debug, Default)]
pub struct BatchCounters {
    flushes: AtomicUsize,
    objects_sent: AtomicUsize,
    objects_succeeded: AtomicUsize,
    objects_failed: AtomicUsize,
    references_sent: AtomicUsize,
    references_succeeded: AtomicUsize,
    references_failed: AtomicUsize,
    transport_failures: AtomicUsize,
    requeued: AtomicUsize,
    abandoned: AtomicUsize,
    monitor_polls: AtomicUsize,
    monitor_errors: AtomicUsize,
    backpressure_waits: AtomicUsize,
}

impl BatchCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A flush pass drained at least one item.
    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_batch<T>(&self, category: BatchCategory, result: &BatchResult<T>) {
        let (sent, succeeded, failed) = match category {
            BatchCategory::Objects => (
                &self.objects_sent,
                &self.objects_succeeded,
                &self.objects_failed,
            ),
            BatchCategory::References => (
                &self.references_sent,
                &self.references_succeeded,
                &self.references_failed,
            ),
        };
        sent.fetch_add(result.count(), Ordering::SeqCst);
        succeeded.fetch_add(result.uuids.len(), Ordering::SeqCst);
        failed.fetch_add(result.errors.len(), Ordering::SeqCst);
        if result.transport_failure {
            self.transport_failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn record_requeue(&self, requeued: usize, abandoned: usize) {
        self.requeued.fetch_add(requeued, Ordering::SeqCst);
        self.abandoned.fetch_add(abandoned, Ordering::SeqCst);
    }

    pub fn record_monitor_poll(&self) {
        self.monitor_polls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_monitor_error(&self) {
        self.monitor_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_backpressure_wait(&self) {
        self.backpressure_waits.fetch_add(1, Ordering::SeqCst);
    }

    pub fn monitor_errors(&self) -> usize {
        self.monitor_errors.load(Ordering::SeqCst)
    }

    /// Point-in-time statistics, including the sizes currently recommended.
    pub fn snapshot(&self, sizes: &SizeController) -> BatchStats {
        let sizing = sizes.snapshot();
        BatchStats {
            flushes: self.flushes.load(Ordering::SeqCst),
            objects_sent: self.objects_sent.load(Ordering::SeqCst),
            objects_succeeded: self.objects_succeeded.load(Ordering::SeqCst),
            objects_failed: self.objects_failed.load(Ordering::SeqCst),
            references_sent: self.references_sent.load(Ordering::SeqCst),
            references_succeeded: self.references_succeeded.load(Ordering::SeqCst),
            references_failed: self.references_failed.load(Ordering::SeqCst),
            transport_failures: self.transport_failures.load(Ordering::SeqCst),
            requeued: self.requeued.load(Ordering::SeqCst),
            abandoned: self.abandoned.load(Ordering::SeqCst),
            monitor_polls: self.monitor_polls.load(Ordering::SeqCst),
            monitor_errors: self.monitor_errors.load(Ordering::SeqCst),
            backpressure_waits: self.backpressure_waits.load(Ordering::SeqCst),
            object_batch_size: sizing.object_batch_size,
            reference_batch_size: sizing.reference_batch_size,
            sizing_mode: sizing.mode,
        }
    }
}

/// Batch session statistics
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStats {
    pub flushes: usize,
    pub objects_sent: usize,
    pub objects_succeeded: usize,
    pub objects_failed: usize,
    pub references_sent: usize,
    pub references_succeeded: usize,
    pub references_failed: usize,
    pub transport_failures: usize,
    pub requeued: usize,
    pub abandoned: usize,
    pub monitor_polls: usize,
    pub monitor_errors: usize,
    pub backpressure_waits: usize,
    pub object_batch_size: usize,
    pub reference_batch_size: usize,
    pub sizing_mode: SizingMode,
}

impl std::fmt::Display for BatchStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Batch Stats: {} flushes, sizing {} (objects {}, references {})",
            self.flushes, self.sizing_mode, self.object_batch_size, self.reference_batch_size
        )?;
        writeln!(
            f,
            "  objects:    {} sent, {} ok, {} failed",
            self.objects_sent, self.objects_succeeded, self.objects_failed
        )?;
        writeln!(
            f,
            "  references: {} sent, {} ok, {} failed",
            self.references_sent, self.references_succeeded, self.references_failed
        )?;
        writeln!(
            f,
            "  retries:    {} transport failures, {} requeued, {} abandoned",
            self.transport_failures, self.requeued, self.abandoned
        )?;
        write!(
            f,
            "  monitor:    {} polls, {} errors, {} backpressure waits",
            self.monitor_polls, self.monitor_errors, self.backpressure_waits
        )
    }
}
