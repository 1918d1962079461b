//! Recommended batch sizes and the rules that move them.

use crate::config::BatchConfig;
use crate::gateway::ClusterStatus;
use crate::result::BatchResult;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

mod strategy;
mod throughput;

pub use strategy::{
    CongestionAwareStrategy, FixedStrategy, ReactiveStrategy, SizingStrategy,
    congestion_size, halve, reactive_object_size, reactive_reference_size,
};
pub use throughput::{THROUGHPUT_WINDOW, ThroughputWindow};

/// Size restored when the monitor stops while the server had asked to pause,
/// so a final flush cannot wait forever.
pub const RESUME_BATCH_SIZE: usize = 10;

/// Queue category a size applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchCategory {
    Objects,
    References,
}

impl std::fmt::Display for BatchCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Objects => write!(f, "objects"),
            Self::References => write!(f, "references"),
        }
    }
}

/// Which sizing rule is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMode {
    Fixed,
    Reactive,
    CongestionAware,
}

impl std::fmt::Display for SizingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Reactive => write!(f, "reactive"),
            Self::CongestionAware => write!(f, "congestion-aware"),
        }
    }
}

/// Mutable sizing data. Only strategies running under the controller lock
/// write to it.
#[derive(Debug, Clone)]
pub struct SizeState {
    object_batch_size: usize,
    reference_batch_size: usize,
    object_throughput: ThroughputWindow,
    reference_throughput: ThroughputWindow,
}

impl SizeState {
    fn new(object_batch_size: usize, reference_batch_size: usize) -> Self {
        Self {
            object_batch_size,
            reference_batch_size,
            object_throughput: ThroughputWindow::default(),
            reference_throughput: ThroughputWindow::default(),
        }
    }

    pub fn size(&self, category: BatchCategory) -> usize {
        match category {
            BatchCategory::Objects => self.object_batch_size,
            BatchCategory::References => self.reference_batch_size,
        }
    }

    pub fn set_size(&mut self, category: BatchCategory, size: usize) {
        match category {
            BatchCategory::Objects => self.object_batch_size = size,
            BatchCategory::References => self.reference_batch_size = size,
        }
    }

    pub fn throughput(&self, category: BatchCategory) -> &ThroughputWindow {
        match category {
            BatchCategory::Objects => &self.object_throughput,
            BatchCategory::References => &self.reference_throughput,
        }
    }

    fn throughput_mut(&mut self, category: BatchCategory) -> &mut ThroughputWindow {
        match category {
            BatchCategory::Objects => &mut self.object_throughput,
            BatchCategory::References => &mut self.reference_throughput,
        }
    }
}

/// Point-in-time copy of the controller's state.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeSnapshot {
    pub object_batch_size: usize,
    pub reference_batch_size: usize,
    pub mode: SizingMode,
    pub object_throughput: Option<f64>,
    pub reference_throughput: Option<f64>,
}

struct SizeInner {
    state: SizeState,
    strategy: Box<dyn SizingStrategy>,
}

/// Owner of the recommended batch sizes.
///
/// Shared through `Arc` by the flush path and the congestion monitor; every
/// update runs under one lock so the two never lose each other's writes.
pub struct SizeController {
    inner: Mutex<SizeInner>,
    target_batch_window: Duration,
}

impl std::fmt::Debug for SizeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeController")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl SizeController {
    fn with_strategy(
        initial_size: usize,
        target_batch_window: Duration,
        strategy: Box<dyn SizingStrategy>,
    ) -> Self {
        Self {
            inner: Mutex::new(SizeInner {
                state: SizeState::new(initial_size, initial_size),
                strategy,
            }),
            target_batch_window,
        }
    }

    /// Sizes never change.
    pub fn fixed(size: usize) -> Self {
        Self::with_strategy(size, Duration::from_secs(2), Box::new(FixedStrategy))
    }

    /// Local throughput rule only.
    pub fn reactive(initial_size: usize, target_batch_window: Duration) -> Self {
        Self::with_strategy(
            initial_size,
            target_batch_window,
            Box::new(ReactiveStrategy {
                target_batch_window,
            }),
        )
    }

    /// Server telemetry rule; falls back to [`reactive`](Self::reactive) when
    /// the server has no telemetry.
    pub fn congestion_aware(initial_size: usize, target_batch_window: Duration) -> Self {
        Self::with_strategy(
            initial_size,
            target_batch_window,
            Box::new(CongestionAwareStrategy),
        )
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        match config.fixed_batch_size() {
            Some(size) => Self::fixed(size),
            None => Self::congestion_aware(
                config.initial_batch_size,
                config.target_batch_window_duration(),
            ),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SizeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn size(&self, category: BatchCategory) -> usize {
        self.lock().state.size(category)
    }

    pub fn object_batch_size(&self) -> usize {
        self.size(BatchCategory::Objects)
    }

    pub fn reference_batch_size(&self) -> usize {
        self.size(BatchCategory::References)
    }

    /// `(objects, references)` read under one lock.
    pub fn sizes(&self) -> (usize, usize) {
        let inner = self.lock();
        (
            inner.state.size(BatchCategory::Objects),
            inner.state.size(BatchCategory::References),
        )
    }

    pub fn mode(&self) -> SizingMode {
        self.lock().strategy.mode()
    }

    pub fn snapshot(&self) -> SizeSnapshot {
        let inner = self.lock();
        SizeSnapshot {
            object_batch_size: inner.state.size(BatchCategory::Objects),
            reference_batch_size: inner.state.size(BatchCategory::References),
            mode: inner.strategy.mode(),
            object_throughput: inner.state.throughput(BatchCategory::Objects).average(),
            reference_throughput: inner.state.throughput(BatchCategory::References).average(),
        }
    }

    /// True while the server asked producers to stop sending.
    pub fn is_overloaded(&self) -> bool {
        let (objects, references) = self.sizes();
        objects == 0 || references == 0
    }

    /// Feed a finished gateway call into the active rule.
    pub fn record_result<T>(&self, category: BatchCategory, result: &BatchResult<T>) {
        if result.transport_failure {
            self.record_transport_failure(category);
        } else {
            self.record_success(category, result.throughput());
        }
    }

    /// A batch went through at `items_per_second` (if measurable).
    pub fn record_success(&self, category: BatchCategory, items_per_second: Option<f64>) {
        let mut inner = self.lock();
        let SizeInner { state, strategy } = &mut *inner;
        if let Some(sample) = items_per_second {
            state.throughput_mut(category).push(sample);
        }
        strategy.after_success(state, category);
    }

    /// A batch failed as a whole; back off.
    pub fn record_transport_failure(&self, category: BatchCategory) {
        let mut inner = self.lock();
        let SizeInner { state, strategy } = &mut *inner;
        strategy.after_transport_failure(state, category);
    }

    /// New telemetry from the server, `concurrency` being the client worker count.
    pub fn apply_cluster_status(&self, status: &ClusterStatus, concurrency: usize) {
        let mut inner = self.lock();
        let SizeInner { state, strategy } = &mut *inner;
        strategy.apply_cluster_status(state, status, concurrency);
    }

    /// Switch a congestion-aware controller to the reactive rule for good.
    ///
    /// Returns false when the controller was not congestion-aware.
    pub fn fall_back_to_reactive(&self) -> bool {
        let mut inner = self.lock();
        if inner.strategy.mode() != SizingMode::CongestionAware {
            return false;
        }
        inner.strategy = Box::new(ReactiveStrategy {
            target_batch_window: self.target_batch_window,
        });
        true
    }

    /// Lift any zero size to [`RESUME_BATCH_SIZE`].
    pub fn release_backpressure(&self) {
        let mut inner = self.lock();
        for category in [BatchCategory::Objects, BatchCategory::References] {
            if inner.state.size(category) == 0 {
                inner.state.set_size(category, RESUME_BATCH_SIZE);
            }
        }
    }
}
