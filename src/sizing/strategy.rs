use super::{BatchCategory, SizeState, SizingMode};
use crate::gateway::ClusterStatus;
use std::time::Duration;

/// Growth cap per reactive adjustment for object batches.
pub const OBJECT_GROWTH_CAP: usize = 250;
/// Share of measured throughput the reactive rule aims for.
pub const THROUGHPUT_HEADROOM: f64 = 0.75;
/// Largest step taken when the server queue is empty.
pub const EMPTY_QUEUE_STEP: usize = 25;
/// Congestion ratio at and above which sending stops.
pub const OVERLOAD_RATIO: f64 = 10.0;

/// Sizing rule applied by [`SizeController`](super::SizeController).
///
/// Implementations only rewrite sizes in the state handed to them; samples are
/// recorded by the controller before `after_success` runs.
pub trait SizingStrategy: Send + Sync + std::fmt::Debug {
    fn mode(&self) -> SizingMode;

    /// A batch of `category` went through (possibly with per-item errors).
    fn after_success(&self, state: &mut SizeState, category: BatchCategory);

    /// A batch of `category` failed as a whole.
    fn after_transport_failure(&self, state: &mut SizeState, category: BatchCategory);

    /// Fresh congestion telemetry from the server.
    fn apply_cluster_status(
        &self,
        state: &mut SizeState,
        status: &ClusterStatus,
        concurrency: usize,
    );
}

/// Sizes never move.
#[derive(Debug, Clone, Copy)]
pub struct FixedStrategy;

impl SizingStrategy for FixedStrategy {
    fn mode(&self) -> SizingMode {
        SizingMode::Fixed
    }

    fn after_success(&self, _state: &mut SizeState, _category: BatchCategory) {}

    fn after_transport_failure(&self, _state: &mut SizeState, _category: BatchCategory) {}

    fn apply_cluster_status(
        &self,
        _state: &mut SizeState,
        _status: &ClusterStatus,
        _concurrency: usize,
    ) {
    }
}

/// Local throughput measurements with halving on failure.
#[derive(Debug, Clone, Copy)]
pub struct ReactiveStrategy {
    pub target_batch_window: Duration,
}

impl SizingStrategy for ReactiveStrategy {
    fn mode(&self) -> SizingMode {
        SizingMode::Reactive
    }

    fn after_success(&self, state: &mut SizeState, category: BatchCategory) {
        let Some(average) = state.throughput(category).average() else {
            return;
        };
        let previous = state.size(category);
        let next = match category {
            BatchCategory::Objects => {
                reactive_object_size(previous, average, self.target_batch_window)
            }
            BatchCategory::References => {
                reactive_reference_size(previous, average, self.target_batch_window)
            }
        };
        state.set_size(category, next);
    }

    fn after_transport_failure(&self, state: &mut SizeState, category: BatchCategory) {
        let halved = halve(state.size(category));
        state.set_size(category, halved);
    }

    fn apply_cluster_status(
        &self,
        _state: &mut SizeState,
        _status: &ClusterStatus,
        _concurrency: usize,
    ) {
    }
}

/// Sizes follow the server's batch queue; local failures still halve.
#[derive(Debug, Clone, Copy)]
pub struct CongestionAwareStrategy;

impl SizingStrategy for CongestionAwareStrategy {
    fn mode(&self) -> SizingMode {
        SizingMode::CongestionAware
    }

    fn after_success(&self, _state: &mut SizeState, _category: BatchCategory) {}

    fn after_transport_failure(&self, state: &mut SizeState, category: BatchCategory) {
        let halved = halve(state.size(category));
        state.set_size(category, halved);
    }

    fn apply_cluster_status(
        &self,
        state: &mut SizeState,
        status: &ClusterStatus,
        concurrency: usize,
    ) {
        for category in [BatchCategory::Objects, BatchCategory::References] {
            let next = congestion_size(state.size(category), status, concurrency);
            state.set_size(category, next);
        }
    }
}

/// Backoff after a failed batch: half the size, never below one.
pub fn halve(size: usize) -> usize {
    (size / 2).max(1)
}

fn floor_to_size(value: f64) -> usize {
    if value.is_finite() && value > 0.0 {
        value.floor() as usize
    } else {
        0
    }
}

/// `max(1, min(floor(0.75 × throughput × window), previous + 250))`
pub fn reactive_object_size(previous: usize, average_throughput: f64, window: Duration) -> usize {
    let target = floor_to_size(THROUGHPUT_HEADROOM * average_throughput * window.as_secs_f64());
    target
        .min(previous.saturating_add(OBJECT_GROWTH_CAP))
        .max(1)
}

/// `max(1, min(floor(throughput × window), previous × 2))`
pub fn reactive_reference_size(
    previous: usize,
    average_throughput: f64,
    window: Duration,
) -> usize {
    let target = floor_to_size(average_throughput * window.as_secs_f64());
    target.min(previous.saturating_mul(2)).max(1)
}

/// Next batch size given the server's queue length and processing rate.
///
/// Returns 0 when the server asks producers to stop sending.
pub fn congestion_size(current: usize, status: &ClusterStatus, concurrency: usize) -> usize {
    if status.queue_length == 0 {
        let step = current.saturating_mul(2).min(EMPTY_QUEUE_STEP).max(1);
        return current.saturating_add(step);
    }

    let rate = status.rate_per_second;
    if !rate.is_finite() || rate <= 0.0 {
        return 0;
    }

    let ratio = status.queue_length as f64 / rate;
    let rate_per_worker = rate / concurrency.max(1) as f64;

    if ratio > 1.9 && ratio < 2.1 {
        floor_to_size(rate_per_worker)
    } else if ratio <= 1.9 {
        floor_to_size((current as f64 * 1.5).min(rate_per_worker * 2.0 / ratio))
    } else if ratio < OVERLOAD_RATIO {
        floor_to_size(rate_per_worker * 2.0 / ratio)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(queue_length: u64, rate_per_second: f64) -> ClusterStatus {
        ClusterStatus {
            queue_length,
            rate_per_second,
            worker_count: 1,
        }
    }

    #[test]
    fn halving_floors_at_one() {
        assert_eq!(halve(50), 25);
        assert_eq!(halve(3), 1);
        assert_eq!(halve(1), 1);
        assert_eq!(halve(0), 1);
    }

    #[test]
    fn reactive_object_growth_is_capped() {
        let window = Duration::from_secs(2);
        // 0.75 * 1000 * 2 = 1500, capped at 50 + 250.
        assert_eq!(reactive_object_size(50, 1000.0, window), 300);
        // 0.75 * 20 * 2 = 30, below the cap.
        assert_eq!(reactive_object_size(50, 20.0, window), 30);
        assert_eq!(reactive_object_size(50, 0.1, window), 1);
    }

    #[test]
    fn reactive_reference_growth_is_capped_by_doubling() {
        let window = Duration::from_secs(2);
        assert_eq!(reactive_reference_size(50, 1000.0, window), 100);
        assert_eq!(reactive_reference_size(50, 10.0, window), 20);
        assert_eq!(reactive_reference_size(0, 10.0, window), 1);
    }

    #[test]
    fn empty_server_queue_scales_up() {
        assert_eq!(congestion_size(5, &status(0, 100.0), 1), 15);
        assert_eq!(congestion_size(15, &status(0, 100.0), 1), 40);
        assert_eq!(congestion_size(0, &status(0, 100.0), 1), 1);
    }

    #[test]
    fn sustainable_backlog_matches_worker_rate() {
        // ratio 2.0, two client workers
        assert_eq!(congestion_size(10, &status(200, 100.0), 2), 50);
    }

    #[test]
    fn headroom_grows_by_at_most_half() {
        // ratio 1.0: min(40 * 1.5, 100 * 2 / 1) = 60
        assert_eq!(congestion_size(40, &status(100, 100.0), 1), 60);
        // ratio 1.0 with a slow server: min(60, 10 * 2) = 20
        assert_eq!(congestion_size(40, &status(10, 10.0), 1), 20);
    }

    #[test]
    fn congested_server_scales_down() {
        // ratio 4.0: 100 * 2 / 4 = 50
        assert_eq!(congestion_size(500, &status(400, 100.0), 1), 50);
        assert_eq!(congestion_size(500, &status(1_000, 100.0), 1), 0);
        assert_eq!(congestion_size(500, &status(5_000, 100.0), 1), 0);
        assert_eq!(congestion_size(500, &status(5, 0.0), 1), 0);
    }
}
