use std::collections::VecDeque;

/// Number of recent flush measurements averaged by the reactive rule.
pub const THROUGHPUT_WINDOW: usize = 5;

/// Moving window of items-per-second samples.
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self::with_capacity(THROUGHPUT_WINDOW)
    }
}

impl ThroughputWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Adds a sample, evicting the oldest once full. Non-finite and negative
    /// samples are ignored.
    pub fn push(&mut self, items_per_second: f64) {
        if !items_per_second.is_finite() || items_per_second < 0.0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(items_per_second);
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
