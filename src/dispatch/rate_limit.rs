use std::time::{Duration, Instant};

pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Per-minute send budget for rate-limited sessions.
#[derive(Debug, Clone)]
pub struct RateWindow {
    limit: usize,
    window: Duration,
    started: Option<Instant>,
    sent: usize,
}

impl RateWindow {
    pub fn per_minute(limit: usize) -> Self {
        Self::new(limit, RATE_WINDOW)
    }

    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            started: None,
            sent: 0,
        }
    }

    /// Reserve `count` items at `now`.
    ///
    /// Returns `None` once the items are booked, or how long to wait before
    /// asking again. A chunk larger than the whole budget is let through at
    /// the start of a fresh window.
    pub fn reserve(&mut self, now: Instant, count: usize) -> Option<Duration> {
        let started = match self.started {
            Some(started) if now.saturating_duration_since(started) < self.window => started,
            _ => {
                self.started = Some(now);
                self.sent = 0;
                now
            }
        };

        if self.sent == 0 || self.sent + count <= self.limit {
            self.sent += count;
            return None;
        }
        Some((started + self.window).saturating_duration_since(now))
    }

    pub fn sent_in_window(&self) -> usize {
        self.sent
    }
}
