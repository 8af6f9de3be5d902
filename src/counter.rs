//! Transfer rate accounting.
//!
//! Each torrent session keeps one [`RateMeasurer`] per direction. Bytes are
//! recorded as they move; the torrent's update tick rolls the measurer over
//! once at least a second has passed, producing the last-second rate and a
//! short running average that the bandwidth limiter reads.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// The number of completed measurement rounds the running average spans.
const RATE_WINDOW: usize = 10;

/// A sliding window rate measurer: cumulative total, the rate of the last
/// completed round and the average over the last [`RATE_WINDOW`] rounds.
pub(crate) struct RateMeasurer {
    /// All bytes ever recorded.
    total: u64,
    /// Bytes recorded since the current round started.
    round: u64,
    /// When the current round started.
    round_start: Instant,
    /// The rate of the last completed round, in bytes per second.
    rate: u64,
    /// The rates of the last completed rounds, newest at the back.
    history: VecDeque<u64>,
    /// The published running average, shared with the rate limiters.
    avg: Arc<AtomicU64>,
}

impl RateMeasurer {
    pub fn new() -> Self {
        Self {
            total: 0,
            round: 0,
            round_start: Instant::now(),
            rate: 0,
            history: VecDeque::with_capacity(RATE_WINDOW),
            avg: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records transferred bytes into the current round.
    pub fn record(&mut self, bytes: u64) {
        self.total += bytes;
        self.round += bytes;
    }

    /// Rolls the measurement round over if at least a second has passed since
    /// the last roll. Called from the torrent's update tick, which runs more
    /// often than once a second.
    pub fn update(&mut self) {
        let elapsed = self.round_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.complete_round(elapsed);
        }
    }

    fn complete_round(&mut self, elapsed: Duration) {
        self.rate = (self.round as f64 / elapsed.as_secs_f64()).round() as u64;
        if self.history.len() == RATE_WINDOW {
            self.history.pop_front();
        }
        self.history.push_back(self.rate);
        self.round = 0;
        self.round_start = Instant::now();

        let avg = self.history.iter().sum::<u64>() / self.history.len() as u64;
        self.avg.store(avg, Ordering::Relaxed);
    }

    /// The rate of the last completed round, in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// The average rate over the last completed rounds, in bytes per second.
    pub fn avg_rate(&self) -> u64 {
        self.avg.load(Ordering::Relaxed)
    }

    /// A shared handle to the running average, for the bandwidth limiter.
    pub fn avg_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.avg)
    }

    /// All bytes recorded since creation or the last reset.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Clears all recorded state. Done when a torrent session (re)starts so
    /// rates don't carry over between runs.
    pub fn reset(&mut self) {
        self.total = 0;
        self.round = 0;
        self.round_start = Instant::now();
        self.rate = 0;
        self.history.clear();
        self.avg.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_produces_per_second_rate() {
        let mut measurer = RateMeasurer::new();
        measurer.record(1000);
        measurer.record(1000);
        measurer.complete_round(Duration::from_secs(2));

        assert_eq!(measurer.rate(), 1000);
        assert_eq!(measurer.avg_rate(), 1000);
        assert_eq!(measurer.total(), 2000);
    }

    #[test]
    fn test_average_spans_window() {
        let mut measurer = RateMeasurer::new();
        // RATE_WINDOW rounds at 100 B/s, then one at 1200 B/s: the oldest
        // round falls out of the window
        for _ in 0..RATE_WINDOW {
            measurer.record(100);
            measurer.complete_round(Duration::from_secs(1));
        }
        assert_eq!(measurer.avg_rate(), 100);

        measurer.record(1200);
        measurer.complete_round(Duration::from_secs(1));
        assert_eq!(measurer.rate(), 1200);
        assert_eq!(
            measurer.avg_rate(),
            (9 * 100 + 1200) / RATE_WINDOW as u64
        );
    }

    #[test]
    fn test_idle_rounds_decay_average() {
        let mut measurer = RateMeasurer::new();
        measurer.record(500);
        measurer.complete_round(Duration::from_secs(1));
        assert_eq!(measurer.avg_rate(), 500);

        measurer.complete_round(Duration::from_secs(1));
        assert_eq!(measurer.rate(), 0);
        assert_eq!(measurer.avg_rate(), 250);
    }

    #[test]
    fn test_reset() {
        let mut measurer = RateMeasurer::new();
        let avg = measurer.avg_handle();
        measurer.record(500);
        measurer.complete_round(Duration::from_secs(1));
        assert!(avg.load(Ordering::Relaxed) > 0);

        measurer.reset();
        assert_eq!(measurer.total(), 0);
        assert_eq!(measurer.rate(), 0);
        assert_eq!(avg.load(Ordering::Relaxed), 0);
    }
}
