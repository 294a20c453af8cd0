//! Rolling throughput counters.
//!
//! A peer session tracks how many bytes it has downloaded recently in order
//! to report per-peer transfer rates and, eventually, feed an optimal
//! request-queue-length estimate based on the bandwidth-delay product. This
//! is deliberately the simplest thing that could work: a one-second
//! tumbling window rather than a weighted moving average, since nothing
//! downstream yet consumes sub-second precision.

use std::time::{Duration, Instant};

/// Accumulates byte counts and periodically folds them into a per-second
/// rate.
#[derive(Debug, Clone)]
pub(crate) struct ThroughputCounter {
    /// Bytes counted in the window that is currently being filled.
    round_count: u64,
    /// The rate, in bytes per second, as of the last completed window.
    rate: u64,
    /// Total bytes counted over the counter's lifetime.
    total: u64,
    /// When the current window started.
    window_start: Instant,
}

impl ThroughputCounter {
    /// The length of one counting window.
    const WINDOW: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self {
            round_count: 0,
            rate: 0,
            total: 0,
            window_start: Instant::now(),
        }
    }

    /// Records `byte_count` additional bytes transferred just now.
    pub fn update(&mut self, byte_count: u64) {
        self.round_count += byte_count;
        self.total += byte_count;
        self.maybe_roll_window();
    }

    /// Returns the most recently measured bytes-per-second rate.
    pub fn rate(&mut self) -> u64 {
        self.maybe_roll_window();
        self.rate
    }

    /// Returns the lifetime total of bytes recorded by this counter.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// If the current window has elapsed, folds it into `rate` and starts a
    /// fresh one. Called lazily on both read and write so the counter needs
    /// no background timer of its own.
    fn maybe_roll_window(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed >= Self::WINDOW {
            let windows = (elapsed.as_secs_f64() / Self::WINDOW.as_secs_f64()).max(1.0);
            self.rate = (self.round_count as f64 / windows) as u64;
            self.round_count = 0;
            self.window_start = Instant::now();
        }
    }
}
