//! # Fibonacci Backoff
//!
//! Provides a Fibonacci-based backoff mechanism for retries.
//! The sequence grows more slowly than exponential backoff, which suits
//! optimistic-concurrency retries where the competing writer usually finishes
//! quickly.
//!
//! Sequence for `new(1s, 10s)`: 1s, 1s, 2s, 3s, 5s, 8s, 10s (max).

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at the maximum.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Previous backoff value
    prev: Duration,
    /// Current backoff value
    current: Duration,
    /// Maximum backoff value
    max: Duration,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with the given minimum and maximum
    ///
    /// # Arguments
    ///
    /// * `min` - Minimum backoff (used for the first two values)
    /// * `max` - Maximum backoff (caps the sequence)
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            prev: Duration::ZERO,
            current: min,
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;

        let next = self.prev + self.current;
        self.prev = self.current;
        self.current = std::cmp::min(next, self.max);

        result
    }
}
