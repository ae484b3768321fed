//! Utility functions for the page cache
//!
//! This module provides the spin/yield/sleep backoff used by callers waiting
//! on a locked page reference, and small time helpers.

use std::thread;
use std::time::{Duration, Instant};

/// Number of yields before a stalled waiter starts sleeping
pub const BACKOFF_YIELD_LIMIT: u64 = 1000;

/// Longest single sleep of the backoff (10ms)
pub const BACKOFF_MAX_SLEEP_US: u64 = 10_000;

/// Spin, then yield, then sleep with exponentially growing delays.
///
/// Waits on a locked reference are expected to be short, so the first
/// `BACKOFF_YIELD_LIMIT` rounds only yield the processor. A caller that knows
/// it is stalled behind a slow operation can skip straight to sleeping with
/// [`Backoff::stall`].
#[derive(Debug, Default, Clone)]
pub struct Backoff {
    yield_count: u64,
    sleep_us: u64,
}

/// What a [`Backoff`] step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Yielded the processor
    Yield,
    /// Slept for the given number of microseconds
    Sleep(u64),
}

impl Backoff {
    /// Create a fresh backoff
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of yields performed so far
    pub fn yields(&self) -> u64 {
        self.yield_count
    }

    /// Current sleep duration in microseconds (0 while still yielding)
    pub fn sleep_us(&self) -> u64 {
        self.sleep_us
    }

    /// Whether the next step will sleep rather than yield
    pub fn is_sleeping(&self) -> bool {
        self.yield_count >= BACKOFF_YIELD_LIMIT
    }

    /// Skip the remaining yields; the next step sleeps.
    pub fn stall(&mut self) {
        self.yield_count = self.yield_count.max(BACKOFF_YIELD_LIMIT);
    }

    /// Compute the next step without performing it.
    pub fn next_step(&mut self) -> BackoffStep {
        if self.yield_count < BACKOFF_YIELD_LIMIT {
            self.yield_count += 1;
            return BackoffStep::Yield;
        }
        self.sleep_us = (self.sleep_us.saturating_mul(2)).clamp(1, BACKOFF_MAX_SLEEP_US);
        BackoffStep::Sleep(self.sleep_us)
    }

    /// Perform one backoff step.
    pub fn snooze(&mut self) -> BackoffStep {
        let step = self.next_step();
        match step {
            BackoffStep::Yield => thread::yield_now(),
            BackoffStep::Sleep(us) => thread::sleep(Duration::from_micros(us)),
        }
        step
    }
}

/// Milliseconds elapsed since `start`, saturating at `u64::MAX`
#[inline]
pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Parse a byte size with an optional `KB`/`MB`/`GB` (or `K`/`M`/`G`) suffix
pub fn parse_byte_size(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    let upper = trimmed.to_ascii_uppercase();
    let (digits, multiplier) = if let Some(d) = upper.strip_suffix("GB").or(upper.strip_suffix('G')) {
        (d, 1u64 << 30)
    } else if let Some(d) = upper.strip_suffix("MB").or(upper.strip_suffix('M')) {
        (d, 1u64 << 20)
    } else if let Some(d) = upper.strip_suffix("KB").or(upper.strip_suffix('K')) {
        (d, 1u64 << 10)
    } else if let Some(d) = upper.strip_suffix('B') {
        (d, 1)
    } else {
        (upper.as_str(), 1)
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_yields_then_sleeps() {
        let mut backoff = Backoff::new();
        for _ in 0..BACKOFF_YIELD_LIMIT {
            assert_eq!(backoff.next_step(), BackoffStep::Yield);
        }
        assert!(backoff.is_sleeping());
        assert_eq!(backoff.next_step(), BackoffStep::Sleep(1));
        assert_eq!(backoff.next_step(), BackoffStep::Sleep(2));
        assert_eq!(backoff.next_step(), BackoffStep::Sleep(4));
    }

    #[test]
    fn test_backoff_sleep_is_capped() {
        let mut backoff = Backoff::new();
        backoff.stall();
        let mut last = 0;
        for _ in 0..64 {
            if let BackoffStep::Sleep(us) = backoff.next_step() {
                last = us;
            }
        }
        assert_eq!(last, BACKOFF_MAX_SLEEP_US);
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("100"), Some(100));
        assert_eq!(parse_byte_size("4KB"), Some(4096));
        assert_eq!(parse_byte_size("2m"), Some(2 << 20));
        assert_eq!(parse_byte_size("1GB"), Some(1 << 30));
        assert_eq!(parse_byte_size("abc"), None);
    }
}
