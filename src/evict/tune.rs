//! Worker-count tuning
//!
//! The server samples eviction throughput once per tuning period. While
//! tuning, each sample adds workers until the maximum is reached or enough
//! samples were taken, then the count with the best throughput is kept. A
//! settled count is probed again after `force_retune_ms`, or earlier if
//! throughput falls below half of the best rate seen. Every search starts
//! from the minimum count: surplus workers are stopped first.

use std::time::Instant;

/// Samples taken before settling
pub const TUNE_DATAPT_MIN: u32 = 8;

/// Workers added per sample while tuning
pub const TUNE_BATCH: usize = 1;

/// What the server should do with the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneAction {
    /// Keep the current count
    Hold,
    /// Start this many more workers
    Add(usize),
    /// Tuning finished: run exactly this many workers
    Settle(usize),
    /// A new search starts: shrink the pool to this many workers
    Reset(usize),
}

/// Throughput-driven worker-count controller
#[derive(Debug)]
pub struct Tuner {
    min: usize,
    max: usize,
    period_ms: u64,
    force_retune_ms: u64,
    last_sample: Option<(Instant, u64)>,
    datapts: u32,
    rate_max: u64,
    best: usize,
    settled_at: Option<Instant>,
    start_pending: bool,
}

impl Tuner {
    /// Tune between `min` and `max` workers
    pub fn new(min: usize, max: usize, period_ms: u64, force_retune_ms: u64) -> Self {
        let min = min.max(1);
        Self {
            min,
            max: max.max(min),
            period_ms,
            force_retune_ms,
            last_sample: None,
            datapts: 0,
            rate_max: 0,
            best: min,
            settled_at: None,
            start_pending: true,
        }
    }

    /// Change the bounds, restarting tuning
    pub fn set_bounds(&mut self, min: usize, max: usize) {
        self.min = min.max(1);
        self.max = max.max(self.min);
        self.restart();
    }

    /// Settled worker count, if tuning has finished
    pub fn stable(&self) -> Option<usize> {
        self.settled_at.map(|_| self.best)
    }

    /// Best throughput seen, in pages per second
    pub fn rate_max(&self) -> u64 {
        self.rate_max
    }

    fn restart(&mut self) {
        self.datapts = 0;
        self.rate_max = 0;
        self.best = self.min;
        self.settled_at = None;
        self.start_pending = true;
    }

    /// Shrink to the minimum before the first sample of a search
    fn start_from_min(&mut self, current: usize) -> TuneAction {
        if !std::mem::take(&mut self.start_pending) || current == self.min {
            return TuneAction::Hold;
        }
        tracing::debug!(from = current, to = self.min, "restarting worker search");
        TuneAction::Reset(self.min)
    }

    fn settle(&mut self, now: Instant) -> TuneAction {
        self.settled_at = Some(now);
        tracing::debug!(
            workers = self.best,
            rate_max = self.rate_max,
            "eviction worker count settled"
        );
        TuneAction::Settle(self.best)
    }

    /// Record `progress` (pages evicted so far) with `current` workers
    /// running
    pub fn observe(&mut self, now: Instant, progress: u64, current: usize) -> TuneAction {
        if self.min == self.max {
            return TuneAction::Hold;
        }
        let Some((last_time, last_progress)) = self.last_sample else {
            self.last_sample = Some((now, progress));
            return TuneAction::Hold;
        };
        let elapsed_ms = u64::try_from(now.saturating_duration_since(last_time).as_millis())
            .unwrap_or(u64::MAX);
        if elapsed_ms < self.period_ms.max(1) {
            return TuneAction::Hold;
        }
        let rate = progress.saturating_sub(last_progress).saturating_mul(1000) / elapsed_ms;
        self.last_sample = Some((now, progress));

        if let Some(settled_at) = self.settled_at {
            let settled_ms = u64::try_from(now.saturating_duration_since(settled_at).as_millis())
                .unwrap_or(u64::MAX);
            if settled_ms >= self.force_retune_ms || rate < self.rate_max / 2 {
                tracing::debug!(rate, rate_max = self.rate_max, "retuning eviction workers");
                self.restart();
                return self.start_from_min(current);
            }
            return TuneAction::Hold;
        }

        let reset = self.start_from_min(current);
        if reset != TuneAction::Hold {
            return reset;
        }

        self.datapts += 1;
        if rate > self.rate_max || self.datapts == 1 {
            self.rate_max = self.rate_max.max(rate);
            self.best = current.clamp(self.min, self.max);
        }
        if self.datapts >= TUNE_DATAPT_MIN || current >= self.max {
            return self.settle(now);
        }
        TuneAction::Add(TUNE_BATCH.min(self.max.saturating_sub(current)))
    }
}
