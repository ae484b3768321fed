//! Eviction statistics
//!
//! Counters are updated with relaxed atomics from any thread; gauges
//! (aggressiveness, worker counts, eviction state) are overwritten by the
//! thread that owns them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for eviction operations
#[derive(Debug, Default)]
pub struct EvictStats {
    /// Pages evicted by application threads
    pages_evicted_app: AtomicU64,
    /// Pages evicted by worker threads
    pages_evicted_worker: AtomicU64,
    /// Largest page footprint seen at eviction
    max_page_size: AtomicU64,
    /// Longest single page eviction in milliseconds
    max_evict_ms: AtomicU64,
    /// Pages read into the cache
    pages_read: AtomicU64,
    /// Page acquires
    pages_requested: AtomicU64,
    /// Acquires that waited for another thread's read
    read_blocked: AtomicU64,
    /// Acquires that waited for a locked reference
    locked_blocked: AtomicU64,
    /// Acquires that failed to pin a resident page
    busy_blocked: AtomicU64,
    /// Forced evictions that found the page busy
    forcible_evict_blocked: AtomicU64,
    /// Forced eviction attempts
    force_attempts: AtomicU64,
    /// Leaves split in memory
    pages_split: AtomicU64,
    /// Pages written but kept resident
    pages_scrubbed: AtomicU64,
    /// Eviction attempts that failed
    evict_failures: AtomicU64,
    /// Workers that found every queue empty
    queue_empty: AtomicU64,
    /// Pages added to the urgent queue
    urgent_queued: AtomicU64,
    /// Application threads that waited for cache space
    app_waits: AtomicU64,
    /// Microseconds acquires spent sleeping
    page_sleep_us: AtomicU64,
    /// Server passes
    passes: AtomicU64,
    /// Candidates queued by walks
    walk_queued: AtomicU64,
    /// Aggressiveness score
    aggressive_score: AtomicU64,
    /// Empty-queue score
    empty_score: AtomicU64,
    /// Worker threads running
    active_workers: AtomicU64,
    /// Worker count settled on by tuning, 0 until settled
    stable_workers: AtomicU64,
    /// Walks in progress
    active_walks: AtomicU64,
    /// Last computed eviction state flags
    cache_eviction_state: AtomicU64,
}

/// Point-in-time copy of [`EvictStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct EvictStatsSnapshot {
    pub pages_evicted_app: u64,
    pub pages_evicted_worker: u64,
    pub max_page_size: u64,
    pub max_evict_ms: u64,
    pub pages_read: u64,
    pub pages_requested: u64,
    pub read_blocked: u64,
    pub locked_blocked: u64,
    pub busy_blocked: u64,
    pub forcible_evict_blocked: u64,
    pub force_attempts: u64,
    pub pages_split: u64,
    pub pages_scrubbed: u64,
    pub evict_failures: u64,
    pub queue_empty: u64,
    pub urgent_queued: u64,
    pub app_waits: u64,
    pub page_sleep_us: u64,
    pub passes: u64,
    pub walk_queued: u64,
    pub aggressive_score: u64,
    pub empty_score: u64,
    pub active_workers: u64,
    pub stable_workers: u64,
    pub active_walks: u64,
    pub cache_eviction_state: u64,
}

impl EvictStatsSnapshot {
    /// Pages evicted by any thread
    pub fn pages_evicted(&self) -> u64 {
        self.pages_evicted_app + self.pages_evicted_worker
    }
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl EvictStats {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a page eviction
    pub fn record_eviction(&self, by_app: bool, footprint: u64, elapsed_ms: u64) {
        if by_app {
            bump(&self.pages_evicted_app);
        } else {
            bump(&self.pages_evicted_worker);
        }
        self.max_page_size.fetch_max(footprint, Ordering::Relaxed);
        self.max_evict_ms.fetch_max(elapsed_ms, Ordering::Relaxed);
    }

    /// Record a page read into the cache
    pub fn record_page_read(&self) {
        bump(&self.pages_read);
    }

    /// Record a page acquire
    pub fn record_page_requested(&self) {
        bump(&self.pages_requested);
    }

    /// Record a wait behind another thread's read
    pub fn record_read_blocked(&self) {
        bump(&self.read_blocked);
    }

    /// Record a wait behind a locked reference
    pub fn record_locked_blocked(&self) {
        bump(&self.locked_blocked);
    }

    /// Record a failed pin
    pub fn record_busy_blocked(&self) {
        bump(&self.busy_blocked);
    }

    /// Record a busy forced eviction
    pub fn record_forcible_evict_blocked(&self) {
        bump(&self.forcible_evict_blocked);
    }

    /// Record a forced eviction attempt
    pub fn record_force_attempt(&self) {
        bump(&self.force_attempts);
    }

    /// Record an in-memory split
    pub fn record_split(&self) {
        bump(&self.pages_split);
    }

    /// Record a page written and kept resident
    pub fn record_scrub(&self) {
        bump(&self.pages_scrubbed);
    }

    /// Record a failed eviction
    pub fn record_failure(&self) {
        bump(&self.evict_failures);
    }

    /// Record a worker finding no candidates
    pub fn record_queue_empty(&self) {
        bump(&self.queue_empty);
    }

    /// Record an urgent queue push
    pub fn record_urgent_queued(&self) {
        bump(&self.urgent_queued);
    }

    /// Record an application thread waiting for space
    pub fn record_app_wait(&self) {
        bump(&self.app_waits);
    }

    /// Record time an acquire slept
    pub fn record_page_sleep(&self, us: u64) {
        self.page_sleep_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Record a server pass that queued `queued` candidates
    pub fn record_pass(&self, queued: u64) {
        bump(&self.passes);
        self.walk_queued.fetch_add(queued, Ordering::Relaxed);
    }

    /// A walk started
    pub fn walk_started(&self) {
        bump(&self.active_walks);
    }

    /// A walk finished
    pub fn walk_finished(&self) {
        let _ = self
            .active_walks
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    /// Publish the scores
    pub fn set_scores(&self, aggressive: u32, empty: u32) {
        self.aggressive_score.store(u64::from(aggressive), Ordering::Relaxed);
        self.empty_score.store(u64::from(empty), Ordering::Relaxed);
    }

    /// Publish the worker counts
    pub fn set_workers(&self, active: usize, stable: usize) {
        self.active_workers.store(active as u64, Ordering::Relaxed);
        self.stable_workers.store(stable as u64, Ordering::Relaxed);
    }

    /// Publish the eviction state flags
    pub fn set_eviction_state(&self, bits: u32) {
        self.cache_eviction_state
            .store(u64::from(bits), Ordering::Relaxed);
    }

    /// Pages evicted by any thread
    pub fn pages_evicted(&self) -> u64 {
        self.pages_evicted_app.load(Ordering::Relaxed)
            + self.pages_evicted_worker.load(Ordering::Relaxed)
    }

    /// Forced eviction attempts
    pub fn force_attempts(&self) -> u64 {
        self.force_attempts.load(Ordering::Relaxed)
    }

    /// Copy every counter
    pub fn snapshot(&self) -> EvictStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EvictStatsSnapshot {
            pages_evicted_app: load(&self.pages_evicted_app),
            pages_evicted_worker: load(&self.pages_evicted_worker),
            max_page_size: load(&self.max_page_size),
            max_evict_ms: load(&self.max_evict_ms),
            pages_read: load(&self.pages_read),
            pages_requested: load(&self.pages_requested),
            read_blocked: load(&self.read_blocked),
            locked_blocked: load(&self.locked_blocked),
            busy_blocked: load(&self.busy_blocked),
            forcible_evict_blocked: load(&self.forcible_evict_blocked),
            force_attempts: load(&self.force_attempts),
            pages_split: load(&self.pages_split),
            pages_scrubbed: load(&self.pages_scrubbed),
            evict_failures: load(&self.evict_failures),
            queue_empty: load(&self.queue_empty),
            urgent_queued: load(&self.urgent_queued),
            app_waits: load(&self.app_waits),
            page_sleep_us: load(&self.page_sleep_us),
            passes: load(&self.passes),
            walk_queued: load(&self.walk_queued),
            aggressive_score: load(&self.aggressive_score),
            empty_score: load(&self.empty_score),
            active_workers: load(&self.active_workers),
            stable_workers: load(&self.stable_workers),
            active_walks: load(&self.active_walks),
            cache_eviction_state: load(&self.cache_eviction_state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_counters() {
        let stats = EvictStats::new();
        stats.record_eviction(true, 4096, 3);
        stats.record_eviction(false, 1024, 9);
        let snap = stats.snapshot();
        assert_eq!(snap.pages_evicted_app, 1);
        assert_eq!(snap.pages_evicted_worker, 1);
        assert_eq!(snap.pages_evicted(), 2);
        assert_eq!(snap.max_page_size, 4096);
        assert_eq!(snap.max_evict_ms, 9);
    }

    #[test]
    fn test_active_walks_never_underflow() {
        let stats = EvictStats::new();
        stats.walk_finished();
        stats.walk_started();
        assert_eq!(stats.snapshot().active_walks, 1);
        stats.walk_finished();
        stats.walk_finished();
        assert_eq!(stats.snapshot().active_walks, 0);
    }
}
