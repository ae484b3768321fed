//! The eviction engine
//!
//! One [`EvictionEngine`] is owned by a connection and shared with every
//! session through an `Arc`. It holds the eviction configuration, the cache
//! byte counters, the candidate queues and the cache-wide eviction state.
//! The walk, page eviction, application assist and the server/worker
//! threads are implemented in sibling modules as further `impl` blocks.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use super::queue::{EvictEntry, EvictQueue, EVICT_QUEUE_MAX, EVICT_URGENT_QUEUE};
use super::worker::WorkerPool;
use super::{
    EvictFlags, EvictStats, EvictionConfig, Pressure, ReadGenClock, EVICT_SCORE_BUMP,
    EVICT_SCORE_CUTOFF, EVICT_SCORE_MAX,
};
use crate::btree::{PageRef, RefFlags, RefState, Reconciler, Tree, TreeId};
use crate::cache::CacheAccounting;
use crate::txn::TxnOracle;
use crate::utility::{elapsed_ms, Backoff};

/// Which of the two ordinary queues workers drain
#[derive(Debug, Clone, Copy)]
pub(super) struct QueueRoles {
    pub(super) current: usize,
    pub(super) other: usize,
}

#[derive(Debug, Default)]
struct StuckState {
    since: Option<Instant>,
    dumped: bool,
}

/// Cache-wide eviction state and machinery
pub struct EvictionEngine {
    config: RwLock<EvictionConfig>,
    cache: Arc<CacheAccounting>,
    oracle: Arc<dyn TxnOracle>,
    reconciler: Arc<dyn Reconciler>,
    trees: RwLock<Vec<Arc<Tree>>>,
    pub(super) queues: [EvictQueue; EVICT_QUEUE_MAX],
    pub(super) roles: Mutex<QueueRoles>,
    pub(super) read_gen: ReadGenClock,
    aggressive_score: AtomicU32,
    empty_score: AtomicU32,
    flags: AtomicU32,
    scrub: AtomicBool,
    progress: AtomicU64,
    last_progress: AtomicU64,
    pub(super) tree_cursor: AtomicUsize,
    stuck: Mutex<StuckState>,
    wait_lock: Mutex<()>,
    wait_cond: Condvar,
    closing: AtomicBool,
    stats: EvictStats,
    pub(super) pool: WorkerPool,
}

impl EvictionEngine {
    /// Create an engine. `config` must already be validated.
    pub fn new(
        config: EvictionConfig,
        oracle: Arc<dyn TxnOracle>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Arc<Self> {
        let slots = config.evict_slots().max(1);
        Arc::new(Self {
            config: RwLock::new(config),
            cache: Arc::new(CacheAccounting::new()),
            oracle,
            reconciler,
            trees: RwLock::new(Vec::new()),
            queues: [
                EvictQueue::new(slots),
                EvictQueue::new(slots),
                EvictQueue::new(slots),
            ],
            roles: Mutex::new(QueueRoles {
                current: 0,
                other: 1,
            }),
            read_gen: ReadGenClock::new(),
            aggressive_score: AtomicU32::new(0),
            empty_score: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            scrub: AtomicBool::new(false),
            progress: AtomicU64::new(0),
            last_progress: AtomicU64::new(0),
            tree_cursor: AtomicUsize::new(0),
            stuck: Mutex::new(StuckState::default()),
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
            closing: AtomicBool::new(false),
            stats: EvictStats::new(),
            pool: WorkerPool::new(),
        })
    }

    /// Snapshot of the configuration
    pub fn config(&self) -> EvictionConfig {
        self.config.read().clone()
    }

    /// Replace the configuration. `config` must already be validated.
    pub fn set_config(&self, config: EvictionConfig) {
        *self.config.write() = config;
        self.wake();
    }

    /// Run `f` against the configuration without cloning it
    pub(super) fn with_config<R>(&self, f: impl FnOnce(&EvictionConfig) -> R) -> R {
        f(&self.config.read())
    }

    /// Cache byte counters
    pub fn cache(&self) -> &Arc<CacheAccounting> {
        &self.cache
    }

    /// Transaction oracle used for visibility decisions
    pub fn oracle(&self) -> &Arc<dyn TxnOracle> {
        &self.oracle
    }

    pub(super) fn reconciler(&self) -> &dyn Reconciler {
        &*self.reconciler
    }

    /// Statistics
    pub fn stats(&self) -> &EvictStats {
        &self.stats
    }

    /// Cache-wide read generation clock
    pub fn read_gen(&self) -> &ReadGenClock {
        &self.read_gen
    }

    /// Whether the engine is shutting down
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(super) fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
        self.wake();
    }

    /// Register a tree for eviction
    pub fn add_tree(&self, tree: Arc<Tree>) {
        let mut trees = self.trees.write();
        if !trees.iter().any(|t| t.id() == tree.id()) {
            trees.push(tree);
        }
    }

    /// Forget a tree, dropping its queued candidates
    pub fn remove_tree(&self, id: TreeId) {
        self.trees.write().retain(|t| t.id() != id);
        for queue in &self.queues {
            queue.remove_tree(id);
        }
    }

    /// Snapshot of the registered trees
    pub fn trees(&self) -> Vec<Arc<Tree>> {
        self.trees.read().clone()
    }

    /// Current eviction state flags
    pub fn flags(&self) -> EvictFlags {
        EvictFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Aggressiveness score (0 to 100)
    pub fn aggressive_score(&self) -> u32 {
        self.aggressive_score.load(Ordering::Acquire)
    }

    /// Empty-queue score (0 to 100)
    pub fn empty_score(&self) -> u32 {
        self.empty_score.load(Ordering::Acquire)
    }

    /// Eviction is struggling to make progress
    pub fn aggressive(&self) -> bool {
        self.aggressive_score() >= EVICT_SCORE_CUTOFF
    }

    /// Eviction has made no progress for long enough, and some trigger is
    /// still exceeded: transactions should roll back
    pub fn stuck(&self) -> bool {
        self.aggressive_score() >= EVICT_SCORE_MAX && self.flags().intersects(EvictFlags::HARD)
    }

    /// Pages evicted so far, excluding pages flagged as making no progress
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    pub(super) fn note_progress(&self) {
        self.progress.fetch_add(1, Ordering::AcqRel);
    }

    /// Dirty target follows the checkpoint target while a checkpoint
    /// scrubs the cache
    pub fn set_checkpoint_scrub(&self, on: bool) {
        self.scrub.store(on, Ordering::Release);
    }

    /// Pressure over the current counters
    pub(super) fn with_pressure<R>(&self, f: impl FnOnce(&Pressure<'_>) -> R) -> R {
        let config = self.config.read();
        let scrub_target = if self.scrub.load(Ordering::Acquire) {
            config.eviction_checkpoint_target
        } else {
            0.0
        };
        let pressure = Pressure::new(&config, self.cache.usage()).with_scrub_target(scrub_target);
        f(&pressure)
    }

    /// Recompute the eviction state flags from the byte counters
    pub fn update_flags(&self) -> EvictFlags {
        let mut flags = self.with_pressure(|p| {
            let mut flags = EvictFlags::empty();
            flags.set(EvictFlags::CLEAN, p.over_target());
            flags.set(EvictFlags::CLEAN_HARD, p.clean_needed().0);
            flags.set(EvictFlags::DIRTY, p.dirty_over_target());
            flags.set(EvictFlags::DIRTY_HARD, p.dirty_needed().0);
            flags.set(EvictFlags::UPDATES, p.updates_over_target());
            flags.set(EvictFlags::UPDATES_HARD, p.updates_needed().0);
            if !p.over_midpoint() {
                if p.dirty_under_midpoint() {
                    flags |= EvictFlags::SCRUB;
                }
            } else {
                flags |= EvictFlags::NOKEEP;
            }
            flags
        });
        if flags.intersects(EvictFlags::HARD) && self.aggressive() {
            flags |= EvictFlags::URGENT;
        }
        self.flags.store(flags.bits(), Ordering::Release);
        self.stats.set_eviction_state(flags.bits());
        flags
    }

    /// Adjust the aggressiveness after a server pass
    pub(super) fn update_aggressive(&self, flags: EvictFlags) {
        let progress = self.progress();
        let last = self.last_progress.swap(progress, Ordering::AcqRel);
        let update = |score: u32| {
            if !flags.intersects(EvictFlags::ALL) || progress > last {
                Some(score.saturating_sub(1))
            } else {
                Some((score + 1).min(EVICT_SCORE_MAX))
            }
        };
        let _ = self
            .aggressive_score
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, update);
        self.stats
            .set_scores(self.aggressive_score(), self.empty_score());
    }

    /// Adjust the empty-queue score after a refill
    pub(super) fn update_empty_score(&self, found_empty: bool) {
        let update = |score: u32| {
            Some(if found_empty {
                (score + EVICT_SCORE_BUMP).min(EVICT_SCORE_MAX)
            } else {
                score.saturating_sub(1)
            })
        };
        let _ = self
            .empty_score
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, update);
    }

    /// Track how long the cache has been stuck, dumping its content once per
    /// stuck episode after `cache_stuck_timeout_ms`
    pub(super) fn check_stuck(&self) {
        let mut stuck = self.stuck.lock();
        if !self.stuck() {
            if stuck.since.take().is_some() {
                tracing::info!("cache is no longer stuck");
            }
            stuck.dumped = false;
            return;
        }
        let since = *stuck.since.get_or_insert_with(|| {
            tracing::warn!(
                aggressive = self.aggressive_score(),
                flags = ?self.flags(),
                "cache stuck: eviction is not making progress"
            );
            Instant::now()
        });
        let timeout = self.with_config(|c| c.cache_stuck_timeout_ms);
        if timeout > 0 && !stuck.dumped && elapsed_ms(since) >= timeout {
            stuck.dumped = true;
            tracing::error!(
                stuck_ms = elapsed_ms(since),
                dump = %self.dump_cache(),
                "cache stuck for too long"
            );
        }
    }

    /// Human-readable summary of the cache content
    pub fn dump_cache(&self) -> String {
        let usage = self.cache.usage();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "cache: {} bytes in use, {} dirty, {} in updates, {} pages, flags {:?}, aggressive {}",
            usage.inuse,
            usage.dirty,
            usage.updates,
            usage.pages,
            self.flags(),
            self.aggressive_score()
        );
        for tree in self.trees() {
            let (mut resident, mut dirty, mut locked) = (0usize, 0usize, 0usize);
            for pref in tree.leaf_refs() {
                match pref.state() {
                    RefState::Mem => {
                        resident += 1;
                        if pref.page().is_some_and(|p| p.is_dirty()) {
                            dirty += 1;
                        }
                    }
                    RefState::Locked => locked += 1,
                    _ => {}
                }
            }
            let _ = writeln!(
                out,
                "  {}: {} leaves, {} resident, {} dirty, {} locked, {} bytes, {} dirty bytes{}",
                tree.name(),
                tree.leaf_count(),
                resident,
                dirty,
                locked,
                tree.bytes().inmem(),
                tree.bytes().dirty(),
                if tree.evict_disabled() {
                    ", eviction disabled"
                } else {
                    ""
                }
            );
        }
        out
    }

    /// Wake the server, workers and waiting application threads
    pub fn wake(&self) {
        let _guard = self.wait_lock.lock();
        self.wait_cond.notify_all();
    }

    /// Wait until woken or `timeout` passes. Returns `false` on timeout.
    pub(super) fn wait_for(&self, timeout: Duration) -> bool {
        let mut guard = self.wait_lock.lock();
        if self.is_closing() {
            return true;
        }
        !self.wait_cond.wait_for(&mut guard, timeout).timed_out()
    }

    /// Switch queue roles when the current queue is drained and the other
    /// one holds candidates. Returns the current queue.
    pub(super) fn rotate_queues(&self) -> usize {
        let mut guard = self.roles.lock();
        let roles = &mut *guard;
        if self.queues[roles.current].is_empty() && !self.queues[roles.other].is_empty() {
            std::mem::swap(&mut roles.current, &mut roles.other);
        }
        roles.current
    }

    /// Take the next candidate: urgent entries first, then the current
    /// queue, switching to the other queue once the current one is drained
    pub(super) fn pop_candidate(&self) -> Option<EvictEntry> {
        if let Some(entry) = self.queues[EVICT_URGENT_QUEUE].pop() {
            return Some(entry);
        }
        let current = self.roles.lock().current;
        if let Some(entry) = self.queues[current].pop() {
            return Some(entry);
        }
        let current = self.rotate_queues();
        let entry = self.queues[current].pop();
        if entry.is_none() {
            self.stats.record_queue_empty();
        }
        entry
    }

    /// Candidates waiting in every queue
    pub fn queued(&self) -> usize {
        self.queues.iter().map(EvictQueue::remaining).sum()
    }

    /// Queue `pref` for eviction ahead of the walk-filled queues
    pub fn push_urgent(&self, tree: &Arc<Tree>, pref: &Arc<PageRef>) -> bool {
        if pref.state() != RefState::Mem || !pref.is_leaf() || tree.evict_disabled() {
            return false;
        }
        let entry = EvictEntry {
            tree: Arc::clone(tree),
            pref: Arc::clone(pref),
            score: 0,
        };
        let queued = self.queues[EVICT_URGENT_QUEUE].push_ready(entry);
        if queued {
            self.stats.record_urgent_queued();
            self.wake();
        }
        queued
    }

    /// Drop `pref` from whichever queue holds it
    pub fn evict_list_clear_page(&self, pref: &Arc<PageRef>) {
        if !pref.flags().contains(RefFlags::EVICT_QUEUED) {
            return;
        }
        for queue in &self.queues {
            if queue.remove_ref(pref) {
                break;
            }
        }
    }

    /// Disable eviction of `tree`: wait for walks and evictions in progress
    /// to finish, then drop its queued candidates
    pub fn evict_file_exclusive_on(&self, tree: &Tree) {
        tree.evict_disable();
        let mut backoff = Backoff::new();
        while tree.evict_busy() > 0 {
            backoff.snooze();
        }
        for queue in &self.queues {
            queue.remove_tree(tree.id());
        }
    }

    /// Re-enable eviction of `tree`
    pub fn evict_file_exclusive_off(&self, tree: &Tree) {
        tree.evict_enable();
    }

    /// Make `tree`'s pages less likely to be chosen
    pub fn evict_priority_set(&self, tree: &Tree, priority: u64) {
        tree.set_evict_priority(priority);
    }

    /// Reset `tree`'s priority
    pub fn evict_priority_clear(&self, tree: &Tree) {
        tree.set_evict_priority(0);
    }
}

impl std::fmt::Debug for EvictionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionEngine")
            .field("usage", &self.cache.usage())
            .field("flags", &self.flags())
            .field("aggressive", &self.aggressive_score())
            .field("trees", &self.trees.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{ImageReconciler, TreeConfig};
    use crate::device::MemPageStore;
    use crate::page::Page;
    use crate::txn::TxnGlobal;

    fn engine(config: EvictionConfig) -> Arc<EvictionEngine> {
        EvictionEngine::new(config, Arc::new(TxnGlobal::new()), Arc::new(ImageReconciler))
    }

    fn small_config() -> EvictionConfig {
        EvictionConfig {
            cache_size: 10_000,
            ..EvictionConfig::default()
        }
        .validated()
        .unwrap()
    }

    #[test]
    fn test_flags_follow_usage() {
        let engine = engine(small_config());
        assert_eq!(
            engine.update_flags() & EvictFlags::ALL,
            EvictFlags::empty()
        );
        assert!(engine.update_flags().contains(EvictFlags::SCRUB));

        let tree = Arc::new(Tree::create(
            1,
            "t",
            Arc::new(MemPageStore::new()),
            TreeConfig::default(),
        ));
        let page = Page::new_leaf();
        page.apply_update(b"k", crate::page::Update::standard(0, 0, vec![0; 9_600]));
        engine.cache().page_in(tree.bytes(), &page);

        let flags = engine.update_flags();
        assert!(flags.contains(EvictFlags::CLEAN | EvictFlags::CLEAN_HARD));
        assert!(flags.contains(EvictFlags::DIRTY_HARD));
        assert!(flags.contains(EvictFlags::NOKEEP));
        assert!(!flags.contains(EvictFlags::SCRUB));
    }

    #[test]
    fn test_aggressive_rises_without_progress() {
        let engine = engine(small_config());
        for _ in 0..EVICT_SCORE_CUTOFF {
            engine.update_aggressive(EvictFlags::CLEAN);
        }
        assert!(engine.aggressive());
        engine.note_progress();
        engine.update_aggressive(EvictFlags::CLEAN);
        assert_eq!(engine.aggressive_score(), EVICT_SCORE_CUTOFF - 1);

        for _ in 0..200 {
            engine.update_aggressive(EvictFlags::CLEAN_HARD);
        }
        assert_eq!(engine.aggressive_score(), EVICT_SCORE_MAX);
    }

    #[test]
    fn test_empty_score() {
        let engine = engine(small_config());
        for _ in 0..20 {
            engine.update_empty_score(true);
        }
        assert_eq!(engine.empty_score(), EVICT_SCORE_MAX);
        engine.update_empty_score(false);
        assert_eq!(engine.empty_score(), EVICT_SCORE_MAX - 1);
    }

    #[test]
    fn test_urgent_push_requires_resident_leaf() {
        let engine = engine(small_config());
        let tree = Arc::new(Tree::create(
            1,
            "t",
            Arc::new(MemPageStore::new()),
            TreeConfig::default(),
        ));
        let on_disk = tree.leaf_for(b"").unwrap();
        assert!(!engine.push_urgent(&tree, &on_disk));

        let resident = Arc::new(PageRef::new_mem(Arc::new(Page::new_leaf()), None));
        assert!(engine.push_urgent(&tree, &resident));
        assert!(!engine.push_urgent(&tree, &resident));
        assert_eq!(engine.stats().snapshot().urgent_queued, 1);

        let entry = engine.pop_candidate().unwrap();
        assert!(Arc::ptr_eq(&entry.pref, &resident));
    }

    #[test]
    fn test_exclusive_drops_queued_entries() {
        let engine = engine(small_config());
        let tree = Arc::new(Tree::create(
            1,
            "t",
            Arc::new(MemPageStore::new()),
            TreeConfig::default(),
        ));
        let resident = Arc::new(PageRef::new_mem(Arc::new(Page::new_leaf()), None));
        engine.push_urgent(&tree, &resident);

        engine.evict_file_exclusive_on(&tree);
        assert!(tree.evict_disabled());
        assert!(!resident.flags().contains(RefFlags::EVICT_QUEUED));
        assert!(engine.pop_candidate().is_none());
        engine.evict_file_exclusive_off(&tree);
        assert!(!tree.evict_disabled());
    }

    #[test]
    fn test_dump_names_trees() {
        let engine = engine(small_config());
        let tree = Arc::new(Tree::create(
            1,
            "orders",
            Arc::new(MemPageStore::new()),
            TreeConfig::default(),
        ));
        engine.add_tree(tree);
        let dump = engine.dump_cache();
        assert!(dump.contains("orders: 1 leaves, 0 resident"));
    }
}
