//! Filling the candidate queues
//!
//! The server walks registered trees round-robin, visiting each tree's
//! leaves from where its previous walk stopped. Resident, unpinned leaves
//! that can help with the current kind of pressure are queued with a score
//! derived from their read generation; the queue is sorted before workers
//! see it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::Rng;

use super::queue::EvictQueue;
use super::{page_is_evict_soon, EvictEntry, EvictFlags, EvictionEngine};
use crate::btree::{RefFlags, RefState, Tree};

impl EvictionEngine {
    /// One pass of the eviction server. Returns the number of candidates
    /// queued.
    pub fn server_pass(&self) -> usize {
        let flags = self.update_flags();
        let mut queued = 0;
        if flags.intersects(EvictFlags::ALL) {
            self.read_gen.incr();
            queued = self.fill_pass(flags);
            if queued > 0 {
                self.wake();
            }
        }
        self.update_aggressive(flags);
        self.check_stuck();
        self.stats().record_pass(queued as u64);
        queued
    }

    /// Refill the queue workers are not draining. Does nothing while that
    /// queue still holds candidates.
    pub(crate) fn fill_pass(&self, flags: EvictFlags) -> usize {
        let (current, other) = {
            let roles = self.roles.lock();
            (roles.current, roles.other)
        };
        let queue = &self.queues[other];
        if !queue.is_empty() {
            return 0;
        }
        let found_empty = self.queues[current].is_empty();

        queue.begin_fill();
        let trees = self.trees();
        let mut queued = 0;
        let mut min_gen = u64::MAX;
        if !trees.is_empty() {
            let sample_inmem = self.with_config(|c| c.evict_sample_inmem);
            let per_tree = (queue.capacity() / trees.len()).max(1);
            let start = self.tree_cursor.fetch_add(1, Ordering::Relaxed);
            for i in 0..trees.len() {
                if queue.is_full() {
                    break;
                }
                let tree = &trees[(start + i) % trees.len()];
                if tree.is_closing() || tree.evict_disabled() {
                    continue;
                }
                if tree.config().in_memory && !sample_inmem {
                    continue;
                }
                let budget = if self.with_pressure(|p| p.dominating(tree.bytes())) {
                    per_tree * 2
                } else {
                    per_tree
                };
                queued += self.walk_tree(tree, queue, budget, flags, &mut min_gen);
            }
        }
        if min_gen != u64::MAX {
            self.read_gen.set_oldest(min_gen);
        }
        queue.publish();
        self.update_empty_score(found_empty);

        self.rotate_queues();

        tracing::trace!(queued, ?flags, "eviction queue filled");
        queued
    }

    /// Queue up to `budget` candidates from `tree`
    fn walk_tree(
        &self,
        tree: &Arc<Tree>,
        queue: &EvictQueue,
        budget: usize,
        flags: EvictFlags,
        min_gen: &mut u64,
    ) -> usize {
        tree.evict_busy_enter();
        if tree.evict_disabled() {
            tree.evict_busy_leave();
            return 0;
        }
        self.stats().walk_started();

        let leaves = tree.leaf_refs();
        let count = leaves.len();
        // The stored cursor is one past the next leaf; zero means the tree
        // was never walked and the walk starts at a random leaf.
        let start = match tree.walk_start(0) {
            0 if count > 1 => rand::thread_rng().gen_range(0..count),
            0 => 0,
            next => (next - 1) % count.max(1),
        };
        let aggressive = self.aggressive();
        let mut visited = 0;
        let mut queued = 0;

        for step in 0..count {
            if queued >= budget || queue.is_full() {
                break;
            }
            visited += 1;
            let pref = &leaves[(start + step) % count];
            if pref.state() != RefState::Mem
                || pref.hazard_count() > 0
                || pref.flags().contains(RefFlags::EVICT_QUEUED)
            {
                continue;
            }
            let Some(page) = pref.page() else {
                continue;
            };
            if !page.is_leaf() {
                continue;
            }

            let dirty = page.is_dirty();
            if !aggressive {
                if dirty && flags.clean_only() {
                    continue;
                }
                if !dirty && flags.dirty_only() {
                    continue;
                }
            }
            if dirty && !self.page_evict_retry(&page) {
                continue;
            }

            let score = if page_is_evict_soon(&page) {
                0
            } else {
                let gen = page.read_gen();
                *min_gen = (*min_gen).min(gen);
                gen.saturating_add(tree.evict_priority())
            };
            let entry = EvictEntry {
                tree: Arc::clone(tree),
                pref: Arc::clone(pref),
                score,
            };
            if queue.push(entry) {
                queued += 1;
            }
        }

        if count > 0 {
            tree.set_walk_start((start + visited) % count + 1);
        }
        self.stats().walk_finished();
        tree.evict_busy_leave();
        queued
    }
}
