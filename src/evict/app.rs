//! Application threads helping with eviction
//!
//! A thread about to add to the cache checks the pressure first. While a
//! trigger is exceeded it evicts queued candidates itself, and waits for
//! the workers when nothing is queued. Threads holding resources other
//! threads may need (a running transaction, pinned pages) stop early.

use std::time::{Duration, Instant};

use super::{EvictionEngine, EvictionConfig};
use crate::btree::Tree;
use crate::status::Status;
use crate::txn::{TxnId, TXN_NONE};
use crate::utility::elapsed_ms;

/// Pages a busy thread evicts before giving up
const APP_EVICT_MAX_BUSY: u32 = 5;
/// Pages an idle thread evicts before giving up
const APP_EVICT_MAX: u32 = 20;
/// How long a thread waits for the workers when no candidate is queued
const APP_WAIT: Duration = Duration::from_millis(10);

/// What the calling thread holds, deciding how much eviction it may do
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictCaller {
    /// Running transaction, `TXN_NONE` if none
    pub txn_id: TxnId,
    /// A snapshot is pinned
    pub snapshot_pinned: bool,
    /// Pages the caller holds pinned
    pub hazards: usize,
    /// Updates made by the running transaction
    pub mod_count: usize,
    /// Never wait for eviction (internal and metadata threads)
    pub ignore_cache_size: bool,
}

impl EvictCaller {
    /// A caller holding nothing
    pub fn idle() -> Self {
        Self::default()
    }

    /// A caller inside transaction `txn_id`
    pub fn in_txn(txn_id: TxnId, mod_count: usize) -> Self {
        Self {
            txn_id,
            snapshot_pinned: true,
            mod_count,
            ..Self::default()
        }
    }
}

impl EvictionEngine {
    fn server_running(&self) -> bool {
        self.pool.server_running()
    }

    /// Help with eviction if the cache needs it.
    ///
    /// Returns whether the caller evicted or waited. Fails with `CacheStuck`
    /// when a caller inside a transaction finds the cache stuck; that
    /// transaction should roll back to release what it holds.
    pub fn eviction_check(
        &self,
        caller: &EvictCaller,
        busy: bool,
        readonly: bool,
        tree: Option<&Tree>,
    ) -> Result<bool, Status> {
        if caller.ignore_cache_size || self.with_config(|c: &EvictionConfig| c.in_memory) {
            return Ok(false);
        }
        if tree.is_some_and(|t| t.config().in_memory) {
            return Ok(false);
        }

        let busy = busy
            || caller.txn_id != TXN_NONE
            || caller.hazards > 0
            || (caller.snapshot_pinned && self.oracle().oldest_id() != self.oracle().current_id());
        if !self.with_pressure(|p| p.eviction_needed(busy, readonly).0) {
            return Ok(false);
        }

        let max_pages = if busy { APP_EVICT_MAX_BUSY } else { APP_EVICT_MAX };
        let max_wait_ms = self.with_config(|c| c.cache_max_wait_ms);
        let start = Instant::now();
        let mut evicted = 0;
        let mut helped = false;

        loop {
            if self.is_closing() || !self.with_pressure(|p| p.eviction_needed(busy, readonly).0) {
                break;
            }
            if caller.txn_id != TXN_NONE && self.stuck() {
                tracing::debug!(txn = caller.txn_id, "cache stuck, rolling back transaction");
                return Err(Status::CacheStuck);
            }

            match self.evict_one(true) {
                Some(true) => {
                    helped = true;
                    evicted += 1;
                }
                Some(false) => helped = true,
                None => {
                    helped = true;
                    if self.server_running() {
                        self.wake();
                        self.stats().record_app_wait();
                        self.wait_for(APP_WAIT);
                    } else if self.server_pass() == 0 {
                        self.stats().record_app_wait();
                        self.wait_for(APP_WAIT);
                    }
                }
            }

            if evicted >= max_pages {
                break;
            }
            if max_wait_ms > 0 && elapsed_ms(start) >= max_wait_ms {
                break;
            }
        }
        Ok(helped)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::btree::testutil::{make_resident, tree_with_leaves};
    use crate::btree::{ImageReconciler, RefState, TreeConfig};
    use crate::txn::{TxnGlobal, TxnOracle};

    fn engine(config: EvictionConfig) -> (Arc<EvictionEngine>, Arc<TxnGlobal>) {
        let txn = Arc::new(TxnGlobal::new());
        let engine = EvictionEngine::new(
            config.validated().unwrap(),
            txn.clone(),
            Arc::new(ImageReconciler),
        );
        (engine, txn)
    }

    #[test]
    fn test_no_pressure_returns_at_once() {
        let (engine, _txn) = engine(EvictionConfig::default());
        assert_eq!(
            engine.eviction_check(&EvictCaller::idle(), false, false, None),
            Ok(false)
        );
    }

    #[test]
    fn test_app_thread_evicts_until_under_trigger() {
        let (engine, _txn) = engine(EvictionConfig {
            cache_size: 4_000,
            ..EvictionConfig::default()
        });
        let tree = tree_with_leaves(1, 8, TreeConfig::default());
        engine.add_tree(Arc::clone(&tree));
        for (i, pref) in tree.leaf_refs().iter().enumerate() {
            make_resident(engine.cache(), &tree, pref, i as u8, 2);
        }
        assert!(engine.cache().bytes_inuse() > 4_000);

        assert_eq!(
            engine.eviction_check(&EvictCaller::idle(), false, false, None),
            Ok(true)
        );
        let usage = engine.cache().usage();
        assert!(usage.inuse * 100 <= 4_001 * 95);
        assert!(usage.dirty * 100 <= 4_001 * 20);
        let evicted = tree
            .leaf_refs()
            .iter()
            .filter(|pref| pref.state() == RefState::Disk)
            .count();
        assert!(evicted > 0);
        assert_eq!(engine.stats().snapshot().pages_evicted_app as usize, evicted);
    }

    #[test]
    fn test_in_memory_tree_never_waits() {
        let (engine, _txn) = engine(EvictionConfig {
            cache_size: 1_000,
            ..EvictionConfig::default()
        });
        let tree = tree_with_leaves(1, 1, TreeConfig::default().with_in_memory(true));
        make_resident(engine.cache(), &tree, &tree.leaf_refs()[0], 0, 8);
        assert_eq!(
            engine.eviction_check(&EvictCaller::idle(), false, false, Some(&tree)),
            Ok(false)
        );
        let caller = EvictCaller {
            ignore_cache_size: true,
            ..EvictCaller::idle()
        };
        assert_eq!(engine.eviction_check(&caller, false, false, None), Ok(false));
    }

    #[test]
    fn test_stuck_cache_rolls_back_transaction() {
        let (engine, txn) = engine(EvictionConfig {
            cache_size: 1_000,
            ..EvictionConfig::default()
        });
        let tree = tree_with_leaves(1, 1, TreeConfig::default());
        engine.add_tree(Arc::clone(&tree));
        make_resident(engine.cache(), &tree, &tree.leaf_refs()[0], 0, 8);
        tree.leaf_refs()[0].hazard_set().unwrap();
        engine.update_flags();
        for _ in 0..200 {
            engine.update_aggressive(engine.flags());
        }
        assert!(engine.stuck());

        let id = txn.begin();
        assert!(txn.current_id() >= id);
        assert_eq!(
            engine.eviction_check(&EvictCaller::in_txn(id, 1), false, false, None),
            Err(Status::CacheStuck)
        );
    }
}
