//! Evicting a single page
//!
//! Every path that removes a page from the cache ends here: workers draining
//! the queues, application threads helping, forced eviction of an oversized
//! page and tree close. The caller owns the reference in the `LOCKED` state;
//! on failure the reference goes back to `MEM` with the page untouched.

use std::sync::Arc;
use std::time::Instant;

use super::{evict_soon, EvictEntry, EvictFlags, EvictionEngine};
use crate::btree::{leaf_page_can_split, split_leaf, PageRef, RefState, Tree};
use crate::page::{Page, PageFlags, UpdateKind};
use crate::status::Status;
use crate::txn::{OldestFlags, TxnOracle, TXN_NONE};
use crate::utility::{elapsed_ms, Backoff};

/// How a page leaves the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictMode {
    /// Write the page if dirty, then drop it
    Normal,
    /// An oversized page acquired by an application thread: split it in
    /// memory when it is not too large, otherwise evict it normally
    Forced,
    /// Write the page if dirty, then drop it, ignoring scrub; used when the
    /// tree is closed
    Close,
    /// Drop the page without writing it
    Discard,
}

/// Whether every change on `page` is visible to all transactions, so that
/// writing it out loses nothing a reader may need
pub fn page_can_evict(page: &Page, oracle: &dyn TxnOracle) -> bool {
    if !page.is_dirty() {
        return true;
    }
    let rows = page.rows();
    rows.values().all(|row| {
        row.updates
            .iter()
            .find(|upd| !upd.is_aborted())
            .map_or(true, |upd| {
                oracle.visible_all(upd.txn_id, upd.start_ts)
                    || (upd.kind == UpdateKind::Tombstone && upd.restored)
            })
    })
}

impl EvictionEngine {
    /// Evict the page of `pref`, which the caller holds `LOCKED`.
    pub(crate) fn evict_locked(
        &self,
        tree: &Tree,
        pref: &Arc<PageRef>,
        mode: EvictMode,
        by_app: bool,
    ) -> Result<(), Status> {
        debug_assert_eq!(pref.state(), RefState::Locked);
        let Some(page) = pref.page() else {
            panic!("locked page reference {pref:?} has no resident page");
        };
        let start = Instant::now();
        let footprint = page.footprint();

        if mode == EvictMode::Forced
            && footprint >= tree.config().splitmempage
            && footprint < tree.config().maxmempage
            && leaf_page_can_split(&page)
        {
            return match split_leaf(tree, pref, &page, self.cache()) {
                Ok(_) => {
                    self.stats().record_split();
                    self.evict_list_clear_page(pref);
                    Ok(())
                }
                Err(status) => {
                    pref.set_state(RefState::Mem);
                    Err(status)
                }
            };
        }

        if mode != EvictMode::Discard && page.is_dirty() {
            match self
                .reconciler()
                .reconcile(tree, pref, &page, self.oracle().as_ref())
            {
                Ok(result) => {
                    pref.set_addr(result.addr());
                    let released = page.mark_clean();
                    self.cache().page_cleaned(tree.bytes(), released);

                    let flags = self.flags();
                    if mode == EvictMode::Normal
                        && flags.contains(EvictFlags::SCRUB)
                        && flags.dirty_only()
                    {
                        pref.set_state(RefState::Mem);
                        self.stats().record_scrub();
                        if !page.flags().contains(PageFlags::EVICT_NO_PROGRESS) {
                            self.note_progress();
                        }
                        return Ok(());
                    }
                }
                Err(status) => {
                    let oldest = self.oracle().oldest_id();
                    page.with_modify(|m| m.last_eviction_id = oldest);
                    pref.set_state(RefState::Mem);
                    self.stats().record_failure();
                    if status != Status::Busy {
                        tracing::warn!(
                            tree = tree.name(),
                            addr = ?pref.addr(),
                            status = %status,
                            "page write failed during eviction"
                        );
                    }
                    return Err(status);
                }
            }
        }

        self.cache().page_out(tree.bytes(), &page);
        pref.take_page();
        pref.set_state(RefState::Disk);
        self.evict_list_clear_page(pref);

        self.stats()
            .record_eviction(by_app, footprint, elapsed_ms(start));
        if !page.flags().contains(PageFlags::EVICT_NO_PROGRESS) {
            self.note_progress();
        }
        Ok(())
    }

    /// Evict the page of `pref` now, on behalf of the thread that just
    /// released it. Fails with `Busy` if anyone still pins the page.
    pub fn page_release_evict(&self, tree: &Tree, pref: &Arc<PageRef>) -> Result<(), Status> {
        pref.lock_resident(0)?;
        tree.evict_busy_enter();
        let result = if tree.evict_disabled() {
            pref.set_state(RefState::Mem);
            Err(Status::Busy)
        } else {
            self.evict_locked(tree, pref, EvictMode::Forced, true)
        };
        tree.evict_busy_leave();
        result
    }

    /// Whether trying again to evict `page` can succeed: the first attempt,
    /// when eviction is aggressive, or when the oldest transaction moved
    /// since the last failure
    pub(crate) fn page_evict_retry(&self, page: &Page) -> bool {
        let Some(modify) = page.modify() else {
            return true;
        };
        if modify.last_eviction_id == TXN_NONE || self.aggressive() {
            return true;
        }
        modify.last_eviction_id != self.oracle().oldest_id()
    }

    /// Whether the application thread that pinned `page` should evict it
    /// before using it. The caller holds exactly one pin.
    pub(crate) fn force_check(&self, tree: &Tree, pref: &PageRef, page: &Page) -> bool {
        if !page.is_leaf() || pref.hazard_count() > 1 {
            return false;
        }
        // A clean page is never worth forcing out.
        if !page.is_dirty() {
            return false;
        }
        let footprint = page.footprint();
        let config = tree.config();
        if footprint < config.splitmempage {
            return false;
        }
        if footprint < config.maxmempage {
            return leaf_page_can_split(page);
        }

        if self.oracle().update_oldest(OldestFlags::empty()).is_err() {
            return false;
        }
        if !self.page_evict_retry(page) {
            return false;
        }
        evict_soon(page);
        page_can_evict(page, self.oracle().as_ref())
    }

    /// Evict a queued candidate. Stale entries (the page was used, split or
    /// already evicted since it was queued) are skipped.
    pub(crate) fn evict_entry(&self, entry: &EvictEntry, by_app: bool) -> bool {
        let tree = &entry.tree;
        let pref = &entry.pref;
        if tree.evict_disabled() || tree.is_closing() {
            return false;
        }
        if pref.state() != RefState::Mem || pref.hazard_count() > 0 {
            return false;
        }

        tree.evict_busy_enter();
        let evicted = !tree.evict_disabled()
            && pref.lock_resident(0).is_ok()
            && self
                .evict_locked(tree, pref, EvictMode::Normal, by_app)
                .is_ok();
        tree.evict_busy_leave();
        evicted
    }

    /// Evict the next queued candidate. `None` when every queue is empty.
    pub fn evict_one(&self, by_app: bool) -> Option<bool> {
        let entry = self.pop_candidate()?;
        Some(self.evict_entry(&entry, by_app))
    }

    /// Remove every resident leaf of `tree` from the cache, writing dirty
    /// leaves first unless `discard` is set. Eviction of the tree by other
    /// threads is disabled meanwhile. Returns the number of leaves removed.
    pub fn evict_tree(&self, tree: &Tree, discard: bool) -> Result<usize, Status> {
        let mode = if discard {
            EvictMode::Discard
        } else {
            EvictMode::Close
        };
        self.evict_file_exclusive_on(tree);
        let mut evicted = 0;
        let mut result = Ok(());
        for pref in tree.leaf_refs() {
            if pref.state() != RefState::Mem {
                continue;
            }
            if let Err(status) = pref
                .lock_resident(0)
                .and_then(|()| self.evict_locked(tree, &pref, mode, false))
            {
                result = Err(status);
                break;
            }
            evicted += 1;
        }
        self.evict_file_exclusive_off(tree);
        tracing::debug!(tree = tree.name(), evicted, discard, "tree evicted");
        result.map(|()| evicted)
    }

    /// Write every dirty resident leaf of `tree`, keeping it resident.
    /// Returns the number of leaves written.
    pub fn write_tree(&self, tree: &Tree) -> Result<usize, Status> {
        let mut written = 0;
        for pref in tree.leaf_refs() {
            let mut backoff = Backoff::new();
            loop {
                if pref.state() != RefState::Mem {
                    break;
                }
                if pref.lock_resident(0).is_err() {
                    backoff.snooze();
                    continue;
                }
                let result = self.write_locked(tree, &pref);
                pref.set_state(RefState::Mem);
                if result? {
                    written += 1;
                }
                break;
            }
        }
        Ok(written)
    }

    fn write_locked(&self, tree: &Tree, pref: &Arc<PageRef>) -> Result<bool, Status> {
        let Some(page) = pref.page() else {
            panic!("locked page reference {pref:?} has no resident page");
        };
        if !page.is_dirty() {
            return Ok(false);
        }
        let result = self
            .reconciler()
            .reconcile(tree, pref, &page, self.oracle().as_ref())?;
        pref.set_addr(result.addr());
        let released = page.mark_clean();
        self.cache().page_cleaned(tree.bytes(), released);
        Ok(true)
    }
}
