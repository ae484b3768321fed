//! Page acquire
//!
//! [`page_in`] returns a pinned resident page for a leaf reference, reading
//! it from the store on a miss. The loop keys off the reference state:
//!
//! - `DISK`/`DELETED`: the CAS winner reads the page; everyone retries.
//! - `LOCKED`: another thread is reading or evicting; back off.
//! - `SPLIT`: the tree shape changed; the caller restarts from the root.
//! - `MEM`: pin it, then consider forced eviction of an oversized page
//!   before handing it out.
//!
//! Waits spin, then yield, then sleep. A thread about to sleep first helps
//! with eviction if the cache needs it.

use std::ops::Deref;
use std::sync::Arc;

use bitflags::bitflags;

use crate::btree::{read_page, PageRef, RefFlags, RefState, Tree};
use crate::evict::{
    page_is_evict_soon, EvictCaller, EvictFlags, EvictionEngine, FORCE_EVICT_MAX_ATTEMPTS,
    READGEN_NOTSET, READGEN_WONT_NEED,
};
use crate::page::Page;
use crate::status::Status;
use crate::utility::{Backoff, BackoffStep};

bitflags! {
    /// Options for [`page_in`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReadFlags: u32 {
        /// Only return resident pages: `NotFound` instead of reading
        const CACHE_ONLY = 0x01;
        /// Return `NotFound` instead of waiting on a locked reference
        const NO_WAIT = 0x02;
        /// Skip pressure checks; pages read are flagged as making no
        /// eviction progress
        const IGNORE_CACHE_SIZE = 0x04;
        /// The caller will not use the page again: evict it first
        const WONT_NEED = 0x08;
        /// Never force-evict or split the acquired page
        const NO_SPLIT = 0x10;
        /// Do not move the page's read generation forward
        const NO_GEN = 0x20;
        /// Return `NotFound` for fast-deleted pages instead of reading them
        const SKIP_DELETED = 0x40;
    }
}

/// A pinned resident page. Dropping the handle releases the pin; call
/// [`PageHandle::release`] to also evict a page marked for eviction.
pub struct PageHandle {
    tree: Arc<Tree>,
    pref: Arc<PageRef>,
    page: Arc<Page>,
    released: bool,
}

impl PageHandle {
    /// Tree owning the page
    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    /// Reference the page was acquired through
    pub fn pref(&self) -> &Arc<PageRef> {
        &self.pref
    }

    /// The page
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    /// Release the pin. A page marked evict-soon is evicted at once when
    /// possible, or queued as urgent if someone else still uses it.
    pub fn release(mut self, engine: &EvictionEngine) -> Result<(), Status> {
        self.released = true;
        self.pref.hazard_clear();
        if !page_is_evict_soon(&self.page) || self.tree.evict_disabled() {
            return Ok(());
        }
        match engine.page_release_evict(&self.tree, &self.pref) {
            Ok(()) => Ok(()),
            Err(Status::Busy) => {
                engine.push_urgent(&self.tree, &self.pref);
                Ok(())
            }
            Err(status) => Err(status),
        }
    }
}

impl Deref for PageHandle {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if !self.released {
            self.pref.hazard_clear();
        }
    }
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("tree", &self.tree.id())
            .field("pref", &self.pref)
            .finish()
    }
}

/// Acquire the page behind `pref` in `tree`, pinned.
///
/// Fails with `Restart` when the reference was split (look the key up
/// again), `NotFound` when `CACHE_ONLY`, `NO_WAIT` or `SKIP_DELETED` stop
/// the acquire, and `CacheStuck` when `caller` should roll back its
/// transaction.
pub fn page_in(
    engine: &EvictionEngine,
    tree: &Arc<Tree>,
    pref: &Arc<PageRef>,
    flags: ReadFlags,
    caller: &EvictCaller,
) -> Result<PageHandle, Status> {
    let stats = engine.stats();
    stats.record_page_requested();

    let check_cache = !flags.contains(ReadFlags::IGNORE_CACHE_SIZE);
    let readonly = caller.mod_count == 0;
    let mut backoff = Backoff::new();
    let mut force_attempts = 0;
    let mut evict_skip = false;
    let mut wont_need = false;

    loop {
        let mut stalled = false;
        match pref.state() {
            RefState::Deleted if flags.contains(ReadFlags::SKIP_DELETED) => {
                return Err(Status::NotFound);
            }
            RefState::Disk | RefState::Deleted => {
                if flags.contains(ReadFlags::CACHE_ONLY) {
                    return Err(Status::NotFound);
                }
                if check_cache {
                    engine.eviction_check(caller, true, readonly, Some(tree))?;
                }
                if read_page(tree, pref, flags, engine.oracle().as_ref(), engine.cache())? {
                    stats.record_page_read();
                    // A page this thread just read is not forcibly evicted.
                    evict_skip = true;
                    wont_need = flags.contains(ReadFlags::WONT_NEED)
                        || engine.flags().contains(EvictFlags::NOKEEP);
                }
                continue;
            }
            RefState::Locked => {
                if flags.contains(ReadFlags::NO_WAIT) {
                    return Err(Status::NotFound);
                }
                if pref.flags().contains(RefFlags::READING) {
                    if flags.contains(ReadFlags::CACHE_ONLY) {
                        return Err(Status::NotFound);
                    }
                    stats.record_read_blocked();
                    stalled = true;
                } else {
                    stats.record_locked_blocked();
                }
            }
            RefState::Split => return Err(Status::Restart),
            RefState::Mem => {
                if pref.hazard_set().is_err() {
                    stats.record_busy_blocked();
                } else {
                    let Some(page) = pref.page() else {
                        panic!("resident page reference {pref:?} has no page");
                    };

                    let may_force = !evict_skip
                        && !flags.contains(ReadFlags::NO_SPLIT)
                        && !tree.evict_disabled()
                        && force_attempts < FORCE_EVICT_MAX_ATTEMPTS;
                    if may_force && engine.force_check(tree, pref, &page) {
                        force_attempts += 1;
                        stats.record_force_attempt();
                        pref.hazard_clear();
                        drop(page);
                        match engine.page_release_evict(tree, pref) {
                            Ok(()) => continue,
                            Err(Status::Busy) => {
                                stats.record_forcible_evict_blocked();
                                stalled = true;
                            }
                            Err(status) => return Err(status),
                        }
                    } else {
                        if page.read_gen() == READGEN_NOTSET {
                            if wont_need {
                                page.set_read_gen(READGEN_WONT_NEED);
                            } else {
                                engine.read_gen().set_new(&page);
                            }
                        } else if !flags.contains(ReadFlags::NO_GEN) {
                            engine.read_gen().bump(&page);
                        }
                        return Ok(PageHandle {
                            tree: Arc::clone(tree),
                            pref: Arc::clone(pref),
                            page,
                            released: false,
                        });
                    }
                }
            }
        }

        if stalled {
            backoff.stall();
        }
        if !backoff.is_sleeping() {
            backoff.snooze();
            continue;
        }
        if check_cache {
            engine.eviction_check(caller, true, readonly, Some(tree))?;
        }
        if let BackoffStep::Sleep(us) = backoff.snooze() {
            stats.record_page_sleep(us);
        }
    }
}
