//! Read generations
//!
//! A page's read generation approximates how recently it was used. Low
//! values are reserved: anything between `READGEN_OLDEST` and
//! `READGEN_START_VALUE` marks a page for eviction as soon as possible.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::page::Page;

/// Generation of a page no reader has used yet
pub const READGEN_NOTSET: u64 = 0;
/// Page should be evicted before anything else
pub const READGEN_OLDEST: u64 = 1;
/// Page was read by a caller that will not use it again
pub const READGEN_WONT_NEED: u64 = 2;
/// First ordinary generation
pub const READGEN_START_VALUE: u64 = 100;
/// Step added when a resident page is used again
pub const READGEN_STEP: u64 = 100;

/// Whether a generation value marks a page for immediate eviction
#[inline]
pub fn readgen_evict_soon(gen: u64) -> bool {
    gen != READGEN_NOTSET && gen < READGEN_START_VALUE
}

/// Whether `page` is marked for immediate eviction
#[inline]
pub fn page_is_evict_soon(page: &Page) -> bool {
    readgen_evict_soon(page.read_gen())
}

/// Mark `page` for immediate eviction
#[inline]
pub fn evict_soon(page: &Page) {
    page.set_read_gen(READGEN_OLDEST);
}

/// Mark `page` dirty and for immediate eviction, returning the bytes newly
/// counted dirty
pub fn dirty_and_evict_soon(page: &Page) -> u64 {
    let dirty = page.mark_dirty();
    evict_soon(page);
    dirty
}

/// Give a page created from `orig` the same generation
#[inline]
pub fn copy_page_state(orig: &Page, new: &Page) {
    new.set_read_gen(orig.read_gen());
}

/// Cache-wide read generation clock
#[derive(Debug)]
pub struct ReadGenClock {
    current: AtomicU64,
    oldest: AtomicU64,
}

impl Default for ReadGenClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadGenClock {
    /// Start the clock at the first ordinary generation
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(READGEN_START_VALUE),
            oldest: AtomicU64::new(READGEN_START_VALUE),
        }
    }

    /// Current generation
    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Oldest generation seen in the last queue load
    #[inline]
    pub fn oldest(&self) -> u64 {
        self.oldest.load(Ordering::Acquire)
    }

    /// Advance the clock once per eviction pass
    #[inline]
    pub fn incr(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    /// Record the oldest ordinary generation found while filling a queue
    pub fn set_oldest(&self, gen: u64) {
        if gen >= READGEN_START_VALUE {
            self.oldest.store(gen, Ordering::Release);
        }
    }

    /// Generation for a page that was just read: halfway between the oldest
    /// queued page and now, so a page read once does not outrank pages that
    /// were used repeatedly.
    pub fn set_new(&self, page: &Page) {
        page.set_read_gen((self.current() + self.oldest()) / 2);
    }

    /// Move a resident page's generation forward after a use
    pub fn bump(&self, page: &Page) {
        let gen = page.read_gen();
        if readgen_evict_soon(gen) {
            return;
        }
        let current = self.current();
        if gen > current {
            return;
        }
        page.set_read_gen(current + READGEN_STEP);
    }
}
