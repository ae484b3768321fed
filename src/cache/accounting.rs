//! Cache byte accounting
//!
//! Three byte counts drive eviction: bytes in use by resident pages, bytes
//! of dirty pages, and bytes of update chains. Each is kept cache-wide in
//! [`CacheAccounting`] and per tree in [`TreeBytes`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::page::{Modification, Page};

fn saturating_sub(counter: &AtomicU64, value: u64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
        Some(cur.saturating_sub(value))
    });
}

/// Per-tree byte counters
#[derive(Debug, Default)]
pub struct TreeBytes {
    inmem: AtomicU64,
    dirty: AtomicU64,
    updates: AtomicU64,
}

impl TreeBytes {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of resident pages
    pub fn inmem(&self) -> u64 {
        self.inmem.load(Ordering::Acquire)
    }

    /// Bytes of dirty pages
    pub fn dirty(&self) -> u64 {
        self.dirty.load(Ordering::Acquire)
    }

    /// Bytes of update chains
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }
}

/// Snapshot of the cache-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUsage {
    /// Bytes of resident pages
    pub inuse: u64,
    /// Bytes of dirty pages
    pub dirty: u64,
    /// Bytes of update chains
    pub updates: u64,
    /// Number of resident pages
    pub pages: u64,
}

/// Cache-wide byte counters
#[derive(Debug, Default)]
pub struct CacheAccounting {
    inuse: AtomicU64,
    dirty: AtomicU64,
    updates: AtomicU64,
    pages: AtomicU64,
}

impl CacheAccounting {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of resident pages
    #[inline]
    pub fn bytes_inuse(&self) -> u64 {
        self.inuse.load(Ordering::Acquire)
    }

    /// Bytes of dirty pages
    #[inline]
    pub fn bytes_dirty(&self) -> u64 {
        self.dirty.load(Ordering::Acquire)
    }

    /// Bytes of update chains
    #[inline]
    pub fn bytes_updates(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }

    /// Number of resident pages
    #[inline]
    pub fn pages_inmem(&self) -> u64 {
        self.pages.load(Ordering::Acquire)
    }

    /// Snapshot every counter
    pub fn usage(&self) -> CacheUsage {
        CacheUsage {
            inuse: self.bytes_inuse(),
            dirty: self.bytes_dirty(),
            updates: self.bytes_updates(),
            pages: self.pages_inmem(),
        }
    }

    /// A page became resident
    pub fn page_in(&self, tree: &TreeBytes, page: &Page) {
        let footprint = page.footprint();
        let updates = page.bytes_updates();
        self.inuse.fetch_add(footprint, Ordering::AcqRel);
        self.updates.fetch_add(updates, Ordering::AcqRel);
        self.pages.fetch_add(1, Ordering::AcqRel);
        tree.inmem.fetch_add(footprint, Ordering::AcqRel);
        tree.updates.fetch_add(updates, Ordering::AcqRel);
        let dirty = page.modify().map_or(0, |m| m.bytes_dirty);
        if dirty > 0 {
            self.dirty.fetch_add(dirty, Ordering::AcqRel);
            tree.dirty.fetch_add(dirty, Ordering::AcqRel);
        }
    }

    /// An update was applied to a resident page
    pub fn page_modified(&self, tree: &TreeBytes, change: Modification, update_bytes: u64) {
        self.inuse.fetch_add(change.added, Ordering::AcqRel);
        self.dirty.fetch_add(change.dirty_added, Ordering::AcqRel);
        self.updates.fetch_add(update_bytes, Ordering::AcqRel);
        tree.inmem.fetch_add(change.added, Ordering::AcqRel);
        tree.dirty.fetch_add(change.dirty_added, Ordering::AcqRel);
        tree.updates.fetch_add(update_bytes, Ordering::AcqRel);
    }

    /// A page was written and its dirty bytes released
    pub fn page_cleaned(&self, tree: &TreeBytes, dirty_bytes: u64) {
        saturating_sub(&self.dirty, dirty_bytes);
        saturating_sub(&tree.dirty, dirty_bytes);
    }

    /// Bytes moved out of the accounting of one page, for example by a split
    /// that is about to account them to a new page
    pub fn bytes_moved_out(&self, tree: &TreeBytes, bytes: u64, updates: u64) {
        saturating_sub(&self.inuse, bytes);
        saturating_sub(&self.updates, updates);
        saturating_sub(&tree.inmem, bytes);
        saturating_sub(&tree.updates, updates);
    }

    /// A page left the cache
    pub fn page_out(&self, tree: &TreeBytes, page: &Page) {
        let footprint = page.footprint();
        let updates = page.bytes_updates();
        let dirty = page.modify().map_or(0, |m| m.bytes_dirty);
        saturating_sub(&self.inuse, footprint);
        saturating_sub(&self.updates, updates);
        saturating_sub(&self.dirty, dirty);
        saturating_sub(&self.pages, 1);
        saturating_sub(&tree.inmem, footprint);
        saturating_sub(&tree.updates, updates);
        saturating_sub(&tree.dirty, dirty);
    }
}
