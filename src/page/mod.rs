//! In-memory pages
//!
//! A [`Page`] is the resident form of a stored page: the rows of its base
//! image with their update chains (leaf pages) or its child references
//! (internal pages), plus the bookkeeping eviction needs: the memory
//! footprint, the read generation, and the modify state.

mod image;
mod update;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::btree::PageRef;
use crate::evict::READGEN_NOTSET;
use crate::txn::{TxnId, TXN_ABORTED, TXN_NONE};

pub use image::{
    ChildImage, DeltaEntry, DeltaOp, DeltaRecord, FrameKind, PageImage, FRAME_HEADER_SIZE,
};
pub use update::{RowEntry, Update, UpdateKind, UPDATE_OVERHEAD};

/// Fixed accounting cost of a page
pub const PAGE_OVERHEAD: u64 = 256;
/// Fixed accounting cost of one row besides its key and value
pub const ROW_OVERHEAD: u64 = 32;
/// Fixed accounting cost of one child slot besides its key
pub const CHILD_OVERHEAD: u64 = 64;

/// Leaf or internal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Holds rows
    Leaf,
    /// Holds child references
    Internal,
}

bitflags! {
    /// Per-page eviction flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Evicting this page does not count as eviction progress
        const EVICT_NO_PROGRESS = 0x01;
        /// Page was created by an in-memory split
        const SPLIT_INSERT = 0x02;
    }
}

/// Modify state, present once a page has been written to
#[derive(Debug, Clone, Default)]
pub struct PageModify {
    /// Content differs from what is stored
    pub dirty: bool,
    /// Page was created from a globally visible fast delete
    pub instantiated: bool,
    /// Oldest transaction id when eviction last failed on this page
    pub last_eviction_id: TxnId,
    /// Bytes of this page currently counted as dirty
    pub bytes_dirty: u64,
    /// Keys changed since the page was last written
    pub changed: BTreeSet<Vec<u8>>,
    /// The stored image no longer matches the page shape; the next write
    /// must be a full image rather than a delta
    pub needs_image: bool,
}

/// Outcome of applying one update, used for cache accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modification {
    /// Bytes added to the page footprint
    pub added: u64,
    /// Bytes added to the dirty count
    pub dirty_added: u64,
}

/// Child slot of a resident internal page
#[derive(Clone)]
pub struct ChildSlot {
    /// Smallest key routed to this child
    pub key: Vec<u8>,
    /// Reference to the child
    pub pref: Arc<PageRef>,
}

/// A resident page
pub struct Page {
    kind: PageKind,
    rows: RwLock<BTreeMap<Vec<u8>, RowEntry>>,
    children: RwLock<Vec<ChildSlot>>,
    memory_footprint: AtomicU64,
    bytes_updates: AtomicU64,
    read_gen: AtomicU64,
    flags: AtomicU8,
    modify: Mutex<Option<PageModify>>,
}

fn row_size(key: &[u8], row: &RowEntry) -> u64 {
    ROW_OVERHEAD + key.len() as u64 + row.memory_size()
}

impl Page {
    fn with_parts(kind: PageKind, rows: BTreeMap<Vec<u8>, RowEntry>, children: Vec<ChildSlot>) -> Self {
        let mut footprint = PAGE_OVERHEAD;
        let mut updates = 0;
        for (key, row) in &rows {
            footprint += row_size(key, row);
            updates += row.updates.iter().map(Update::memory_size).sum::<u64>();
        }
        for child in &children {
            footprint += CHILD_OVERHEAD + child.key.len() as u64;
        }
        Self {
            kind,
            rows: RwLock::new(rows),
            children: RwLock::new(children),
            memory_footprint: AtomicU64::new(footprint),
            bytes_updates: AtomicU64::new(updates),
            read_gen: AtomicU64::new(READGEN_NOTSET),
            flags: AtomicU8::new(0),
            modify: Mutex::new(None),
        }
    }

    /// Empty leaf page
    pub fn new_leaf() -> Self {
        Self::with_parts(PageKind::Leaf, BTreeMap::new(), Vec::new())
    }

    /// Leaf page built from reconstructed rows
    pub fn leaf_from_rows(rows: BTreeMap<Vec<u8>, RowEntry>) -> Self {
        Self::with_parts(PageKind::Leaf, rows, Vec::new())
    }

    /// Internal page over the given children
    pub fn new_internal(children: Vec<ChildSlot>) -> Self {
        Self::with_parts(PageKind::Internal, BTreeMap::new(), children)
    }

    /// Leaf or internal
    #[inline]
    pub fn kind(&self) -> PageKind {
        self.kind
    }

    /// Whether this is a leaf page
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.kind == PageKind::Leaf
    }

    /// Bytes this page occupies in the cache
    #[inline]
    pub fn footprint(&self) -> u64 {
        self.memory_footprint.load(Ordering::Acquire)
    }

    /// Bytes of update chains on this page
    #[inline]
    pub fn bytes_updates(&self) -> u64 {
        self.bytes_updates.load(Ordering::Acquire)
    }

    /// Current read generation
    #[inline]
    pub fn read_gen(&self) -> u64 {
        self.read_gen.load(Ordering::Acquire)
    }

    /// Replace the read generation
    #[inline]
    pub fn set_read_gen(&self, gen: u64) {
        self.read_gen.store(gen, Ordering::Release);
    }

    /// Current flags
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Set flags
    pub fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Whether the content differs from what is stored
    pub fn is_dirty(&self) -> bool {
        self.modify.lock().as_ref().is_some_and(|m| m.dirty)
    }

    /// Whether the page carries modify state
    pub fn is_modified(&self) -> bool {
        self.modify.lock().is_some()
    }

    /// Run `f` against the modify state, creating it if needed
    pub fn with_modify<R>(&self, f: impl FnOnce(&mut PageModify) -> R) -> R {
        let mut modify = self.modify.lock();
        f(modify.get_or_insert_with(PageModify::default))
    }

    /// Snapshot of the modify state
    pub fn modify(&self) -> Option<PageModify> {
        self.modify.lock().clone()
    }

    /// Mark the page clean, returning the bytes that were counted dirty
    pub fn mark_clean(&self) -> u64 {
        let mut modify = self.modify.lock();
        match modify.as_mut() {
            Some(m) => {
                m.dirty = false;
                m.needs_image = false;
                m.changed.clear();
                std::mem::take(&mut m.bytes_dirty)
            }
            None => 0,
        }
    }

    /// Mark the page dirty, returning the bytes newly counted dirty
    pub fn mark_dirty(&self) -> u64 {
        let footprint = self.footprint();
        self.with_modify(|m| {
            if m.dirty {
                return 0;
            }
            m.dirty = true;
            m.bytes_dirty = footprint;
            footprint
        })
    }

    /// Newest value for `key`, `None` if absent or removed
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.rows
            .read()
            .get(key)
            .and_then(|row| row.newest_value().map(<[u8]>::to_vec))
    }

    /// Number of rows
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Read access to the rows
    pub fn rows(&self) -> RwLockReadGuard<'_, BTreeMap<Vec<u8>, RowEntry>> {
        self.rows.read()
    }

    /// Prepend `upd` to the chain of `key` and mark the page dirty
    pub fn apply_update(&self, key: &[u8], upd: Update) -> Modification {
        let upd_size = upd.memory_size();
        let added = {
            let mut rows = self.rows.write();
            match rows.get_mut(key) {
                Some(row) => {
                    row.push(upd);
                    upd_size
                }
                None => {
                    let mut row = RowEntry::default();
                    row.push(upd);
                    let size = row_size(key, &row);
                    rows.insert(key.to_vec(), row);
                    size
                }
            }
        };
        self.memory_footprint.fetch_add(added, Ordering::AcqRel);
        self.bytes_updates.fetch_add(upd_size, Ordering::AcqRel);

        let footprint = self.footprint();
        let dirty_added = self.with_modify(|m| {
            m.changed.insert(key.to_vec());
            if m.dirty {
                m.bytes_dirty += added;
                added
            } else {
                m.dirty = true;
                m.bytes_dirty = footprint;
                footprint
            }
        });
        Modification { added, dirty_added }
    }

    /// Mark every update of `txn` on `key` as rolled back
    pub fn abort_updates(&self, key: &[u8], txn: TxnId) -> usize {
        if txn == TXN_NONE {
            return 0;
        }
        let mut rows = self.rows.write();
        let Some(row) = rows.get_mut(key) else {
            return 0;
        };
        let mut count = 0;
        for upd in row.updates.iter_mut().filter(|u| u.txn_id == txn) {
            upd.txn_id = TXN_ABORTED;
            count += 1;
        }
        count
    }

    /// Mark every update of `txn` on the page as rolled back
    pub fn abort_txn(&self, txn: TxnId) -> usize {
        if txn == TXN_NONE {
            return 0;
        }
        let mut rows = self.rows.write();
        let mut count = 0;
        for upd in rows
            .values_mut()
            .flat_map(|row| row.updates.iter_mut())
            .filter(|u| u.txn_id == txn)
        {
            upd.txn_id = TXN_ABORTED;
            count += 1;
        }
        count
    }

    /// Read access to the children of an internal page
    pub fn children(&self) -> RwLockReadGuard<'_, Vec<ChildSlot>> {
        self.children.read()
    }

    /// Number of children
    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Child reference covering `key`
    pub fn child_for(&self, key: &[u8]) -> Option<Arc<PageRef>> {
        let children = self.children.read();
        let idx = match children.binary_search_by(|slot| slot.key.as_slice().cmp(key)) {
            Ok(idx) => idx,
            Err(0) => 0,
            Err(idx) => idx - 1,
        };
        children.get(idx).map(|slot| Arc::clone(&slot.pref))
    }

    /// Replace the slot holding `old` with `slots`, returning the change
    /// in footprint. `None` when `old` is not a child of this page.
    pub fn replace_child(&self, old: &Arc<PageRef>, slots: Vec<ChildSlot>) -> Option<Modification> {
        let (removed, added) = {
            let mut children = self.children.write();
            let pos = children.iter().position(|c| Arc::ptr_eq(&c.pref, old))?;
            let removed = CHILD_OVERHEAD + children[pos].key.len() as u64;
            let added: u64 = slots
                .iter()
                .map(|slot| CHILD_OVERHEAD + slot.key.len() as u64)
                .sum();
            children.splice(pos..=pos, slots);
            (removed, added)
        };
        let grown = added.saturating_sub(removed);
        self.memory_footprint.fetch_add(grown, Ordering::AcqRel);
        let footprint = self.footprint();
        let dirty_added = self.with_modify(|m| {
            if m.dirty {
                m.bytes_dirty += grown;
                grown
            } else {
                m.dirty = true;
                m.bytes_dirty = footprint;
                footprint
            }
        });
        Some(Modification {
            added: grown,
            dirty_added,
        })
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("kind", &self.kind)
            .field("footprint", &self.footprint())
            .field("read_gen", &self.read_gen())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
