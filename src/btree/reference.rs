//! Page references and their state machine
//!
//! A [`PageRef`] is a slot in a parent page's child array. Its state word
//! moves between:
//!
//! ```text
//!   DISK ──CAS──▶ LOCKED(READING) ──store──▶ MEM ──CAS──▶ LOCKED ──▶ DISK
//!   DELETED ─CAS─▶ LOCKED ───────────────────▲             │        DELETED
//!                                                         └──▶ SPLIT
//! ```
//!
//! Readers pin a resident page with a hazard count: increment, then confirm
//! the state is still `MEM`. Eviction swaps `MEM` for `LOCKED`, then
//! confirms the hazard count is zero, reverting to `MEM` otherwise. All
//! four steps are sequentially consistent, so at least one side observes
//! the other.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::device::PageAddr;
use crate::page::Page;
use crate::status::Status;
use crate::txn::{Timestamp, TxnId};

/// Lifecycle state of a page reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RefState {
    /// Only a stored address, nothing resident
    Disk = 0,
    /// Fast-deleted; the stored image is logically empty
    Deleted = 1,
    /// Exclusively held by a reader or an evictor
    Locked = 2,
    /// Resident and usable
    Mem = 3,
    /// Restructured; callers must restart from the parent
    Split = 4,
}

impl RefState {
    /// Decode a raw state word. An unknown value means the reference was
    /// corrupted.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => RefState::Disk,
            1 => RefState::Deleted,
            2 => RefState::Locked,
            3 => RefState::Mem,
            4 => RefState::Split,
            other => panic!("illegal page reference state {other}"),
        }
    }

    /// Name used in logs and cache dumps
    pub const fn as_str(self) -> &'static str {
        match self {
            RefState::Disk => "disk",
            RefState::Deleted => "deleted",
            RefState::Locked => "locked",
            RefState::Mem => "mem",
            RefState::Split => "split",
        }
    }
}

impl fmt::Display for RefState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Reference flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RefFlags: u8 {
        /// A read from the store is in progress
        const READING = 0x01;
        /// Child is a leaf page
        const LEAF = 0x02;
        /// Child is an internal page
        const INTERNAL = 0x04;
        /// Reference sits in an eviction queue
        const EVICT_QUEUED = 0x08;
    }
}

/// Pending fast-delete information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDeleted {
    /// Deleting transaction
    pub txn_id: TxnId,
    /// Commit timestamp of the delete
    pub timestamp: Timestamp,
}

/// Slot owning at most one resident page
pub struct PageRef {
    state: AtomicU8,
    flags: AtomicU8,
    hazard: AtomicU32,
    page: Mutex<Option<Arc<Page>>>,
    addr: Mutex<Option<PageAddr>>,
    page_del: Mutex<Option<PageDeleted>>,
}

impl PageRef {
    fn with_state(state: RefState, flags: RefFlags, addr: Option<PageAddr>, page: Option<Arc<Page>>) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            flags: AtomicU8::new(flags.bits()),
            hazard: AtomicU32::new(0),
            page: Mutex::new(page),
            addr: Mutex::new(addr),
            page_del: Mutex::new(None),
        }
    }

    /// Leaf child that is not resident. `None` means it was never written.
    pub fn new_disk(addr: Option<PageAddr>) -> Self {
        Self::with_state(RefState::Disk, RefFlags::LEAF, addr, None)
    }

    /// Resident child
    pub fn new_mem(page: Arc<Page>, addr: Option<PageAddr>) -> Self {
        let flags = if page.is_leaf() {
            RefFlags::LEAF
        } else {
            RefFlags::INTERNAL
        };
        Self::with_state(RefState::Mem, flags, addr, Some(page))
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> RefState {
        RefState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Swap `old` for `new`, returning whether this thread won
    #[inline]
    pub fn cas_state(&self, old: RefState, new: RefState) -> bool {
        self.state
            .compare_exchange(old as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Publish a new state. Used by the thread owning the `LOCKED` state.
    #[inline]
    pub fn set_state(&self, state: RefState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Current flags
    #[inline]
    pub fn flags(&self) -> RefFlags {
        RefFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Set flags
    #[inline]
    pub fn set_flags(&self, flags: RefFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear flags
    #[inline]
    pub fn clear_flags(&self, flags: RefFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Set a flag, returning whether it was previously clear
    #[inline]
    pub fn test_and_set(&self, flag: RefFlags) -> bool {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel) & flag.bits() == 0
    }

    /// Whether the child is a leaf
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.flags().contains(RefFlags::LEAF)
    }

    /// Stored address
    pub fn addr(&self) -> Option<PageAddr> {
        *self.addr.lock()
    }

    /// Replace the stored address
    pub fn set_addr(&self, addr: Option<PageAddr>) {
        *self.addr.lock() = addr;
    }

    /// Pending fast-delete information
    pub fn page_del(&self) -> Option<PageDeleted> {
        *self.page_del.lock()
    }

    /// Replace the pending fast-delete information
    pub fn set_page_del(&self, page_del: Option<PageDeleted>) {
        *self.page_del.lock() = page_del;
    }

    /// Resident page, if any
    pub fn page(&self) -> Option<Arc<Page>> {
        self.page.lock().clone()
    }

    /// Install a page. Only the thread owning the `LOCKED` state may call
    /// this.
    pub fn set_page(&self, page: Arc<Page>) {
        *self.page.lock() = Some(page);
    }

    /// Detach the page. Only the thread owning the `LOCKED` state may call
    /// this.
    pub fn take_page(&self) -> Option<Arc<Page>> {
        self.page.lock().take()
    }

    /// Number of hazard pins
    #[inline]
    pub fn hazard_count(&self) -> u32 {
        self.hazard.load(Ordering::SeqCst)
    }

    /// Pin the resident page against eviction.
    ///
    /// Returns `Busy` when the page is not in `MEM` after the pin was
    /// published; the pin is withdrawn in that case.
    pub fn hazard_set(&self) -> Result<(), Status> {
        self.hazard.fetch_add(1, Ordering::SeqCst);
        if self.state() == RefState::Mem {
            return Ok(());
        }
        self.hazard.fetch_sub(1, Ordering::SeqCst);
        Err(Status::Busy)
    }

    /// Drop a hazard pin
    #[inline]
    pub fn hazard_clear(&self) {
        let prev = self.hazard.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "hazard pin released twice");
    }

    /// Take the reference for exclusive use by eviction or split.
    ///
    /// `allowed_pins` is the number of pins the caller itself holds.
    pub fn lock_resident(&self, allowed_pins: u32) -> Result<(), Status> {
        if !self.cas_state(RefState::Mem, RefState::Locked) {
            return Err(Status::Busy);
        }
        if self.hazard_count() > allowed_pins {
            self.set_state(RefState::Mem);
            return Err(Status::Busy);
        }
        Ok(())
    }

    /// Take a non-resident reference for reading, returning the state it
    /// had. `None` when another thread won the race or the reference is not
    /// on disk.
    pub fn lock_for_read(&self) -> Option<RefState> {
        let previous = self.state();
        match previous {
            RefState::Disk | RefState::Deleted => {
                if !self.cas_state(previous, RefState::Locked) {
                    return None;
                }
                if previous == RefState::Disk {
                    self.set_flags(RefFlags::READING);
                }
                Some(previous)
            }
            _ => None,
        }
    }
}

impl fmt::Debug for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRef")
            .field("state", &self.state())
            .field("flags", &self.flags())
            .field("hazard", &self.hazard_count())
            .field("addr", &self.addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hazard_pin_requires_mem() {
        let pref = PageRef::new_disk(None);
        assert_eq!(pref.hazard_set(), Err(Status::Busy));
        assert_eq!(pref.hazard_count(), 0);

        let pref = PageRef::new_mem(Arc::new(Page::new_leaf()), None);
        pref.hazard_set().unwrap();
        assert_eq!(pref.hazard_count(), 1);
        pref.hazard_clear();
        assert_eq!(pref.hazard_count(), 0);
    }

    #[test]
    fn test_lock_resident_respects_pins() {
        let pref = PageRef::new_mem(Arc::new(Page::new_leaf()), None);
        pref.hazard_set().unwrap();
        assert_eq!(pref.lock_resident(0), Err(Status::Busy));
        assert_eq!(pref.state(), RefState::Mem);

        pref.lock_resident(1).unwrap();
        assert_eq!(pref.state(), RefState::Locked);
        assert_eq!(pref.hazard_set(), Err(Status::Busy));
        assert_eq!(pref.hazard_count(), 1);
    }

    #[test]
    fn test_lock_for_read_sets_reading_from_disk_only() {
        let pref = PageRef::new_disk(Some(PageAddr(3)));
        assert_eq!(pref.lock_for_read(), Some(RefState::Disk));
        assert!(pref.flags().contains(RefFlags::READING));
        assert_eq!(pref.lock_for_read(), None);

        let deleted = PageRef::new_disk(Some(PageAddr(4)));
        deleted.set_state(RefState::Deleted);
        assert_eq!(deleted.lock_for_read(), Some(RefState::Deleted));
        assert!(!deleted.flags().contains(RefFlags::READING));
    }

    #[test]
    #[should_panic(expected = "illegal page reference state")]
    fn test_illegal_state_panics() {
        RefState::from_u8(9);
    }
}
