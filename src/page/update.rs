//! Update chains attached to rows of a resident leaf page

use crate::txn::{Timestamp, TxnId, TXN_ABORTED};

/// Kind of change an update applies to its key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// A new value for the key
    Standard,
    /// The key was removed
    Tombstone,
}

/// One entry of a row's update chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    /// Writing transaction, `TXN_ABORTED` once rolled back
    pub txn_id: TxnId,
    /// Commit timestamp
    pub start_ts: Timestamp,
    /// Value or tombstone
    pub kind: UpdateKind,
    /// Value bytes, empty for tombstones
    pub value: Vec<u8>,
    /// Rebuilt from a stored delta rather than written in this process
    pub restored: bool,
}

/// Fixed accounting cost of one update besides its value
pub const UPDATE_OVERHEAD: u64 = 48;

impl Update {
    /// New value written by `txn_id`
    pub fn standard(txn_id: TxnId, start_ts: Timestamp, value: Vec<u8>) -> Self {
        Self {
            txn_id,
            start_ts,
            kind: UpdateKind::Standard,
            value,
            restored: false,
        }
    }

    /// Removal written by `txn_id`
    pub fn tombstone(txn_id: TxnId, start_ts: Timestamp) -> Self {
        Self {
            txn_id,
            start_ts,
            kind: UpdateKind::Tombstone,
            value: Vec::new(),
            restored: false,
        }
    }

    /// Mark as rebuilt from a delta
    pub fn restored(mut self) -> Self {
        self.restored = true;
        self
    }

    /// Whether the writing transaction rolled back
    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.txn_id == TXN_ABORTED
    }

    /// Bytes this update adds to a page footprint
    #[inline]
    pub fn memory_size(&self) -> u64 {
        UPDATE_OVERHEAD + self.value.len() as u64
    }
}

/// A row of a leaf page: the value from the base image plus the newer
/// updates, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowEntry {
    /// Value from the base image, if the key was present there
    pub base: Option<Vec<u8>>,
    /// Update chain, newest first
    pub updates: Vec<Update>,
}

impl RowEntry {
    /// Row read from a base image
    pub fn from_base(value: Vec<u8>) -> Self {
        Self {
            base: Some(value),
            updates: Vec::new(),
        }
    }

    /// Newest committed-or-running value, ignoring rolled back updates
    pub fn newest_value(&self) -> Option<&[u8]> {
        match self.updates.iter().find(|upd| !upd.is_aborted()) {
            Some(upd) => match upd.kind {
                UpdateKind::Standard => Some(upd.value.as_slice()),
                UpdateKind::Tombstone => None,
            },
            None => self.base.as_deref(),
        }
    }

    /// Whether any update on the chain was rebuilt from a delta
    pub fn has_restored(&self) -> bool {
        self.updates.iter().any(|upd| upd.restored)
    }

    /// Push an update as the newest on the chain
    pub fn push(&mut self, upd: Update) {
        self.updates.insert(0, upd);
    }

    /// Bytes this row occupies, excluding its key
    pub fn memory_size(&self) -> u64 {
        let base = self.base.as_ref().map_or(0, |v| v.len() as u64);
        base + self.updates.iter().map(Update::memory_size).sum::<u64>()
    }
}
