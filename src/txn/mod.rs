//! Transaction-manager seam
//!
//! The cache only needs three things from the transaction system: the oldest
//! transaction id any reader might still need, a global visibility check, and
//! a way to push the oldest-id watermark forward before making visibility
//! decisions. [`TxnOracle`] is that seam; [`TxnGlobal`] is a small in-process
//! implementation used by the connection by default and by the tests.

mod global;

pub use global::TxnGlobal;

use bitflags::bitflags;

use crate::status::Status;

/// Transaction identifier
pub type TxnId = u64;

/// Commit timestamp
pub type Timestamp = u64;

/// No transaction
pub const TXN_NONE: TxnId = 0;

/// First id handed out to a transaction
pub const TXN_FIRST: TxnId = 1;

/// Transaction id that is never visible to anyone
pub const TXN_ABORTED: TxnId = u64::MAX;

/// No timestamp
pub const TS_NONE: Timestamp = 0;

bitflags! {
    /// Flags for [`TxnOracle::update_oldest`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OldestFlags: u32 {
        /// Compute an exact value rather than a cheap approximation
        const STRICT = 0x1;
        /// Wait for the lock protecting the oldest id rather than skipping
        const WAIT = 0x2;
    }
}

/// Interface to the transaction manager
pub trait TxnOracle: Send + Sync + 'static {
    /// Oldest transaction id still active (or pinned by a snapshot)
    fn oldest_id(&self) -> TxnId;

    /// Most recently allocated transaction id
    fn current_id(&self) -> TxnId;

    /// Whether a change made by `txn_id` at `timestamp` is visible to every
    /// current and future reader
    fn visible_all(&self, txn_id: TxnId, timestamp: Timestamp) -> bool;

    /// Advance the oldest-id watermark
    fn update_oldest(&self, flags: OldestFlags) -> Result<(), Status>;
}
