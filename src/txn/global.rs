//! In-process transaction bookkeeping

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{OldestFlags, Timestamp, TxnId, TxnOracle, TS_NONE, TXN_ABORTED, TXN_FIRST, TXN_NONE};
use crate::status::Status;

/// Global transaction state: id allocation, running transactions, and the
/// oldest-id / oldest-timestamp watermarks.
///
/// `update_oldest` recomputes the watermark from the set of running
/// transactions; until it is called, `oldest_id` may lag.
pub struct TxnGlobal {
    current: AtomicU64,
    oldest_id: AtomicU64,
    oldest_timestamp: AtomicU64,
    running: Mutex<BTreeMap<TxnId, usize>>,
    update_count: AtomicU64,
}

impl TxnGlobal {
    /// Create an empty transaction table
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(TXN_FIRST),
            oldest_id: AtomicU64::new(TXN_FIRST),
            oldest_timestamp: AtomicU64::new(TS_NONE),
            running: Mutex::new(BTreeMap::new()),
            update_count: AtomicU64::new(0),
        }
    }

    /// Begin a transaction, returning its id
    pub fn begin(&self) -> TxnId {
        let mut running = self.running.lock();
        let id = self.current.fetch_add(1, Ordering::AcqRel);
        *running.entry(id).or_insert(0) += 1;
        id
    }

    /// Finish (commit or roll back) a transaction
    pub fn finish(&self, id: TxnId) {
        let mut running = self.running.lock();
        if let Some(count) = running.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                running.remove(&id);
            }
        }
    }

    /// Number of running transactions
    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    /// Move the oldest timestamp forward
    pub fn set_oldest_timestamp(&self, ts: Timestamp) {
        self.oldest_timestamp.fetch_max(ts, Ordering::AcqRel);
    }

    /// Oldest timestamp any reader may use
    pub fn oldest_timestamp(&self) -> Timestamp {
        self.oldest_timestamp.load(Ordering::Acquire)
    }

    /// Number of `update_oldest` calls observed
    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }
}

impl Default for TxnGlobal {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnOracle for TxnGlobal {
    fn oldest_id(&self) -> TxnId {
        self.oldest_id.load(Ordering::Acquire)
    }

    fn current_id(&self) -> TxnId {
        self.current.load(Ordering::Acquire)
    }

    fn visible_all(&self, txn_id: TxnId, timestamp: Timestamp) -> bool {
        if txn_id == TXN_ABORTED {
            return false;
        }
        if txn_id != TXN_NONE && txn_id >= self.oldest_id() {
            return false;
        }
        timestamp == TS_NONE || timestamp <= self.oldest_timestamp()
    }

    fn update_oldest(&self, flags: OldestFlags) -> Result<(), Status> {
        self.update_count.fetch_add(1, Ordering::Relaxed);
        let running = if flags.contains(OldestFlags::WAIT) {
            self.running.lock()
        } else {
            match self.running.try_lock() {
                Some(guard) => guard,
                None => return Ok(()),
            }
        };
        let oldest = running
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.current.load(Ordering::Acquire));
        self.oldest_id.fetch_max(oldest, Ordering::AcqRel);
        Ok(())
    }
}
