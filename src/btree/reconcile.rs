//! Reconciliation: turning a dirty resident page into stored bytes
//!
//! The cache calls a [`Reconciler`] before it reclaims a dirty page. The
//! bundled [`ImageReconciler`] writes either a delta with the changed keys or
//! a full image, and refuses pages holding changes that some running
//! transaction may not see yet.

use crate::btree::{PageRef, Tree};
use crate::device::PageAddr;
use crate::page::{DeltaEntry, DeltaOp, DeltaRecord, Page, PageImage, RowEntry, UpdateKind};
use crate::status::Status;
use crate::txn::{TxnOracle, TXN_NONE};

/// What a reconciliation wrote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    /// A full image was written at the address
    Image(PageAddr),
    /// A delta was appended to the image at the address
    Delta(PageAddr),
    /// The page holds no rows; nothing is stored for it
    Empty,
}

impl ReconcileResult {
    /// Stored address after the write
    pub fn addr(self) -> Option<PageAddr> {
        match self {
            ReconcileResult::Image(addr) | ReconcileResult::Delta(addr) => Some(addr),
            ReconcileResult::Empty => None,
        }
    }
}

/// Produces stored bytes for a dirty page
pub trait Reconciler: Send + Sync + 'static {
    /// Write `page`, owned by `pref` in `tree`. Returns `Busy` when the page
    /// cannot be written yet; the page is then left resident and dirty.
    fn reconcile(
        &self,
        tree: &Tree,
        pref: &PageRef,
        page: &Page,
        oracle: &dyn TxnOracle,
    ) -> Result<ReconcileResult, Status>;
}

/// Reconciler writing rows as images and deltas through the tree's store
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageReconciler;

/// Newest value of a row, or `Err(Busy)` if that value is not yet visible to
/// every transaction.
fn stable_value<'a>(row: &'a RowEntry, oracle: &dyn TxnOracle) -> Result<Option<&'a [u8]>, Status> {
    match row.updates.iter().find(|upd| !upd.is_aborted()) {
        Some(upd) => {
            if !oracle.visible_all(upd.txn_id, upd.start_ts) {
                return Err(Status::Busy);
            }
            Ok(match upd.kind {
                UpdateKind::Standard => Some(upd.value.as_slice()),
                UpdateKind::Tombstone => None,
            })
        }
        None => Ok(row.base.as_deref()),
    }
}

/// Delta operation describing the stable state of `row`
fn delta_op(row: &RowEntry) -> DeltaOp {
    let mut live = row.updates.iter().filter(|upd| !upd.is_aborted());
    match live.next() {
        Some(newest) if newest.kind == UpdateKind::Standard => DeltaOp::Insert {
            value: newest.value.clone(),
            start_txn: TXN_NONE,
            start_ts: newest.start_ts,
            stop: None,
        },
        Some(tombstone) => match live.find(|upd| upd.kind == UpdateKind::Standard) {
            Some(value) => DeltaOp::Insert {
                value: value.value.clone(),
                start_txn: TXN_NONE,
                start_ts: value.start_ts,
                stop: Some((TXN_NONE, tombstone.start_ts)),
            },
            None => DeltaOp::Delete {
                txn: TXN_NONE,
                ts: tombstone.start_ts,
            },
        },
        None => match &row.base {
            Some(base) => DeltaOp::Insert {
                value: base.clone(),
                start_txn: TXN_NONE,
                start_ts: 0,
                stop: None,
            },
            None => DeltaOp::Delete { txn: TXN_NONE, ts: 0 },
        },
    }
}

impl Reconciler for ImageReconciler {
    fn reconcile(
        &self,
        tree: &Tree,
        pref: &PageRef,
        page: &Page,
        oracle: &dyn TxnOracle,
    ) -> Result<ReconcileResult, Status> {
        let modify = page.modify().unwrap_or_default();
        let rows = page.rows();

        let mut image_rows = Vec::with_capacity(rows.len());
        for (key, row) in rows.iter() {
            if let Some(value) = stable_value(row, oracle)? {
                image_rows.push((key.clone(), value.to_vec()));
            }
        }

        if image_rows.is_empty() {
            if let Some(addr) = pref.addr() {
                tree.store().remove(addr)?;
            }
            return Ok(ReconcileResult::Empty);
        }

        if let Some(addr) = pref.addr() {
            let use_delta = !modify.needs_image
                && !modify.instantiated
                && !modify.changed.is_empty()
                && modify.changed.len() <= tree.config().delta_max_keys;
            if use_delta {
                let entries = modify
                    .changed
                    .iter()
                    .filter_map(|key| {
                        rows.get(key).map(|row| DeltaEntry {
                            key: key.clone(),
                            op: delta_op(row),
                        })
                    })
                    .collect();
                let delta = DeltaRecord { entries };
                tree.store().append_delta(addr, &delta.encode()?)?;
                return Ok(ReconcileResult::Delta(addr));
            }
        }

        let addr = pref.addr().unwrap_or_else(|| tree.store().allocate());
        let image = PageImage::Leaf { rows: image_rows };
        tree.store().write(addr, &image.encode()?)?;
        Ok(ReconcileResult::Image(addr))
    }
}
