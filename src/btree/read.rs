//! Page reader
//!
//! Turns a stored page (base image plus deltas) into a resident [`Page`].
//! Only the thread that moved the reference from `DISK`/`DELETED` to
//! `LOCKED` builds the page, so reconstruction is single threaded.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::btree::{PageRef, ReadFlags, RefFlags, RefState, Tree};
use crate::cache::CacheAccounting;
use crate::page::{DeltaOp, DeltaRecord, Page, PageFlags, PageImage, RowEntry, Update};
use crate::status::Status;
use crate::txn::{OldestFlags, TxnOracle};

/// Apply delta records to the rows of a base image.
///
/// Deltas are given oldest first and replayed newest first. Only the newest
/// change to a key matters: a key whose chain already starts with an update
/// restored from a newer delta is skipped. Returns the number of keys
/// restored.
pub fn replay_deltas(rows: &mut BTreeMap<Vec<u8>, RowEntry>, deltas: &[DeltaRecord]) -> usize {
    let mut restored = 0;
    for delta in deltas.iter().rev() {
        for entry in &delta.entries {
            if rows
                .get(&entry.key)
                .and_then(|row| row.updates.first())
                .is_some_and(|upd| upd.restored)
            {
                continue;
            }
            let row = rows.entry(entry.key.clone()).or_default();
            match &entry.op {
                DeltaOp::Delete { txn, ts } => {
                    row.push(Update::tombstone(*txn, *ts).restored());
                }
                DeltaOp::Insert {
                    value,
                    start_txn,
                    start_ts,
                    stop,
                } => {
                    row.push(Update::standard(*start_txn, *start_ts, value.clone()).restored());
                    if let Some((stop_txn, stop_ts)) = stop {
                        row.push(Update::tombstone(*stop_txn, *stop_ts).restored());
                    }
                }
            }
            restored += 1;
        }
    }
    restored
}

fn decode_leaf(parts: &[Vec<u8>]) -> Result<BTreeMap<Vec<u8>, RowEntry>, Status> {
    let (base, deltas) = parts.split_first().ok_or(Status::Corruption)?;
    let mut rows = match PageImage::decode(base)? {
        PageImage::Leaf { rows } => rows
            .into_iter()
            .map(|(key, value)| (key, RowEntry::from_base(value)))
            .collect::<BTreeMap<_, _>>(),
        PageImage::Internal { .. } => return Err(Status::Corruption),
    };
    if !deltas.is_empty() {
        let deltas = deltas
            .iter()
            .map(|bytes| DeltaRecord::decode(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        replay_deltas(&mut rows, &deltas);
    }
    Ok(rows)
}

/// Empty leaf standing in for a fast-deleted page. It is dirty: the stored
/// image still holds the deleted rows until the page is written again.
fn instantiated_leaf() -> Page {
    let page = Page::new_leaf();
    page.mark_dirty();
    page.with_modify(|m| {
        m.instantiated = true;
        m.needs_image = true;
    });
    page
}

fn build_page(
    tree: &Tree,
    pref: &PageRef,
    previous: RefState,
    flags: ReadFlags,
    oracle: &dyn TxnOracle,
) -> Result<Page, Status> {
    let Some(addr) = pref.addr() else {
        return Ok(Page::new_leaf());
    };

    if previous == RefState::Deleted {
        oracle.update_oldest(OldestFlags::STRICT | OldestFlags::WAIT)?;
        if let Some(del) = pref.page_del() {
            if oracle.visible_all(del.txn_id, del.timestamp) {
                pref.set_page_del(None);
            }
        }
        if pref.page_del().is_none() {
            return Ok(instantiated_leaf());
        }
    }

    let parts = tree.store().read_multi(addr)?;
    let rows = decode_leaf(&parts)?;
    drop(parts);
    let page = Page::leaf_from_rows(rows);
    if flags.contains(ReadFlags::IGNORE_CACHE_SIZE) {
        page.set_flags(PageFlags::EVICT_NO_PROGRESS);
    }

    if previous == RefState::Deleted {
        // The delete is not yet visible to everyone: rebuild it as
        // tombstones so older readers still see the rows.
        let del = pref.page_del().ok_or(Status::Corruption)?;
        let keys: Vec<Vec<u8>> = page.rows().keys().cloned().collect();
        for key in keys {
            page.apply_update(&key, Update::tombstone(del.txn_id, del.timestamp));
        }
        page.with_modify(|m| m.instantiated = true);
        pref.set_page_del(None);
    }
    Ok(page)
}

/// Read the page behind `pref` into the cache.
///
/// Returns `Ok(false)` without doing anything when another thread won the
/// race to lock the reference, `Ok(true)` once this thread has made the page
/// resident. On failure everything built so far is released and the
/// reference is restored to its previous state.
pub fn read_page(
    tree: &Tree,
    pref: &PageRef,
    flags: ReadFlags,
    oracle: &dyn TxnOracle,
    cache: &CacheAccounting,
) -> Result<bool, Status> {
    let Some(previous) = pref.lock_for_read() else {
        return Ok(false);
    };
    let page_del = pref.page_del();

    match build_page(tree, pref, previous, flags, oracle) {
        Ok(page) => {
            cache.page_in(tree.bytes(), &page);
            pref.set_page(Arc::new(page));
            pref.clear_flags(RefFlags::READING);
            pref.set_state(RefState::Mem);
            Ok(true)
        }
        Err(status) => {
            tracing::warn!(
                tree = tree.name(),
                addr = ?pref.addr(),
                status = %status,
                "page read failed"
            );
            pref.set_page_del(page_del);
            pref.clear_flags(RefFlags::READING);
            pref.set_state(previous);
            Err(status)
        }
    }
}
