//! In-memory leaf splits
//!
//! A large leaf that can still be held in memory is split into two new
//! leaves instead of being written out. The old reference moves to `SPLIT`
//! and is replaced in the root, so threads still holding it restart from the
//! root.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::btree::{PageRef, RefState, Tree};
use crate::cache::CacheAccounting;
use crate::evict;
use crate::page::{ChildSlot, Page, PageFlags, RowEntry};
use crate::status::Status;

/// Whether `page` has enough rows to split
pub fn leaf_page_can_split(page: &Page) -> bool {
    page.is_leaf() && page.row_count() >= 2
}

fn new_half(rows: BTreeMap<Vec<u8>, RowEntry>, orig: &Page) -> Arc<Page> {
    let page = Page::leaf_from_rows(rows);
    evict::copy_page_state(orig, &page);
    page.mark_dirty();
    page.with_modify(|m| m.needs_image = true);
    Arc::new(page)
}

/// Split the leaf at `pref` into two leaves.
///
/// The caller must hold `pref` in the `LOCKED` state. On success the
/// reference is left in `SPLIT`; on failure it is left `LOCKED` and the page
/// untouched.
pub fn split_leaf(
    tree: &Tree,
    pref: &Arc<PageRef>,
    page: &Arc<Page>,
    cache: &CacheAccounting,
) -> Result<[Arc<PageRef>; 2], Status> {
    debug_assert_eq!(pref.state(), RefState::Locked);
    if !leaf_page_can_split(page) {
        return Err(Status::Busy);
    }

    let slot_key = tree
        .root_page()
        .children()
        .iter()
        .find(|slot| Arc::ptr_eq(&slot.pref, pref))
        .map(|slot| slot.key.clone())
        .ok_or(Status::Restart)?;

    let mut left_rows = page.rows().clone();
    let split_key = match left_rows.keys().nth(left_rows.len() / 2) {
        Some(key) => key.clone(),
        None => return Err(Status::Busy),
    };
    let right_rows = left_rows.split_off(&split_key);

    let left = new_half(left_rows, page);
    let right = new_half(right_rows, page);
    right.set_flags(PageFlags::SPLIT_INSERT);
    let left_ref = Arc::new(PageRef::new_mem(Arc::clone(&left), pref.addr()));
    let right_ref = Arc::new(PageRef::new_mem(Arc::clone(&right), None));

    let slots = vec![
        ChildSlot {
            key: slot_key,
            pref: Arc::clone(&left_ref),
        },
        ChildSlot {
            key: split_key,
            pref: Arc::clone(&right_ref),
        },
    ];
    let change = tree
        .root_page()
        .replace_child(pref, slots)
        .ok_or(Status::Restart)?;
    cache.page_modified(tree.bytes(), change, 0);

    cache.page_out(tree.bytes(), page);
    cache.page_in(tree.bytes(), &left);
    cache.page_in(tree.bytes(), &right);
    pref.set_state(RefState::Split);

    tracing::debug!(
        tree = tree.name(),
        left_rows = left.row_count(),
        right_rows = right.row_count(),
        "split leaf in memory"
    );
    Ok([left_ref, right_ref])
}
