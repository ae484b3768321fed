//! Helpers shared by unit tests

use std::sync::Arc;

use crate::btree::{PageRef, RefFlags, RefState, Tree, TreeConfig, TreeId};
use crate::cache::CacheAccounting;
use crate::device::{MemPageStore, PageStore};
use crate::page::{ChildImage, Page, PageImage, Update};
use crate::txn::TXN_NONE;

/// Tree with `leaves` never-written leaves keyed `[]`, `[1]`, `[2]`...
pub(crate) fn tree_with_leaves(id: TreeId, leaves: u8, config: TreeConfig) -> Arc<Tree> {
    let store = Arc::new(MemPageStore::new());
    let children = (0..leaves)
        .map(|i| ChildImage {
            key: if i == 0 { Vec::new() } else { vec![i] },
            addr: None,
        })
        .collect();
    let addr = store.allocate();
    let image = PageImage::Internal { children }.encode().unwrap();
    store.write(addr, &image).unwrap();
    Arc::new(Tree::open(id, &format!("tree-{id}"), store, config, addr).unwrap())
}

/// Make `pref` resident with `rows` committed rows of 64 bytes, counted in
/// `cache`
pub(crate) fn make_resident(
    cache: &CacheAccounting,
    tree: &Tree,
    pref: &PageRef,
    first_key: u8,
    rows: u8,
) -> Arc<Page> {
    let page = Arc::new(Page::new_leaf());
    for i in 0..rows {
        let key = [first_key, i];
        page.apply_update(&key, Update::standard(TXN_NONE, 0, vec![i; 64]));
    }
    cache.page_in(tree.bytes(), &page);
    pref.lock_for_read().unwrap();
    pref.set_page(Arc::clone(&page));
    pref.clear_flags(RefFlags::READING);
    pref.set_state(RefState::Mem);
    page
}
