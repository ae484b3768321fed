//! Store failure tests using the FaultInjectionStore.
//!
//! These tests verify that I/O errors from the page store surface to the
//! caller and leave the page reference in a usable state.

mod common;

use std::sync::Arc;

use oxievict::btree::{page_in, ReadFlags, RefFlags, RefState, TreeConfig};
use oxievict::device::{MemPageStore, PageStore};
use oxievict::evict::{EvictCaller, EvictionConfig};
use oxievict::status::Status;

use common::{engine, fill_leaves, tree_with_leaves, FaultInjectionStore};

fn faulty_tree() -> (
    Arc<oxievict::EvictionEngine>,
    Arc<FaultInjectionStore<MemPageStore>>,
    Arc<oxievict::Tree>,
) {
    let (engine, _txn) = engine(EvictionConfig::default());
    let store = Arc::new(FaultInjectionStore::new(MemPageStore::new()));
    let tree = tree_with_leaves(1, 2, store.clone(), TreeConfig::default());
    engine.add_tree(Arc::clone(&tree));
    fill_leaves(&engine, &tree, 4, 8);
    (engine, store, tree)
}

#[test]
fn test_write_failure_keeps_page_dirty() {
    let (engine, store, tree) = faulty_tree();
    store.inject_write_error_at(store.write_count() + 1);

    assert_eq!(engine.evict_tree(&tree, false), Err(Status::IoError));
    let failed = tree
        .leaf_refs()
        .into_iter()
        .find(|pref| pref.state() == RefState::Mem)
        .unwrap();
    assert!(failed.page().unwrap().is_dirty());
    assert_eq!(engine.stats().snapshot().evict_failures, 1);
    assert!(!tree.evict_disabled());

    // The next attempt goes through.
    assert!(engine.evict_tree(&tree, false).unwrap() >= 1);
    assert!(tree
        .leaf_refs()
        .iter()
        .all(|pref| pref.state() == RefState::Disk));
    assert_eq!(engine.cache().pages_inmem(), 0);
    assert_eq!(engine.cache().bytes_dirty(), 0);
}

#[test]
fn test_read_failure_restores_reference() {
    let (engine, store, tree) = faulty_tree();
    engine.evict_tree(&tree, false).unwrap();
    let leaf = tree.leaf_for(b"").unwrap();
    let caller = EvictCaller::idle();

    store.set_fail_reads(true);
    assert_eq!(
        page_in(&engine, &tree, &leaf, ReadFlags::empty(), &caller).unwrap_err(),
        Status::IoError
    );
    assert_eq!(leaf.state(), RefState::Disk);
    assert!(!leaf.flags().contains(RefFlags::READING));
    assert_eq!(engine.cache().pages_inmem(), 0);

    store.set_fail_reads(false);
    let handle = page_in(&engine, &tree, &leaf, ReadFlags::empty(), &caller).unwrap();
    assert_eq!(handle.get(&[0, 3]), Some(vec![3; 8]));
}

#[test]
fn test_checksum_mismatch_is_corruption() {
    let (engine, store, tree) = faulty_tree();
    engine.evict_tree(&tree, false).unwrap();
    let leaf = tree.leaf_for(b"").unwrap();
    let addr = leaf.addr().unwrap();

    let mut image = store.inner().read_multi(addr).unwrap().remove(0);
    let last = image.len() - 1;
    image[last] ^= 0xff;
    store.inner().write(addr, &image).unwrap();

    assert_eq!(
        page_in(&engine, &tree, &leaf, ReadFlags::empty(), &EvictCaller::idle()).unwrap_err(),
        Status::Corruption
    );
    assert_eq!(leaf.state(), RefState::Disk);
}

#[test]
fn test_truncated_segment_is_corruption() {
    let (engine, store, tree) = faulty_tree();
    engine.evict_tree(&tree, false).unwrap();
    let leaf = tree.leaf_for(b"").unwrap();
    let addr = leaf.addr().unwrap();

    let mut image = store.inner().read_multi(addr).unwrap().remove(0);
    image.truncate(image.len() - 1);
    store.inner().write(addr, &image).unwrap();

    assert_eq!(
        page_in(&engine, &tree, &leaf, ReadFlags::empty(), &EvictCaller::idle()).unwrap_err(),
        Status::Corruption
    );
    assert_eq!(leaf.state(), RefState::Disk);
    assert!(!leaf.flags().contains(RefFlags::READING));
    assert_eq!(engine.cache().pages_inmem(), 0);
}
