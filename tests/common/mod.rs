//! Shared test utilities for eviction and fault injection tests.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use oxievict::btree::{page_in, ImageReconciler, ReadFlags, Reconciler, Tree, TreeConfig, TreeId};
use oxievict::device::{MemPageStore, PageAddr, PageStore};
use oxievict::evict::{EvictCaller, EvictionConfig, EvictionEngine};
use oxievict::page::{ChildImage, PageImage, Update};
use oxievict::txn::{TxnGlobal, TXN_NONE};

/// A fault-injection wrapper around any `PageStore`.
///
/// Allows deterministic injection of:
/// - write errors at a specific operation count
/// - read errors on demand
pub struct FaultInjectionStore<S> {
    inner: S,
    /// Total number of write and append calls observed so far.
    write_count: AtomicU64,
    /// When non-zero, the Nth write (1-based) will return an I/O error.
    fail_write_at: AtomicU64,
    /// When true, every read returns an error.
    fail_reads: AtomicBool,
}

impl<S: PageStore> FaultInjectionStore<S> {
    /// Wrap an existing store for fault injection.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            write_count: AtomicU64::new(0),
            fail_write_at: AtomicU64::new(0),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Make the Nth write (1-based) return `io::ErrorKind::Other`.
    pub fn inject_write_error_at(&self, operation_n: u64) {
        self.fail_write_at.store(operation_n, Ordering::SeqCst);
    }

    /// Make reads fail until cleared.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Return the total number of writes observed.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check_write(&self) -> io::Result<()> {
        let n = self.write_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_write_at.load(Ordering::SeqCst) == n {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write error"));
        }
        Ok(())
    }
}

impl<S: PageStore> PageStore for FaultInjectionStore<S> {
    fn read_multi(&self, addr: PageAddr) -> io::Result<Vec<Vec<u8>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read error"));
        }
        self.inner.read_multi(addr)
    }

    fn write(&self, addr: PageAddr, image: &[u8]) -> io::Result<()> {
        self.check_write()?;
        self.inner.write(addr, image)
    }

    fn append_delta(&self, addr: PageAddr, delta: &[u8]) -> io::Result<()> {
        self.check_write()?;
        self.inner.append_delta(addr, delta)
    }

    fn allocate(&self) -> PageAddr {
        self.inner.allocate()
    }

    fn remove(&self, addr: PageAddr) -> io::Result<()> {
        self.inner.remove(addr)
    }
}

/// Engine with no background threads, using `reconciler` for writes.
pub fn engine_with(
    config: EvictionConfig,
    reconciler: Arc<dyn Reconciler>,
) -> (Arc<EvictionEngine>, Arc<TxnGlobal>) {
    let txn = Arc::new(TxnGlobal::new());
    let engine = EvictionEngine::new(config.validated().unwrap(), txn.clone(), reconciler);
    (engine, txn)
}

/// Engine with no background threads writing through the bundled reconciler.
pub fn engine(config: EvictionConfig) -> (Arc<EvictionEngine>, Arc<TxnGlobal>) {
    engine_with(config, Arc::new(ImageReconciler))
}

/// Tree of `leaves` never-written leaves in `store`, keyed `[]`, `[1]`, `[2]`...
pub fn tree_with_leaves(
    id: TreeId,
    leaves: u8,
    store: Arc<dyn PageStore>,
    config: TreeConfig,
) -> Arc<Tree> {
    let children = (0..leaves)
        .map(|i| ChildImage {
            key: if i == 0 { Vec::new() } else { vec![i] },
            addr: None,
        })
        .collect();
    let root = store.allocate();
    store
        .write(root, &PageImage::Internal { children }.encode().unwrap())
        .unwrap();
    Arc::new(Tree::open(id, &format!("tree-{id}"), store, config, root).unwrap())
}

/// Same as [`tree_with_leaves`] over a fresh in-memory store.
pub fn mem_tree(id: TreeId, leaves: u8, config: TreeConfig) -> Arc<Tree> {
    tree_with_leaves(id, leaves, Arc::new(MemPageStore::new()), config)
}

/// Read every leaf of `tree` and give leaf `i` `rows` committed rows keyed
/// `[i, n]` with `value_len`-byte values.
pub fn fill_leaves(engine: &EvictionEngine, tree: &Arc<Tree>, rows: u8, value_len: usize) {
    let caller = EvictCaller {
        ignore_cache_size: true,
        ..EvictCaller::idle()
    };
    for (i, pref) in tree.leaf_refs().iter().enumerate() {
        let handle = page_in(engine, tree, pref, ReadFlags::NO_SPLIT, &caller).unwrap();
        for n in 0..rows {
            let upd = Update::standard(TXN_NONE, 0, vec![n; value_len]);
            let size = upd.memory_size();
            let change = handle.apply_update(&[i as u8, n], upd);
            engine.cache().page_modified(tree.bytes(), change, size);
        }
    }
}
