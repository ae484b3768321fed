//! Connections and sessions
//!
//! A [`Connection`] owns the eviction engine, the open trees, the
//! transaction table and, when configured, the chunk metadata server. Each
//! thread works through its own [`Session`], which carries the transaction
//! state eviction needs to decide how much an application thread may help.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::btree::{
    page_in, ImageReconciler, PageDeleted, PageHandle, PageRef, ReadFlags, Reconciler, Tree,
    TreeConfig,
};
use crate::config::{ConfigError, OxievictConfig};
use crate::device::{PageAddr, PageStore};
use crate::evict::{EvictCaller, EvictionConfig, EvictionEngine};
use crate::metadata::{IndexConfig, MetadataError, MetadataServer};
use crate::page::Update;
use crate::status::Status;
use crate::txn::{OldestFlags, TxnGlobal, TxnId, TxnOracle, TS_NONE, TXN_NONE};

/// An open cache: eviction engine, trees and background threads
pub struct Connection {
    engine: Arc<EvictionEngine>,
    txn: Arc<TxnGlobal>,
    trees: RwLock<HashMap<String, Arc<Tree>>>,
    next_tree_id: AtomicU32,
    metadata: Mutex<Option<Arc<MetadataServer>>>,
    closed: AtomicBool,
}

impl Connection {
    /// Open a connection writing pages with the bundled reconciler and
    /// start eviction.
    pub fn open(config: EvictionConfig) -> Result<Self, ConfigError> {
        Self::open_with_reconciler(config, Arc::new(ImageReconciler))
    }

    /// Open a connection writing pages with `reconciler`.
    pub fn open_with_reconciler(
        config: EvictionConfig,
        reconciler: Arc<dyn Reconciler>,
    ) -> Result<Self, ConfigError> {
        let config = config.validated()?;
        let txn = Arc::new(TxnGlobal::new());
        let engine = EvictionEngine::new(config, txn.clone(), reconciler);
        engine.start();
        tracing::info!(
            cache_size = engine.config().cache_size,
            workers = engine.worker_count(),
            "connection opened"
        );
        Ok(Self {
            engine,
            txn,
            trees: RwLock::new(HashMap::new()),
            next_tree_id: AtomicU32::new(1),
            metadata: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Open a connection from loaded configuration, starting the metadata
    /// server when a metadata path is configured.
    pub fn from_config(config: &OxievictConfig) -> Result<Self, ConfigError> {
        let conn = Self::open(config.to_eviction_config()?)?;
        if let Some((path, index)) = config.metadata_config()? {
            conn.start_metadata(&path, index).map_err(|err| {
                ConfigError::Invalid(format!("metadata server {}: {err}", path.display()))
            })?;
        }
        Ok(conn)
    }

    /// Start the chunk metadata server on the index at `path`.
    pub fn start_metadata(&self, path: &Path, config: IndexConfig) -> Result<(), MetadataError> {
        let mut slot = self.metadata.lock();
        if slot.is_none() {
            *slot = Some(Arc::new(MetadataServer::create(path, config)?));
        }
        Ok(())
    }

    /// The chunk metadata server, if started
    pub fn metadata(&self) -> Option<Arc<MetadataServer>> {
        self.metadata.lock().clone()
    }

    /// The eviction engine
    pub fn engine(&self) -> &Arc<EvictionEngine> {
        &self.engine
    }

    /// The transaction table
    pub fn txn(&self) -> &Arc<TxnGlobal> {
        &self.txn
    }

    /// Start a session for the calling thread
    pub fn session(&self) -> Session<'_> {
        Session {
            conn: self,
            txn_id: TXN_NONE,
            mod_count: 0,
            touched: Vec::new(),
            fast_deleted: Vec::new(),
        }
    }

    fn default_tree_config(&self) -> TreeConfig {
        TreeConfig::default().with_maxmempage(self.engine.config().maxmempage)
    }

    fn register(&self, name: &str, build: impl FnOnce(u32) -> Result<Tree, Status>) -> Result<Arc<Tree>, Status> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::Aborted);
        }
        let mut trees = self.trees.write();
        if trees.contains_key(name) {
            return Err(Status::InvalidArgument);
        }
        let id = self.next_tree_id.fetch_add(1, Ordering::Relaxed);
        let tree = Arc::new(build(id)?);
        trees.insert(name.to_string(), Arc::clone(&tree));
        self.engine.add_tree(Arc::clone(&tree));
        tracing::debug!(tree = name, id, "tree opened");
        Ok(tree)
    }

    /// Create an empty tree named `name` in `store`
    pub fn create_tree(&self, name: &str, store: Arc<dyn PageStore>) -> Result<Arc<Tree>, Status> {
        let config = self.default_tree_config();
        self.create_tree_with(name, store, config)
    }

    /// Create an empty tree with explicit sizing
    pub fn create_tree_with(
        &self,
        name: &str,
        store: Arc<dyn PageStore>,
        config: TreeConfig,
    ) -> Result<Arc<Tree>, Status> {
        self.register(name, |id| Ok(Tree::create(id, name, store, config)))
    }

    /// Open the tree whose root image is stored at `root`
    pub fn open_tree(
        &self,
        name: &str,
        store: Arc<dyn PageStore>,
        root: PageAddr,
    ) -> Result<Arc<Tree>, Status> {
        let config = self.default_tree_config();
        self.register(name, |id| Tree::open(id, name, store, config, root))
    }

    /// Open tree by name
    pub fn tree(&self, name: &str) -> Option<Arc<Tree>> {
        self.trees.read().get(name).cloned()
    }

    /// Every open tree
    pub fn trees(&self) -> Vec<Arc<Tree>> {
        self.trees.read().values().cloned().collect()
    }

    /// Close a tree: write its dirty leaves (or drop them when `discard`
    /// is set), write its root and forget it. Returns the root address.
    pub fn close_tree(&self, name: &str, discard: bool) -> Result<Option<PageAddr>, Status> {
        let Some(tree) = self.trees.write().remove(name) else {
            return Err(Status::NotFound);
        };
        tree.set_closing();
        let result = self.engine.evict_tree(&tree, discard).and_then(|_| {
            if discard {
                Ok(None)
            } else {
                let root = tree.write_root()?;
                tree.store().sync()?;
                Ok(Some(root))
            }
        });
        self.engine.remove_tree(tree.id());
        tracing::debug!(tree = name, discard, "tree closed");
        result
    }

    /// Change settings at runtime. The merged settings are validated
    /// before anything changes; a rejected change leaves every setting as
    /// it was.
    pub fn reconfigure<K, V>(&self, pairs: &[(K, V)]) -> Result<(), ConfigError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut next = self.engine.config();
        next.apply_pairs(pairs)?;
        next.validate()?;
        self.engine.set_config(next);
        if !self.closed.load(Ordering::Acquire) {
            self.engine.resize_workers(self.engine.worker_count());
        }
        tracing::info!(keys = pairs.len(), "connection reconfigured");
        Ok(())
    }

    /// Release a page acquired by a session, evicting it at once when it
    /// was marked for eviction
    pub fn release_evict(&self, handle: PageHandle) -> Result<(), Status> {
        handle.release(&self.engine)
    }

    /// Stop eviction, write every tree and stop the metadata server.
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<(), Status> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.engine.shutdown();

        let mut result = Ok(());
        let names: Vec<String> = self.trees.read().keys().cloned().collect();
        for name in names {
            if let Err(status) = self.close_tree(&name, false) {
                tracing::warn!(tree = %name, status = %status, "tree close failed");
                result = Err(status);
            }
        }

        if let Some(server) = self.metadata.lock().take() {
            if let Err(err) = server.destroy() {
                tracing::error!(error = %err, "chunk metadata server stopped with an error");
                result = result.and(Err(Status::IoError));
            }
        }
        tracing::info!("connection closed");
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(status) = self.close() {
            tracing::warn!(status = %status, "connection close failed");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("trees", &self.trees.read().len())
            .field("workers", &self.engine.worker_count())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Per-thread handle on a connection
pub struct Session<'a> {
    conn: &'a Connection,
    txn_id: TxnId,
    mod_count: usize,
    touched: Vec<(Arc<Tree>, Vec<u8>)>,
    fast_deleted: Vec<(Arc<Tree>, Arc<PageRef>)>,
}

impl<'a> Session<'a> {
    /// Owning connection
    pub fn connection(&self) -> &'a Connection {
        self.conn
    }

    /// Running transaction, `TXN_NONE` outside a transaction
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    fn caller(&self) -> EvictCaller {
        if self.txn_id == TXN_NONE {
            EvictCaller::idle()
        } else {
            EvictCaller::in_txn(self.txn_id, self.mod_count)
        }
    }

    /// Begin a transaction
    pub fn begin(&mut self) -> Result<TxnId, Status> {
        if self.txn_id != TXN_NONE {
            return Err(Status::InvalidArgument);
        }
        self.txn_id = self.conn.txn.begin();
        Ok(self.txn_id)
    }

    /// Commit the running transaction
    pub fn commit(&mut self) -> Result<(), Status> {
        if self.txn_id == TXN_NONE {
            return Err(Status::InvalidArgument);
        }
        self.finish();
        Ok(())
    }

    /// Roll back the running transaction, undoing its updates and fast
    /// deletes
    pub fn rollback(&mut self) -> Result<(), Status> {
        if self.txn_id == TXN_NONE {
            return Err(Status::InvalidArgument);
        }
        let txn = self.txn_id;
        let touched = std::mem::take(&mut self.touched);
        let mut result = Ok(());
        for (tree, key) in &touched {
            match self.acquire(tree, key, ReadFlags::NO_GEN | ReadFlags::NO_SPLIT, EvictCaller::idle()) {
                Ok(handle) => {
                    handle.abort_updates(key, txn);
                }
                Err(status) => result = Err(status),
            }
        }
        for (tree, pref) in std::mem::take(&mut self.fast_deleted) {
            if let Err(status) = self.rollback_fast_delete(&tree, &pref, txn) {
                result = Err(status);
            }
        }
        self.finish();
        result
    }

    /// Undo a fast delete by `txn`. A leaf read back in since then carries
    /// the delete as tombstones of `txn`, possibly spread over the leaves it
    /// was split into.
    fn rollback_fast_delete(
        &self,
        tree: &Arc<Tree>,
        pref: &Arc<PageRef>,
        txn: TxnId,
    ) -> Result<(), Status> {
        if tree.fast_delete_rollback(pref) {
            return Ok(());
        }
        let engine = &self.conn.engine;
        let flags = ReadFlags::NO_GEN | ReadFlags::NO_SPLIT | ReadFlags::IGNORE_CACHE_SIZE;
        let caller = EvictCaller::idle();
        match page_in(engine, tree, pref, flags, &caller) {
            Ok(handle) => {
                handle.abort_txn(txn);
                Ok(())
            }
            Err(Status::Restart) => {
                for leaf in tree.leaf_refs() {
                    match page_in(engine, tree, &leaf, flags | ReadFlags::CACHE_ONLY, &caller) {
                        Ok(handle) => {
                            handle.abort_txn(txn);
                        }
                        Err(Status::NotFound | Status::Restart) => {}
                        Err(status) => return Err(status),
                    }
                }
                Ok(())
            }
            Err(status) => Err(status),
        }
    }

    /// Roll the running transaction back when the cache reports itself
    /// stuck, then pass the result on
    fn stuck_rollback<T>(&mut self, result: Result<T, Status>) -> Result<T, Status> {
        if matches!(result, Err(Status::CacheStuck)) && self.txn_id != TXN_NONE {
            self.rollback()?;
        }
        result
    }

    fn finish(&mut self) {
        self.conn.txn.finish(self.txn_id);
        // Errors here only mean the watermark moves on the next try.
        let _ = self.conn.txn.update_oldest(OldestFlags::WAIT);
        self.txn_id = TXN_NONE;
        self.mod_count = 0;
        self.touched.clear();
        self.fast_deleted.clear();
    }

    /// Pinned leaf page covering `key`, following splits. A stuck cache
    /// rolls the running transaction back.
    pub fn acquire_page(&mut self, tree: &Arc<Tree>, key: &[u8], flags: ReadFlags) -> Result<PageHandle, Status> {
        let acquired = self.acquire(tree, key, flags, self.caller());
        self.stuck_rollback(acquired)
    }

    fn acquire(
        &self,
        tree: &Arc<Tree>,
        key: &[u8],
        flags: ReadFlags,
        caller: EvictCaller,
    ) -> Result<PageHandle, Status> {
        loop {
            let pref = tree.leaf_for(key)?;
            match page_in(&self.conn.engine, tree, &pref, flags, &caller) {
                Ok(handle) if tree.routes_to(key, handle.pref()) => return Ok(handle),
                Ok(_) | Err(Status::Restart) => continue,
                Err(status) => return Err(status),
            }
        }
    }

    /// Insert or overwrite `key`
    pub fn insert(&mut self, tree: &Arc<Tree>, key: &[u8], value: &[u8]) -> Result<(), Status> {
        self.modify(tree, key, Update::standard(self.txn_id, TS_NONE, value.to_vec()))
    }

    /// Remove `key`
    pub fn remove(&mut self, tree: &Arc<Tree>, key: &[u8]) -> Result<(), Status> {
        self.modify(tree, key, Update::tombstone(self.txn_id, TS_NONE))
    }

    fn modify(&mut self, tree: &Arc<Tree>, key: &[u8], upd: Update) -> Result<(), Status> {
        let conn = self.conn;
        let engine = &conn.engine;
        let checked = engine.eviction_check(&self.caller(), false, false, Some(tree));
        self.stuck_rollback(checked)?;

        let acquired = self.acquire(tree, key, ReadFlags::empty(), self.caller());
        let handle = self.stuck_rollback(acquired)?;
        let upd_size = upd.memory_size();
        let change = handle.apply_update(key, upd);
        engine.cache().page_modified(tree.bytes(), change, upd_size);
        if self.txn_id != TXN_NONE {
            self.mod_count += 1;
            self.touched.push((Arc::clone(tree), key.to_vec()));
        }
        handle.release(engine)
    }

    /// Value of `key`, `None` if absent or removed
    pub fn get(&mut self, tree: &Arc<Tree>, key: &[u8]) -> Result<Option<Vec<u8>>, Status> {
        let acquired = self.acquire(tree, key, ReadFlags::empty(), self.caller());
        let handle = self.stuck_rollback(acquired)?;
        let value = handle.get(key);
        handle.release(&self.conn.engine)?;
        Ok(value)
    }

    /// Delete the whole leaf covering `key` without reading it. Only leaves
    /// on disk can be fast-deleted; others return `Busy`.
    pub fn fast_delete(&mut self, tree: &Arc<Tree>, key: &[u8]) -> Result<(), Status> {
        let pref = tree.leaf_for(key)?;
        tree.fast_delete(
            &pref,
            PageDeleted {
                txn_id: self.txn_id,
                timestamp: TS_NONE,
            },
        )?;
        if self.txn_id != TXN_NONE {
            self.fast_deleted.push((Arc::clone(tree), pref));
        }
        Ok(())
    }

    /// Write every dirty page and every root. Dirty pages stay resident;
    /// the cache is scrubbed harder while the checkpoint runs.
    pub fn checkpoint(&mut self) -> Result<(), Status> {
        if self.txn_id != TXN_NONE {
            return Err(Status::InvalidArgument);
        }
        let engine = &self.conn.engine;
        engine.set_checkpoint_scrub(true);
        let result: Result<usize, Status> = self.conn.trees().iter().try_fold(0, |written, tree| {
            let count = engine.write_tree(tree)?;
            tree.write_root()?;
            tree.store().sync()?;
            Ok(written + count)
        });
        engine.set_checkpoint_scrub(false);
        let written = result?;
        tracing::debug!(pages = written, "checkpoint complete");
        Ok(())
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.txn_id != TXN_NONE {
            if let Err(status) = self.rollback() {
                tracing::warn!(status = %status, "rollback on session close failed");
            }
        }
    }
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("txn_id", &self.txn_id)
            .field("mod_count", &self.mod_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::RefState;
    use crate::device::MemPageStore;

    fn open(config: EvictionConfig) -> Connection {
        Connection::open(config).unwrap()
    }

    #[test]
    fn test_insert_get_remove() {
        let conn = open(EvictionConfig::default());
        let tree = conn.create_tree("t", Arc::new(MemPageStore::new())).unwrap();
        let mut session = conn.session();

        session.insert(&tree, b"a", b"1").unwrap();
        session.insert(&tree, b"b", b"2").unwrap();
        assert_eq!(session.get(&tree, b"a").unwrap(), Some(b"1".to_vec()));
        session.remove(&tree, b"a").unwrap();
        assert_eq!(session.get(&tree, b"a").unwrap(), None);
        assert!(conn.engine().cache().bytes_dirty() > 0);
        assert_eq!(conn.create_tree("t", Arc::new(MemPageStore::new())).unwrap_err(), Status::InvalidArgument);
    }

    #[test]
    fn test_rollback_hides_updates() {
        let conn = open(EvictionConfig::default());
        let tree = conn.create_tree("t", Arc::new(MemPageStore::new())).unwrap();
        let mut session = conn.session();

        session.insert(&tree, b"k", b"committed").unwrap();
        session.begin().unwrap();
        session.insert(&tree, b"k", b"pending").unwrap();
        assert_eq!(session.get(&tree, b"k").unwrap(), Some(b"pending".to_vec()));
        session.rollback().unwrap();
        assert_eq!(session.get(&tree, b"k").unwrap(), Some(b"committed".to_vec()));
        assert_eq!(session.rollback().unwrap_err(), Status::InvalidArgument);
    }

    #[test]
    fn test_checkpoint_then_reopen() {
        let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
        let root = {
            let conn = open(EvictionConfig::default());
            let tree = conn.create_tree("t", Arc::clone(&store)).unwrap();
            let mut session = conn.session();
            for i in 0..20u8 {
                session.insert(&tree, &[i], &[i; 16]).unwrap();
            }
            session.checkpoint().unwrap();
            assert_eq!(conn.engine().cache().bytes_dirty(), 0);
            drop(session);
            conn.close_tree("t", false).unwrap().unwrap()
        };

        let conn = open(EvictionConfig::default());
        let tree = conn.open_tree("t", store, root).unwrap();
        let mut session = conn.session();
        assert_eq!(session.get(&tree, &[7]).unwrap(), Some(vec![7; 16]));
    }

    #[test]
    fn test_reconfigure_is_all_or_nothing() {
        let conn = open(EvictionConfig::default());
        let before = conn.engine().config();

        let err = conn
            .reconfigure(&[("eviction.threads_max", "4"), ("eviction_target", "99")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert_eq!(conn.engine().config(), before);

        conn.reconfigure(&[("eviction.threads_min", "2"), ("eviction.threads_max", "4")])
            .unwrap();
        assert_eq!(conn.engine().config().threads_max, 4);
        assert_eq!(conn.engine().worker_count(), 2);
    }

    #[test]
    fn test_fast_delete_rolls_back() {
        let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
        let conn = open(EvictionConfig::default());
        let tree = conn.create_tree("t", store).unwrap();
        let mut session = conn.session();
        session.insert(&tree, b"x", b"1").unwrap();
        conn.engine().evict_tree(&tree, false).unwrap();
        let leaf = tree.leaf_for(b"x").unwrap();
        assert_eq!(leaf.state(), RefState::Disk);

        session.begin().unwrap();
        session.fast_delete(&tree, b"x").unwrap();
        assert_eq!(leaf.state(), RefState::Deleted);
        session.rollback().unwrap();
        assert_eq!(leaf.state(), RefState::Disk);
        assert_eq!(session.get(&tree, b"x").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_stuck_cache_rolls_back_reads() {
        let conn = open(EvictionConfig {
            cache_size: 64 << 10,
            cache_max_wait_ms: 50,
            ..EvictionConfig::default()
        });
        let hot = conn.create_tree("hot", Arc::new(MemPageStore::new())).unwrap();
        let cold = conn.create_tree("cold", Arc::new(MemPageStore::new())).unwrap();
        let mut session = conn.session();
        session.insert(&cold, b"x", b"1").unwrap();
        conn.engine().evict_tree(&cold, false).unwrap();

        // A pinned page larger than the cache keeps it over its trigger.
        let pin = session.acquire_page(&hot, b"big", ReadFlags::NO_SPLIT).unwrap();
        session.insert(&hot, b"big", &vec![7; 80_000]).unwrap();
        session.begin().unwrap();
        session.insert(&hot, b"pending", b"p").unwrap();
        assert_eq!(pin.get(b"pending"), Some(b"p".to_vec()));

        for _ in 0..200 {
            conn.engine().server_pass();
        }
        assert!(conn.engine().stuck());

        assert_eq!(session.get(&cold, b"x").unwrap_err(), Status::CacheStuck);
        assert_eq!(session.txn_id(), TXN_NONE);
        assert_eq!(pin.get(b"pending"), None);
        assert_eq!(pin.get(b"big"), Some(vec![7; 80_000]));
        assert_eq!(session.commit().unwrap_err(), Status::InvalidArgument);

        drop(pin);
        drop(session);
        conn.close().unwrap();
    }

    #[test]
    fn test_close_writes_trees() {
        let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
        let conn = open(EvictionConfig::default());
        let tree = conn.create_tree("t", store).unwrap();
        conn.session().insert(&tree, b"x", b"1").unwrap();
        let leaf = tree.leaf_for(b"x").unwrap();

        conn.close().unwrap();
        assert_eq!(leaf.state(), RefState::Disk);
        assert!(tree.root_addr().is_some());
        assert!(conn.trees().is_empty());
        assert_eq!(conn.engine().worker_count(), 0);
        conn.close().unwrap();
    }
}
