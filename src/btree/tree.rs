//! Trees known to the cache
//!
//! A tree is a resident internal root whose children are leaf pages. The
//! root is never evicted; leaves move in and out of the cache through their
//! [`PageRef`]s.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::btree::{PageDeleted, PageRef, RefState};
use crate::cache::TreeBytes;
use crate::device::{PageAddr, PageStore};
use crate::page::{ChildImage, ChildSlot, Page, PageImage};
use crate::status::Status;

/// Identifier of an open tree
pub type TreeId = u32;

/// Default largest leaf footprint before forced eviction (5MB)
pub const DEFAULT_MAXMEMPAGE: u64 = 5 << 20;

/// Per-tree sizing options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConfig {
    /// Footprint above which a leaf is considered for an in-memory split
    pub splitmempage: u64,
    /// Footprint above which a leaf is forcibly evicted
    pub maxmempage: u64,
    /// The tree is cache resident; its pages are sampled only when
    /// `eviction.evict_sample_inmem` is set, and readers never wait for
    /// eviction on its behalf
    pub in_memory: bool,
    /// Largest number of changed keys written as a delta instead of a full
    /// image
    pub delta_max_keys: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            splitmempage: DEFAULT_MAXMEMPAGE * 8 / 10,
            maxmempage: DEFAULT_MAXMEMPAGE,
            in_memory: false,
            delta_max_keys: 32,
        }
    }
}

impl TreeConfig {
    /// Set `maxmempage` and derive `splitmempage` as 80% of it
    pub fn with_maxmempage(mut self, maxmempage: u64) -> Self {
        self.maxmempage = maxmempage;
        self.splitmempage = maxmempage * 8 / 10;
        self
    }

    /// Mark the tree cache resident
    pub fn with_in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    /// Set the delta size limit
    pub fn with_delta_max_keys(mut self, keys: usize) -> Self {
        self.delta_max_keys = keys;
        self
    }
}

/// A tree of leaf pages under one resident root
pub struct Tree {
    id: TreeId,
    name: String,
    config: TreeConfig,
    store: Arc<dyn PageStore>,
    root: Arc<PageRef>,
    root_page: Arc<Page>,
    root_addr: Mutex<Option<PageAddr>>,
    bytes: TreeBytes,
    evict_disabled: AtomicU32,
    evict_busy: AtomicU32,
    evict_priority: AtomicU64,
    walk_next: AtomicUsize,
    closing: AtomicBool,
}

impl Tree {
    fn with_root(
        id: TreeId,
        name: &str,
        store: Arc<dyn PageStore>,
        config: TreeConfig,
        root_page: Page,
        root_addr: Option<PageAddr>,
    ) -> Self {
        let root_page = Arc::new(root_page);
        Self {
            id,
            name: name.to_string(),
            config,
            store,
            root: Arc::new(PageRef::new_mem(Arc::clone(&root_page), root_addr)),
            root_page,
            root_addr: Mutex::new(root_addr),
            bytes: TreeBytes::new(),
            evict_disabled: AtomicU32::new(0),
            evict_busy: AtomicU32::new(0),
            evict_priority: AtomicU64::new(0),
            walk_next: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
        }
    }

    /// Create an empty tree with a single never-written leaf
    pub fn create(id: TreeId, name: &str, store: Arc<dyn PageStore>, config: TreeConfig) -> Self {
        let leaf = ChildSlot {
            key: Vec::new(),
            pref: Arc::new(PageRef::new_disk(None)),
        };
        Self::with_root(id, name, store, config, Page::new_internal(vec![leaf]), None)
    }

    /// Open a tree whose root image is stored at `root_addr`
    pub fn open(
        id: TreeId,
        name: &str,
        store: Arc<dyn PageStore>,
        config: TreeConfig,
        root_addr: PageAddr,
    ) -> Result<Self, Status> {
        let parts = store.read_multi(root_addr)?;
        let base = parts.first().ok_or(Status::Corruption)?;
        let children = match PageImage::decode(base)? {
            PageImage::Internal { children } => children,
            PageImage::Leaf { .. } => return Err(Status::Corruption),
        };
        if children.is_empty() {
            return Err(Status::Corruption);
        }
        let slots = children
            .into_iter()
            .map(|child| ChildSlot {
                key: child.key,
                pref: Arc::new(PageRef::new_disk(child.addr.map(PageAddr))),
            })
            .collect();
        Ok(Self::with_root(
            id,
            name,
            store,
            config,
            Page::new_internal(slots),
            Some(root_addr),
        ))
    }

    /// Tree identifier
    #[inline]
    pub fn id(&self) -> TreeId {
        self.id
    }

    /// Tree name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sizing options
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Per-tree byte counters
    pub fn bytes(&self) -> &TreeBytes {
        &self.bytes
    }

    /// Reference to the root
    pub fn root_ref(&self) -> &Arc<PageRef> {
        &self.root
    }

    /// Resident root page
    pub fn root_page(&self) -> &Arc<Page> {
        &self.root_page
    }

    /// Address of the stored root image
    pub fn root_addr(&self) -> Option<PageAddr> {
        *self.root_addr.lock()
    }

    /// Leaf reference covering `key`
    pub fn leaf_for(&self, key: &[u8]) -> Result<Arc<PageRef>, Status> {
        self.root_page.child_for(key).ok_or(Status::Corruption)
    }

    /// Whether `pref` is still the leaf covering `key`
    pub fn routes_to(&self, key: &[u8], pref: &Arc<PageRef>) -> bool {
        self.root_page
            .child_for(key)
            .is_some_and(|current| Arc::ptr_eq(&current, pref))
    }

    /// Snapshot of the leaf references
    pub fn leaf_refs(&self) -> Vec<Arc<PageRef>> {
        self.root_page
            .children()
            .iter()
            .map(|slot| Arc::clone(&slot.pref))
            .collect()
    }

    /// Number of leaves
    pub fn leaf_count(&self) -> usize {
        self.root_page.child_count()
    }

    /// Where the next eviction walk of this tree starts; advances the
    /// cursor by `visited`.
    pub fn walk_start(&self, visited: usize) -> usize {
        self.walk_next.fetch_add(visited, Ordering::AcqRel)
    }

    /// Reset the walk cursor to `pos`
    pub fn set_walk_start(&self, pos: usize) {
        self.walk_next.store(pos, Ordering::Release);
    }

    /// Whether eviction of this tree is disabled
    #[inline]
    pub fn evict_disabled(&self) -> bool {
        self.evict_disabled.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn evict_disable(&self) -> u32 {
        self.evict_disabled.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn evict_enable(&self) -> u32 {
        let prev = self.evict_disabled.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "eviction enabled more often than disabled");
        prev - 1
    }

    /// Number of evictions of this tree's pages in progress
    pub fn evict_busy(&self) -> u32 {
        self.evict_busy.load(Ordering::SeqCst)
    }

    pub(crate) fn evict_busy_enter(&self) {
        self.evict_busy.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn evict_busy_leave(&self) {
        self.evict_busy.fetch_sub(1, Ordering::SeqCst);
    }

    /// Score bonus added to this tree's eviction candidates
    #[inline]
    pub fn evict_priority(&self) -> u64 {
        self.evict_priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_evict_priority(&self, priority: u64) {
        self.evict_priority.store(priority, Ordering::Release);
    }

    /// Whether the tree is being closed
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Fast-delete the leaf at `pref` without reading it. Only leaves that
    /// are on disk with a stored image can be fast-deleted.
    pub fn fast_delete(&self, pref: &PageRef, page_del: PageDeleted) -> Result<(), Status> {
        if pref.addr().is_none() || !pref.cas_state(RefState::Disk, RefState::Locked) {
            return Err(Status::Busy);
        }
        pref.set_page_del(Some(page_del));
        pref.set_state(RefState::Deleted);
        Ok(())
    }

    /// Undo a fast delete that has not been read back in
    pub fn fast_delete_rollback(&self, pref: &PageRef) -> bool {
        if !pref.cas_state(RefState::Deleted, RefState::Locked) {
            return false;
        }
        pref.set_page_del(None);
        pref.set_state(RefState::Disk);
        true
    }

    /// Image of the root, listing every child's stored address
    pub fn root_image(&self) -> PageImage {
        let children = self
            .root_page
            .children()
            .iter()
            .map(|slot| ChildImage {
                key: slot.key.clone(),
                addr: slot.pref.addr().map(PageAddr::get),
            })
            .collect();
        PageImage::Internal { children }
    }

    /// Write the root image, allocating its address on first use
    pub fn write_root(&self) -> Result<PageAddr, Status> {
        let bytes = self.root_image().encode()?;
        let mut root_addr = self.root_addr.lock();
        let addr = match *root_addr {
            Some(addr) => addr,
            None => self.store.allocate(),
        };
        self.store.write(addr, &bytes)?;
        *root_addr = Some(addr);
        self.root.set_addr(Some(addr));
        self.root_page.mark_clean();
        Ok(addr)
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("leaves", &self.leaf_count())
            .field("bytes_inmem", &self.bytes.inmem())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemPageStore;

    #[test]
    fn test_create_has_one_unwritten_leaf() {
        let tree = Tree::create(1, "t", Arc::new(MemPageStore::new()), TreeConfig::default());
        assert_eq!(tree.leaf_count(), 1);
        let leaf = tree.leaf_for(b"anything").unwrap();
        assert_eq!(leaf.state(), RefState::Disk);
        assert_eq!(leaf.addr(), None);
        assert_eq!(tree.root_ref().state(), RefState::Mem);
    }

    #[test]
    fn test_root_image_reopens() {
        let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
        let tree = Tree::create(1, "t", Arc::clone(&store), TreeConfig::default());
        tree.leaf_for(b"").unwrap().set_addr(Some(PageAddr(77)));
        let root = tree.write_root().unwrap();

        let reopened = Tree::open(1, "t", store, TreeConfig::default(), root).unwrap();
        assert_eq!(reopened.leaf_count(), 1);
        assert_eq!(reopened.leaf_for(b"k").unwrap().addr(), Some(PageAddr(77)));
    }

    #[test]
    fn test_fast_delete_requires_stored_disk_leaf() {
        let tree = Tree::create(1, "t", Arc::new(MemPageStore::new()), TreeConfig::default());
        let leaf = tree.leaf_for(b"").unwrap();
        let del = PageDeleted {
            txn_id: 5,
            timestamp: 0,
        };
        assert_eq!(tree.fast_delete(&leaf, del), Err(Status::Busy));

        leaf.set_addr(Some(PageAddr(9)));
        tree.fast_delete(&leaf, del).unwrap();
        assert_eq!(leaf.state(), RefState::Deleted);
        assert_eq!(leaf.page_del(), Some(del));

        assert!(tree.fast_delete_rollback(&leaf));
        assert_eq!(leaf.state(), RefState::Disk);
        assert_eq!(leaf.page_del(), None);
    }

    #[test]
    fn test_config_derives_splitmempage() {
        let config = TreeConfig::default().with_maxmempage(1000);
        assert_eq!(config.splitmempage, 800);
    }
}
