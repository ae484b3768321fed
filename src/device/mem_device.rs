//! In-memory page store
//!
//! Keeps every page image in a hash map. Useful for tests and for
//! cache-only configurations.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::device::{PageAddr, PageStore};

#[derive(Debug, Default, Clone)]
struct StoredPage {
    base: Vec<u8>,
    deltas: Vec<Vec<u8>>,
}

/// Page store backed by process memory
pub struct MemPageStore {
    pages: RwLock<HashMap<u64, StoredPage>>,
    next_addr: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemPageStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(HashMap::new()),
            next_addr: AtomicU64::new(1),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of pages stored
    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    /// Whether the store holds no pages
    pub fn is_empty(&self) -> bool {
        self.pages.read().is_empty()
    }

    /// Number of `read_multi` calls served
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of full-image writes
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of deltas currently stacked on a page
    pub fn delta_count(&self, addr: PageAddr) -> usize {
        self.pages
            .read()
            .get(&addr.get())
            .map_or(0, |page| page.deltas.len())
    }
}

impl Default for MemPageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore for MemPageStore {
    fn read_multi(&self, addr: PageAddr) -> io::Result<Vec<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let pages = self.pages.read();
        let page = pages.get(&addr.get()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no page at {addr}"))
        })?;
        let mut parts = Vec::with_capacity(1 + page.deltas.len());
        parts.push(page.base.clone());
        parts.extend(page.deltas.iter().cloned());
        Ok(parts)
    }

    fn write(&self, addr: PageAddr, image: &[u8]) -> io::Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut pages = self.pages.write();
        pages.insert(
            addr.get(),
            StoredPage {
                base: image.to_vec(),
                deltas: Vec::new(),
            },
        );
        self.next_addr.fetch_max(addr.get() + 1, Ordering::AcqRel);
        Ok(())
    }

    fn append_delta(&self, addr: PageAddr, delta: &[u8]) -> io::Result<()> {
        let mut pages = self.pages.write();
        let page = pages.get_mut(&addr.get()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no page at {addr}"))
        })?;
        page.deltas.push(delta.to_vec());
        Ok(())
    }

    fn allocate(&self) -> PageAddr {
        PageAddr(self.next_addr.fetch_add(1, Ordering::AcqRel))
    }

    fn remove(&self, addr: PageAddr) -> io::Result<()> {
        self.pages.write().remove(&addr.get());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let store = MemPageStore::new();
        let addr = store.allocate();
        store.write(addr, b"base").unwrap();
        store.append_delta(addr, b"d1").unwrap();
        store.append_delta(addr, b"d2").unwrap();

        let parts = store.read_multi(addr).unwrap();
        assert_eq!(parts, vec![b"base".to_vec(), b"d1".to_vec(), b"d2".to_vec()]);
        assert_eq!(store.delta_count(addr), 2);

        store.write(addr, b"new").unwrap();
        assert_eq!(store.read_multi(addr).unwrap(), vec![b"new".to_vec()]);
    }

    #[test]
    fn test_missing_page() {
        let store = MemPageStore::new();
        let err = store.read_multi(PageAddr(99)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(store.append_delta(PageAddr(99), b"x").is_err());
    }

    #[test]
    fn test_allocate_skips_written_addresses() {
        let store = MemPageStore::new();
        store.write(PageAddr(10), b"x").unwrap();
        assert!(store.allocate().get() > 10);
    }
}
