//! Backing-store traits
//!
//! The page cache fetches and persists pages through [`PageStore`]. A stored
//! page is a base image followed by zero or more delta records appended since
//! the base was written; the store treats both as opaque byte strings.

use std::fmt;
use std::io;

/// Address of a page in the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PageAddr(pub u64);

impl PageAddr {
    /// Raw address value
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PageAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Synchronous page store used to read and write page images
pub trait PageStore: Send + Sync + 'static {
    /// Read a page: the base image followed by its deltas, oldest first.
    ///
    /// The returned vector is never empty on success.
    fn read_multi(&self, addr: PageAddr) -> io::Result<Vec<Vec<u8>>>;

    /// Replace the page at `addr` with a full image, discarding its deltas
    fn write(&self, addr: PageAddr, image: &[u8]) -> io::Result<()>;

    /// Append a delta record to the page at `addr`
    fn append_delta(&self, addr: PageAddr, delta: &[u8]) -> io::Result<()>;

    /// Allocate a fresh address
    fn allocate(&self) -> PageAddr;

    /// Free the page at `addr`
    fn remove(&self, addr: PageAddr) -> io::Result<()>;

    /// Make previous writes durable
    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_addr_display() {
        assert_eq!(PageAddr(255).to_string(), "0xff");
        assert_eq!(PageAddr(7).get(), 7);
    }
}
