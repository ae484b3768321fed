//! Backing-store abstraction
//!
//! This module provides the [`PageStore`] seam through which the page cache
//! reads page images and their deltas, and writes reconciled images back.

mod file_device;
mod mem_device;
mod traits;

pub use file_device::FilePageStore;
pub use mem_device::MemPageStore;
pub use traits::{PageAddr, PageStore};
