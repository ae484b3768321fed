//! oxievict - page cache residency and eviction for an embedded B-tree engine
//!
//! Pages of a tree live on a backing store and move in and out of a bounded
//! cache. This crate decides when pages are read, which pages leave, and who
//! does the work:
//!
//! - **Page references**: a small lock-free state machine per page with
//!   hazard pins, so readers and evictors never free a page in use
//! - **Page reads**: images plus deltas rebuilt into resident pages
//! - **Pressure control**: targets and triggers over total, dirty and
//!   update-chain bytes
//! - **Eviction**: a server thread filling candidate queues, a tuned pool
//!   of workers draining them, and application threads helping when the
//!   cache runs over its trigger
//! - **Chunk metadata**: a background work queue persisting chunk locations
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use oxievict::{Connection, EvictionConfig, MemPageStore};
//!
//! let conn = Connection::open(EvictionConfig::default())?;
//! let tree = conn.create_tree("table", Arc::new(MemPageStore::new()))?;
//!
//! let mut session = conn.session();
//! session.insert(&tree, b"key", b"value")?;
//! assert_eq!(session.get(&tree, b"key")?, Some(b"value".to_vec()));
//! session.checkpoint()?;
//! ```

#![warn(missing_docs)]

pub mod btree;
pub mod cache;
pub mod config;
pub mod conn;
pub mod device;
pub mod evict;
pub mod metadata;
pub mod page;
pub mod status;
pub mod txn;
mod utility;

// Re-exports for convenience
pub use btree::{page_in, PageHandle, PageRef, ReadFlags, RefState, Tree, TreeConfig};
pub use config::{ConfigError, OxievictConfig};
pub use conn::{Connection, Session};
pub use device::{FilePageStore, MemPageStore, PageAddr, PageStore};
pub use evict::{EvictCaller, EvictionConfig, EvictionEngine};
pub use metadata::{MetadataError, MetadataServer};
pub use status::Status;
pub use utility::{parse_byte_size, Backoff, BackoffStep};

/// Utility for size literals (e.g., 1_GiB)
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::btree::{ReadFlags, Tree, TreeConfig};
    pub use crate::conn::{Connection, Session};
    pub use crate::device::{MemPageStore, PageStore};
    pub use crate::evict::EvictionConfig;
    pub use crate::status::Status;
}
