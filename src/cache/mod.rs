//! Cache accounting
//!
//! Byte counters for resident, dirty, and update-chain memory, kept both
//! cache-wide and per tree.

mod accounting;

pub use accounting::{CacheAccounting, CacheUsage, TreeBytes};
