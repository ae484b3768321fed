//! Trees and page references
//!
//! This module provides the per-page state machine ([`PageRef`]), the
//! two-level [`Tree`] the cache works on, and the operations that move
//! pages in and out of memory:
//!
//! - [`page_in`]: acquire a pinned resident page, reading it on a miss
//! - [`read_page`]: build a resident page from its image and deltas
//! - [`split_leaf`]: split an oversized leaf in memory
//! - [`Reconciler`]: write a dirty page before it is reclaimed

mod acquire;
mod read;
mod reconcile;
mod reference;
mod split;
mod tree;

#[cfg(test)]
pub(crate) mod testutil;

pub use acquire::{page_in, PageHandle, ReadFlags};
pub use read::{read_page, replay_deltas};
pub use reconcile::{ImageReconciler, ReconcileResult, Reconciler};
pub use reference::{PageDeleted, PageRef, RefFlags, RefState};
pub use split::{leaf_page_can_split, split_leaf};
pub use tree::{Tree, TreeConfig, TreeId, DEFAULT_MAXMEMPAGE};
