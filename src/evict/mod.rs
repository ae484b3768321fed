//! Eviction
//!
//! The eviction engine keeps the cache under its configured size. A server
//! thread walks open trees and fills candidate queues; a pool of worker
//! threads drains them. Application threads help when the cache is over a
//! trigger, and evict oversized pages they just acquired.
//!
//! # Overview
//!
//! - [`EvictionConfig`]: targets, triggers and thread counts, with validation
//! - [`Pressure`]: the pure threshold math deciding who must evict
//! - [`EvictQueue`]: bounded candidate queues (two rotating plus one urgent)
//! - [`EvictionEngine`]: walk, workers, forced eviction and statistics

mod app;
mod config;
mod engine;
mod page_evict;
mod pressure;
mod queue;
mod readgen;
mod stats;
mod tune;
mod walk;
mod worker;

use bitflags::bitflags;

pub use app::EvictCaller;
pub use config::{EvictionConfig, DEFAULT_CACHE_SIZE};
pub use engine::EvictionEngine;
pub use page_evict::{page_can_evict, EvictMode};
pub use pressure::{Pressure, PRESSURE_THRESHOLD};
pub use queue::{EvictEntry, EvictQueue, QueueState, EVICT_QUEUE_MAX, EVICT_URGENT_QUEUE};
pub use readgen::{
    copy_page_state, dirty_and_evict_soon, evict_soon, page_is_evict_soon, readgen_evict_soon,
    ReadGenClock, READGEN_NOTSET, READGEN_OLDEST, READGEN_START_VALUE, READGEN_STEP,
    READGEN_WONT_NEED,
};
pub use stats::{EvictStats, EvictStatsSnapshot};
pub use tune::{TuneAction, Tuner};

/// Aggressiveness at which eviction starts taking dirty pages for clean
/// pressure
pub const EVICT_SCORE_CUTOFF: u32 = 10;

/// Largest aggressiveness and empty-queue score
pub const EVICT_SCORE_MAX: u32 = 100;

/// Empty-queue score added when a refill finds the queue empty
pub const EVICT_SCORE_BUMP: u32 = 10;

/// Forced eviction attempts allowed per acquire
pub const FORCE_EVICT_MAX_ATTEMPTS: u32 = 10;

bitflags! {
    /// Cache-wide eviction state, recomputed on every server pass
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EvictFlags: u32 {
        /// Usage is over the target
        const CLEAN = 0x001;
        /// Usage is over the trigger
        const CLEAN_HARD = 0x002;
        /// Dirty bytes are over the dirty target
        const DIRTY = 0x004;
        /// Dirty bytes are over the dirty trigger
        const DIRTY_HARD = 0x008;
        /// Update bytes are over the updates target
        const UPDATES = 0x010;
        /// Update bytes are over the updates trigger
        const UPDATES_HARD = 0x020;
        /// Write dirty pages but keep them resident
        const SCRUB = 0x040;
        /// Pressure is high enough to evict pages regardless of score
        const URGENT = 0x080;
        /// Do not keep pages that readers will not use again
        const NOKEEP = 0x100;
    }
}

impl EvictFlags {
    /// Any kind of pressure
    pub const ALL: Self = Self::CLEAN
        .union(Self::CLEAN_HARD)
        .union(Self::DIRTY)
        .union(Self::DIRTY_HARD)
        .union(Self::UPDATES)
        .union(Self::UPDATES_HARD);

    /// Pressure over one of the triggers
    pub const HARD: Self = Self::CLEAN_HARD
        .union(Self::DIRTY_HARD)
        .union(Self::UPDATES_HARD);

    /// Pressure from dirty bytes or update chains
    pub const DIRTY_OR_UPDATES: Self = Self::DIRTY
        .union(Self::DIRTY_HARD)
        .union(Self::UPDATES)
        .union(Self::UPDATES_HARD);

    /// Only clean pressure: dirty pages do not help
    pub fn clean_only(self) -> bool {
        self.intersects(Self::CLEAN | Self::CLEAN_HARD) && !self.intersects(Self::DIRTY_OR_UPDATES)
    }

    /// Only dirty pressure: clean pages do not help
    pub fn dirty_only(self) -> bool {
        self.intersects(Self::DIRTY_OR_UPDATES) && !self.intersects(Self::CLEAN | Self::CLEAN_HARD)
    }
}
