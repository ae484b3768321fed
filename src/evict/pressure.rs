//! Cache pressure math
//!
//! Pure functions over a configuration and a snapshot of the byte counters,
//! deciding whether application threads must help with eviction.

use crate::cache::{CacheUsage, TreeBytes};
use crate::evict::EvictionConfig;

/// Share of the trigger at which clean pressure is reported early
pub const PRESSURE_THRESHOLD: f64 = 0.95;

/// Pressure evaluation for one snapshot of the cache counters
#[derive(Debug, Clone, Copy)]
pub struct Pressure<'a> {
    config: &'a EvictionConfig,
    usage: CacheUsage,
    scrub_target: f64,
}

impl<'a> Pressure<'a> {
    /// Evaluate `usage` against `config`
    pub fn new(config: &'a EvictionConfig, usage: CacheUsage) -> Self {
        Self {
            config,
            usage,
            scrub_target: 0.0,
        }
    }

    /// Use `scrub_target` as the dirty target when it is lower
    pub fn with_scrub_target(mut self, scrub_target: f64) -> Self {
        self.scrub_target = scrub_target;
        self
    }

    /// Cache size plus one, so an unset cache size never divides by zero
    #[inline]
    fn bytes_max(&self) -> u64 {
        self.config.cache_size + 1
    }

    fn pct(&self, bytes: u64) -> f64 {
        (100.0 * bytes as f64) / self.bytes_max() as f64
    }

    /// Whether total usage is over the trigger, with the usage percentage
    pub fn clean_needed(&self) -> (bool, f64) {
        let bytes_max = self.bytes_max() as f64;
        let needed = self.usage.inuse as f64 > (self.config.eviction_trigger * bytes_max) / 100.0;
        (needed, self.pct(self.usage.inuse))
    }

    /// Whether dirty usage is over the dirty trigger, with its percentage
    pub fn dirty_needed(&self) -> (bool, f64) {
        let limit = (self.config.eviction_dirty_trigger * self.bytes_max() as f64) as u64 / 100;
        (self.usage.dirty > limit, self.pct(self.usage.dirty))
    }

    /// Whether update-chain usage is over its trigger, with its percentage
    pub fn updates_needed(&self) -> (bool, f64) {
        let limit = (self.config.eviction_updates_trigger * self.bytes_max() as f64) as u64 / 100;
        (self.usage.updates > limit, self.pct(self.usage.updates))
    }

    /// Whether an application thread should evict, and how full the cache is
    /// relative to the nearest trigger.
    ///
    /// Dirty pressure is ignored for busy callers: they pin resources that
    /// dirty eviction may need. Read-only callers ignore dirty and update
    /// pressure entirely.
    pub fn eviction_needed(&self, busy: bool, readonly: bool) -> (bool, f64) {
        let (clean_needed, pct_full) = self.clean_needed();
        let (dirty_needed, pct_dirty, updates_needed, pct_updates) = if readonly {
            (false, 0.0, false, 0.0)
        } else {
            let (dirty, pct_dirty) = self.dirty_needed();
            let (updates, pct_updates) = self.updates_needed();
            (dirty, pct_dirty, updates, pct_updates)
        };

        let headroom = (self.config.eviction_trigger - pct_full)
            .min(self.config.eviction_dirty_trigger - pct_dirty)
            .min(self.config.eviction_updates_trigger - pct_updates);
        let pct = (100.0 - headroom).max(0.0);

        (clean_needed || updates_needed || (!busy && dirty_needed), pct)
    }

    /// Whether clean pages are under pressure: over the trigger, or over the
    /// target and close to the trigger
    pub fn clean_pressure(&self) -> bool {
        let (needed, pct_full) = self.clean_needed();
        if needed {
            return true;
        }
        pct_full > self.config.eviction_target
            && pct_full >= PRESSURE_THRESHOLD * self.config.eviction_trigger
    }

    /// Effective dirty target, including checkpoint scrubbing
    pub fn dirty_target(&self) -> f64 {
        let dirty_target = self.config.eviction_dirty_target;
        if self.scrub_target > 0.0 && self.scrub_target < dirty_target {
            self.scrub_target
        } else {
            dirty_target
        }
    }

    /// Whether one tree holds at least half of any target's worth of bytes
    pub fn dominating(&self, tree: &TreeBytes) -> bool {
        let bytes_max = self.bytes_max() as f64;
        let half = |pct: f64| (0.5 * pct * bytes_max) as u64 / 100;
        tree.inmem() > half(self.config.eviction_target)
            || tree.dirty() > half(self.config.eviction_dirty_target)
            || tree.updates() > half(self.config.eviction_updates_target)
    }

    /// Usage over the target, as checked by the eviction server
    pub fn over_target(&self) -> bool {
        self.pct(self.usage.inuse) > self.config.eviction_target
    }

    /// Dirty usage over the effective dirty target
    pub fn dirty_over_target(&self) -> bool {
        self.pct(self.usage.dirty) > self.dirty_target()
    }

    /// Update-chain usage over the updates target
    pub fn updates_over_target(&self) -> bool {
        self.pct(self.usage.updates) > self.config.eviction_updates_target
    }

    /// Usage over the midpoint between target and trigger
    pub fn over_midpoint(&self) -> bool {
        let c = self.config;
        self.usage.inuse
            >= ((c.eviction_target + c.eviction_trigger) * self.bytes_max() as f64) as u64 / 200
    }

    /// Dirty and update usage both under their target/trigger midpoints
    pub fn dirty_under_midpoint(&self) -> bool {
        let c = self.config;
        let bytes_max = self.bytes_max() as f64;
        self.usage.dirty
            < ((self.dirty_target() + c.eviction_dirty_trigger) * bytes_max) as u64 / 200
            && self.usage.updates
                < ((c.eviction_updates_target + c.eviction_updates_trigger) * bytes_max) as u64
                    / 200
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EvictionConfig {
        EvictionConfig {
            cache_size: 100,
            eviction_target: 80.0,
            eviction_trigger: 90.0,
            ..EvictionConfig::default()
        }
        .validated()
        .unwrap()
    }

    fn usage(inuse: u64, dirty: u64, updates: u64) -> CacheUsage {
        CacheUsage {
            inuse,
            dirty,
            updates,
            pages: 1,
        }
    }

    #[test]
    fn test_clean_trigger() {
        let config = config();
        assert!(Pressure::new(&config, usage(91, 0, 0)).eviction_needed(false, false).0);
        assert!(!Pressure::new(&config, usage(89, 0, 0)).eviction_needed(false, false).0);
    }

    #[test]
    fn test_dirty_ignored_when_busy() {
        let config = config();
        let pressure = Pressure::new(&config, usage(50, 25, 0));
        assert!(pressure.dirty_needed().0);
        assert!(pressure.eviction_needed(false, false).0);
        assert!(!pressure.eviction_needed(true, false).0);
    }

    #[test]
    fn test_readonly_ignores_dirty_and_updates() {
        let config = config();
        let pressure = Pressure::new(&config, usage(50, 25, 15));
        assert!(pressure.eviction_needed(true, false).0);
        assert!(!pressure.eviction_needed(false, true).0);
    }

    #[test]
    fn test_pct_full_tracks_nearest_trigger() {
        let config = config();
        // An empty cache is still only as far from full as the tightest
        // trigger allows.
        let (_, pct) = Pressure::new(&config, usage(0, 0, 0)).eviction_needed(false, false);
        assert!((pct - 90.0).abs() < 1e-9);
        let (_, pct) = Pressure::new(&config, usage(0, 19, 0)).eviction_needed(false, false);
        assert!(pct > 95.0);
    }

    #[test]
    fn test_clean_pressure_near_trigger() {
        let config = config();
        assert!(Pressure::new(&config, usage(87, 0, 0)).clean_pressure());
        assert!(!Pressure::new(&config, usage(84, 0, 0)).clean_pressure());
    }

    #[test]
    fn test_scrub_target_lowers_dirty_target() {
        let config = config();
        let pressure = Pressure::new(&config, usage(0, 0, 0));
        assert_eq!(pressure.dirty_target(), 5.0);
        assert_eq!(pressure.with_scrub_target(2.0).dirty_target(), 2.0);
        assert_eq!(pressure.with_scrub_target(9.0).dirty_target(), 5.0);
    }

    #[test]
    fn test_dominating_tree() {
        let config = config();
        let pressure = Pressure::new(&config, usage(0, 0, 0));
        let tree = TreeBytes::new();
        assert!(!pressure.dominating(&tree));
    }
}
