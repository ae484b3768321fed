//! Eviction configuration and validation
//!
//! Targets and triggers are percentages of the cache size. Values above 100
//! are absolute byte counts and are converted to percentages during
//! [`EvictionConfig::validate`], which also applies the corrections and
//! rejections that keep eviction able to make progress.

use crate::config::ConfigError;
use crate::utility::parse_byte_size;

/// Default cache size (100MB)
pub const DEFAULT_CACHE_SIZE: u64 = 100 << 20;

/// Eviction settings
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionConfig {
    /// Cache size in bytes
    pub cache_size: u64,
    /// The cache is shared between connections; targets must be percentages
    pub shared_cache: bool,
    /// The whole connection is cache resident; readers never wait for space
    pub in_memory: bool,
    /// Background eviction starts above this share of the cache
    pub eviction_target: f64,
    /// Application threads help above this share of the cache
    pub eviction_trigger: f64,
    /// Background eviction of dirty pages starts above this share
    pub eviction_dirty_target: f64,
    /// Application threads help with dirty pages above this share
    pub eviction_dirty_trigger: f64,
    /// Background eviction of update chains starts above this share
    pub eviction_updates_target: f64,
    /// Application threads help with update chains above this share
    pub eviction_updates_trigger: f64,
    /// Dirty target used while a checkpoint is scrubbing the cache
    pub eviction_checkpoint_target: f64,
    /// Fewest eviction worker threads
    pub threads_min: u32,
    /// Most eviction worker threads
    pub threads_max: u32,
    /// Longest an application thread waits for cache space, 0 for no limit
    pub cache_max_wait_ms: u64,
    /// How long the cache may be stuck before its content is dumped, 0 to
    /// never dump
    pub cache_stuck_timeout_ms: u64,
    /// Sample pages of cache-resident trees as well
    pub evict_sample_inmem: bool,
    /// Queue slots carried across tree visits
    pub walk_base: usize,
    /// Queue slots added per walk
    pub walk_incr: usize,
    /// Interval between worker-count tuning samples
    pub tune_period_ms: u64,
    /// How long a settled worker count is kept before probing again
    pub force_retune_ms: u64,
    /// Default `maxmempage` for new trees
    pub maxmempage: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            shared_cache: false,
            in_memory: false,
            eviction_target: 80.0,
            eviction_trigger: 95.0,
            eviction_dirty_target: 5.0,
            eviction_dirty_trigger: 20.0,
            eviction_updates_target: 0.0,
            eviction_updates_trigger: 0.0,
            eviction_checkpoint_target: 1.0,
            threads_min: 1,
            threads_max: 8,
            cache_max_wait_ms: 0,
            cache_stuck_timeout_ms: 300_000,
            evict_sample_inmem: true,
            walk_base: 300,
            walk_incr: 100,
            tune_period_ms: 60,
            force_retune_ms: 25_000,
            maxmempage: crate::btree::DEFAULT_MAXMEMPAGE,
        }
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    parse_byte_size(value).ok_or_else(|| invalid(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

/// A target or trigger: a percentage, or an absolute size with an optional
/// unit suffix
fn parse_share(key: &str, value: &str) -> Result<f64, ConfigError> {
    if let Ok(pct) = value.trim().parse::<f64>() {
        if pct.is_finite() && pct >= 0.0 {
            return Ok(pct);
        }
        return Err(invalid(key, value));
    }
    parse_byte_size(value)
        .map(|bytes| bytes as f64)
        .ok_or_else(|| invalid(key, value))
}

impl EvictionConfig {
    /// Build a configuration from defaults plus `key=value` pairs
    pub fn from_pairs<K, V>(pairs: &[(K, V)]) -> Result<Self, ConfigError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        config.apply_pairs(pairs)?;
        Ok(config)
    }

    /// Apply `key=value` pairs on top of the current values
    pub fn apply_pairs<K, V>(&mut self, pairs: &[(K, V)]) -> Result<(), ConfigError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in pairs {
            self.set(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    /// Set one key
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "cache_size" => self.cache_size = parse_u64(key, value)?,
            "shared_cache" => self.shared_cache = parse_bool(key, value)?,
            "in_memory" => self.in_memory = parse_bool(key, value)?,
            "eviction_target" => self.eviction_target = parse_share(key, value)?,
            "eviction_trigger" => self.eviction_trigger = parse_share(key, value)?,
            "eviction_dirty_target" => self.eviction_dirty_target = parse_share(key, value)?,
            "eviction_dirty_trigger" => self.eviction_dirty_trigger = parse_share(key, value)?,
            "eviction_updates_target" => self.eviction_updates_target = parse_share(key, value)?,
            "eviction_updates_trigger" => {
                self.eviction_updates_trigger = parse_share(key, value)?
            }
            "eviction_checkpoint_target" => {
                self.eviction_checkpoint_target = parse_share(key, value)?
            }
            "eviction.threads_min" => self.threads_min = parse_u32(key, value)?,
            "eviction.threads_max" => self.threads_max = parse_u32(key, value)?,
            "eviction.evict_sample_inmem" => self.evict_sample_inmem = parse_bool(key, value)?,
            "eviction.walk_base" => self.walk_base = parse_u64(key, value)? as usize,
            "eviction.walk_incr" => self.walk_incr = parse_u64(key, value)? as usize,
            "eviction.tune_period_ms" => self.tune_period_ms = parse_u64(key, value)?,
            "eviction.force_retune_ms" => self.force_retune_ms = parse_u64(key, value)?,
            "cache_max_wait_ms" => self.cache_max_wait_ms = parse_u64(key, value)?,
            "cache_stuck_timeout_ms" => self.cache_stuck_timeout_ms = parse_u64(key, value)?,
            "maxmempage" => self.maxmempage = parse_u64(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Queue slots per eviction queue
    pub fn evict_slots(&self) -> usize {
        self.walk_base + self.walk_incr
    }

    fn abs_to_pct(&self, value: &mut f64, name: &str) -> Result<(), ConfigError> {
        if *value <= 100.0 {
            return Ok(());
        }
        if self.shared_cache {
            return Err(ConfigError::Invalid(format!(
                "shared cache configuration requires a percentage value for {name}"
            )));
        }
        if *value > self.cache_size as f64 {
            return Err(ConfigError::Invalid(format!(
                "{name} should not exceed cache size"
            )));
        }
        *value = (*value * 100.0) / self.cache_size as f64;
        Ok(())
    }

    /// Convert absolute values, correct out-of-order settings, and reject
    /// settings that would stop eviction from making progress.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.cache_size == 0 {
            return Err(ConfigError::Invalid("cache_size must be non-zero".into()));
        }

        let mut target = self.eviction_target;
        let mut trigger = self.eviction_trigger;
        let mut dirty_target = self.eviction_dirty_target;
        let mut dirty_trigger = self.eviction_dirty_trigger;
        let mut updates_target = self.eviction_updates_target;
        let mut updates_trigger = self.eviction_updates_trigger;
        let mut checkpoint_target = self.eviction_checkpoint_target;
        self.abs_to_pct(&mut target, "eviction target")?;
        self.abs_to_pct(&mut trigger, "eviction trigger")?;
        self.abs_to_pct(&mut dirty_target, "eviction dirty target")?;
        self.abs_to_pct(&mut dirty_trigger, "eviction dirty trigger")?;
        self.abs_to_pct(&mut updates_target, "eviction updates target")?;
        self.abs_to_pct(&mut updates_trigger, "eviction updates trigger")?;
        self.abs_to_pct(&mut checkpoint_target, "eviction checkpoint target")?;

        if dirty_target > target {
            tracing::warn!(
                eviction_dirty_target = dirty_target,
                eviction_target = target,
                "eviction_dirty_target cannot exceed eviction_target, clamping"
            );
            dirty_target = target;
        }
        if checkpoint_target > 0.0 && checkpoint_target < dirty_target {
            tracing::warn!(
                eviction_checkpoint_target = checkpoint_target,
                eviction_dirty_target = dirty_target,
                "eviction_checkpoint_target cannot be less than eviction_dirty_target, raising"
            );
            checkpoint_target = dirty_target;
        }
        if dirty_trigger > trigger {
            tracing::warn!(
                eviction_dirty_trigger = dirty_trigger,
                eviction_trigger = trigger,
                "eviction_dirty_trigger cannot exceed eviction_trigger, clamping"
            );
            dirty_trigger = trigger;
        }
        if updates_target < f64::EPSILON {
            tracing::warn!(
                eviction_updates_target = updates_target,
                corrected = dirty_target / 2.0,
                "eviction_updates_target cannot be zero, using half the dirty target"
            );
            updates_target = dirty_target / 2.0;
        }
        if updates_trigger < f64::EPSILON {
            tracing::warn!(
                eviction_updates_trigger = updates_trigger,
                corrected = dirty_trigger / 2.0,
                "eviction_updates_trigger cannot be zero, using half the dirty trigger"
            );
            updates_trigger = dirty_trigger / 2.0;
        }
        if updates_trigger > trigger {
            tracing::warn!(
                eviction_updates_trigger = updates_trigger,
                eviction_trigger = trigger,
                "eviction_updates_trigger cannot exceed eviction_trigger, clamping"
            );
            updates_trigger = trigger;
        }

        if target >= trigger {
            return Err(ConfigError::Invalid(
                "eviction target must be lower than the eviction trigger".into(),
            ));
        }
        if dirty_target >= dirty_trigger {
            return Err(ConfigError::Invalid(
                "eviction dirty target must be lower than the eviction dirty trigger".into(),
            ));
        }
        if updates_target >= updates_trigger {
            return Err(ConfigError::Invalid(
                "eviction updates target must be lower than the eviction updates trigger".into(),
            ));
        }
        if self.threads_min == 0 || self.threads_max == 0 {
            return Err(ConfigError::Invalid(
                "eviction thread counts must be non-zero".into(),
            ));
        }
        if self.threads_min > self.threads_max {
            return Err(ConfigError::Invalid(
                "eviction=(threads_min) cannot be greater than eviction=(threads_max)".into(),
            ));
        }
        if self.evict_slots() == 0 {
            return Err(ConfigError::Invalid(
                "eviction walk sizes must leave at least one queue slot".into(),
            ));
        }

        self.eviction_target = target;
        self.eviction_trigger = trigger;
        self.eviction_dirty_target = dirty_target;
        self.eviction_dirty_trigger = dirty_trigger;
        self.eviction_updates_target = updates_target;
        self.eviction_updates_trigger = updates_trigger;
        self.eviction_checkpoint_target = checkpoint_target;
        Ok(())
    }

    /// Validated copy of this configuration
    pub fn validated(&self) -> Result<Self, ConfigError> {
        let mut config = self.clone();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EvictionConfig::default().validated().unwrap();
        assert_eq!(config.eviction_updates_target, 2.5);
        assert_eq!(config.eviction_updates_trigger, 10.0);
        assert_eq!(config.eviction_checkpoint_target, 5.0);
    }

    #[test]
    fn test_target_above_trigger_is_rejected() {
        let config =
            EvictionConfig::from_pairs(&[("eviction_target", "90"), ("eviction_trigger", "80")])
                .unwrap();
        assert!(matches!(config.validated(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_dirty_target_is_clamped() {
        let config = EvictionConfig::from_pairs(&[
            ("eviction_target", "80"),
            ("eviction_dirty_target", "95"),
            ("eviction_dirty_trigger", "90"),
        ])
        .unwrap()
        .validated()
        .unwrap();
        assert_eq!(config.eviction_dirty_target, 80.0);
        assert_eq!(config.eviction_dirty_trigger, 90.0);
    }

    #[test]
    fn test_absolute_values_become_percentages() {
        let config = EvictionConfig::from_pairs(&[
            ("cache_size", "100MB"),
            ("eviction_dirty_target", "10MB"),
            ("eviction_dirty_trigger", "30MB"),
        ])
        .unwrap()
        .validated()
        .unwrap();
        assert_eq!(config.eviction_dirty_target, 10.0);
        assert_eq!(config.eviction_dirty_trigger, 30.0);
    }

    #[test]
    fn test_absolute_values_rejected_for_shared_cache() {
        let config = EvictionConfig::from_pairs(&[
            ("shared_cache", "true"),
            ("eviction_dirty_target", "10MB"),
        ])
        .unwrap();
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_absolute_value_above_cache_size_rejected() {
        let config =
            EvictionConfig::from_pairs(&[("cache_size", "1MB"), ("eviction_trigger", "2MB")])
                .unwrap();
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_thread_bounds() {
        let config = EvictionConfig::from_pairs(&[
            ("eviction.threads_min", "6"),
            ("eviction.threads_max", "2"),
        ])
        .unwrap();
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_unknown_key() {
        let err = EvictionConfig::from_pairs(&[("eviction.bogus", "1")]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(key) if key == "eviction.bogus"));
    }

    #[test]
    fn test_bad_value() {
        let err = EvictionConfig::from_pairs(&[("eviction_target", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
