//! Configuration loading helpers.
//!
//! Settings come from three places, later ones winning: defaults, a TOML
//! file, and `OXIEVICT__section__field` environment variables. The string
//! `key=value` surface of [`EvictionConfig`] is the fourth way in, used by
//! `Connection::reconfigure`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::evict::EvictionConfig;
use crate::metadata::IndexConfig;
use crate::utility::parse_byte_size;

/// Environment variable naming a TOML file to load
pub const CONFIG_ENV: &str = "OXIEVICT_CONFIG";

const OVERRIDE_PREFIX: &str = "OXIEVICT__";

/// Errors returned by configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// A combination of values that cannot work.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OxievictConfig {
    /// Cache size and waiting behavior.
    pub cache: Option<CacheSection>,
    /// Eviction targets, triggers and threads.
    pub eviction: Option<EvictionSection>,
    /// Defaults for new trees.
    pub tree: Option<TreeSection>,
    /// Chunk metadata server.
    pub metadata: Option<MetadataSection>,
}

impl OxievictConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXIEVICT_CONFIG` env var (if set),
    /// then apply `OXIEVICT__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var(CONFIG_ENV).ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            let Some(path) = key.strip_prefix(OVERRIDE_PREFIX) else {
                continue;
            };
            let path = path.to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim();

            match parts.as_slice() {
                ["cache", "size"] => self.cache_mut().size = Some(parse_size(&key, value)?),
                ["cache", "shared"] => self.cache_mut().shared = Some(parse_value(&key, value)?),
                ["cache", "in_memory"] => {
                    self.cache_mut().in_memory = Some(parse_value(&key, value)?)
                }
                ["cache", "max_wait_ms"] => {
                    self.cache_mut().max_wait_ms = Some(parse_value(&key, value)?)
                }
                ["cache", "stuck_timeout_ms"] => {
                    self.cache_mut().stuck_timeout_ms = Some(parse_value(&key, value)?)
                }
                ["eviction", "target"] => {
                    self.eviction_mut().target = Some(parse_value(&key, value)?)
                }
                ["eviction", "trigger"] => {
                    self.eviction_mut().trigger = Some(parse_value(&key, value)?)
                }
                ["eviction", "dirty_target"] => {
                    self.eviction_mut().dirty_target = Some(parse_value(&key, value)?)
                }
                ["eviction", "dirty_trigger"] => {
                    self.eviction_mut().dirty_trigger = Some(parse_value(&key, value)?)
                }
                ["eviction", "updates_target"] => {
                    self.eviction_mut().updates_target = Some(parse_value(&key, value)?)
                }
                ["eviction", "updates_trigger"] => {
                    self.eviction_mut().updates_trigger = Some(parse_value(&key, value)?)
                }
                ["eviction", "checkpoint_target"] => {
                    self.eviction_mut().checkpoint_target = Some(parse_value(&key, value)?)
                }
                ["eviction", "threads_min"] => {
                    self.eviction_mut().threads_min = Some(parse_value(&key, value)?)
                }
                ["eviction", "threads_max"] => {
                    self.eviction_mut().threads_max = Some(parse_value(&key, value)?)
                }
                ["eviction", "evict_sample_inmem"] => {
                    self.eviction_mut().evict_sample_inmem = Some(parse_value(&key, value)?)
                }
                ["eviction", "walk_base"] => {
                    self.eviction_mut().walk_base = Some(parse_value(&key, value)?)
                }
                ["eviction", "walk_incr"] => {
                    self.eviction_mut().walk_incr = Some(parse_value(&key, value)?)
                }
                ["eviction", "tune_period_ms"] => {
                    self.eviction_mut().tune_period_ms = Some(parse_value(&key, value)?)
                }
                ["eviction", "force_retune_ms"] => {
                    self.eviction_mut().force_retune_ms = Some(parse_value(&key, value)?)
                }
                ["tree", "maxmempage"] => {
                    self.tree_mut().maxmempage = Some(parse_size(&key, value)?)
                }
                ["metadata", "path"] => self.metadata_mut().path = Some(PathBuf::from(value)),
                ["metadata", "capacity"] => {
                    self.metadata_mut().capacity = Some(parse_size(&key, value)?)
                }
                ["metadata", "hashtable_size"] => {
                    self.metadata_mut().hashtable_size = Some(parse_value(&key, value)?)
                }
                ["metadata", "chunk_size"] => {
                    self.metadata_mut().chunk_size = Some(parse_size(&key, value)?)
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build a validated `EvictionConfig` using defaults plus overrides.
    pub fn to_eviction_config(&self) -> Result<EvictionConfig, ConfigError> {
        let mut config = EvictionConfig::default();
        if let Some(cache) = &self.cache {
            cache.apply_to(&mut config);
        }
        if let Some(eviction) = &self.eviction {
            eviction.apply_to(&mut config);
        }
        if let Some(maxmempage) = self.tree.as_ref().and_then(|t| t.maxmempage) {
            config.maxmempage = maxmempage;
        }
        config.validate()?;
        Ok(config)
    }

    /// Metadata index location and settings, if a path is configured.
    pub fn metadata_config(&self) -> Result<Option<(PathBuf, IndexConfig)>, ConfigError> {
        let Some(section) = &self.metadata else {
            return Ok(None);
        };
        let Some(path) = section.path.clone() else {
            return Ok(None);
        };
        let chunk_size = section.chunk_size.unwrap_or(1 << 20);
        if chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "metadata.chunk_size".into(),
                value: "0".into(),
            });
        }
        let config = IndexConfig {
            capacity: section.capacity.unwrap_or(10 << 30),
            hashtable_size: section.hashtable_size.unwrap_or(1024),
            chunk_size,
        };
        Ok(Some((path, config)))
    }

    fn cache_mut(&mut self) -> &mut CacheSection {
        self.cache.get_or_insert_with(CacheSection::default)
    }

    fn eviction_mut(&mut self) -> &mut EvictionSection {
        self.eviction.get_or_insert_with(EvictionSection::default)
    }

    fn tree_mut(&mut self) -> &mut TreeSection {
        self.tree.get_or_insert_with(TreeSection::default)
    }

    fn metadata_mut(&mut self) -> &mut MetadataSection {
        self.metadata.get_or_insert_with(MetadataSection::default)
    }
}

/// Cache configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    /// Cache size in bytes.
    pub size: Option<u64>,
    /// Whether the cache is shared between connections.
    pub shared: Option<bool>,
    /// Whether every tree is cache resident.
    pub in_memory: Option<bool>,
    /// Longest application wait for space, 0 for no limit.
    pub max_wait_ms: Option<u64>,
    /// Stuck time before the cache content is dumped.
    pub stuck_timeout_ms: Option<u64>,
}

impl CacheSection {
    fn apply_to(&self, config: &mut EvictionConfig) {
        if let Some(value) = self.size {
            config.cache_size = value;
        }
        if let Some(value) = self.shared {
            config.shared_cache = value;
        }
        if let Some(value) = self.in_memory {
            config.in_memory = value;
        }
        if let Some(value) = self.max_wait_ms {
            config.cache_max_wait_ms = value;
        }
        if let Some(value) = self.stuck_timeout_ms {
            config.cache_stuck_timeout_ms = value;
        }
    }
}

/// Eviction configuration overrides. Targets and triggers are percentages,
/// or absolute byte counts when above 100.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvictionSection {
    /// Background eviction target.
    pub target: Option<f64>,
    /// Application eviction trigger.
    pub trigger: Option<f64>,
    /// Dirty target.
    pub dirty_target: Option<f64>,
    /// Dirty trigger.
    pub dirty_trigger: Option<f64>,
    /// Update-chain target.
    pub updates_target: Option<f64>,
    /// Update-chain trigger.
    pub updates_trigger: Option<f64>,
    /// Dirty target while a checkpoint scrubs the cache.
    pub checkpoint_target: Option<f64>,
    /// Fewest worker threads.
    pub threads_min: Option<u32>,
    /// Most worker threads.
    pub threads_max: Option<u32>,
    /// Sample cache-resident trees as well.
    pub evict_sample_inmem: Option<bool>,
    /// Queue slots carried across tree visits.
    pub walk_base: Option<usize>,
    /// Queue slots added per walk.
    pub walk_incr: Option<usize>,
    /// Tuning sample interval.
    pub tune_period_ms: Option<u64>,
    /// Time before a settled worker count is probed again.
    pub force_retune_ms: Option<u64>,
}

impl EvictionSection {
    fn apply_to(&self, config: &mut EvictionConfig) {
        let shares = [
            (self.target, &mut config.eviction_target),
            (self.trigger, &mut config.eviction_trigger),
            (self.dirty_target, &mut config.eviction_dirty_target),
            (self.dirty_trigger, &mut config.eviction_dirty_trigger),
            (self.updates_target, &mut config.eviction_updates_target),
            (self.updates_trigger, &mut config.eviction_updates_trigger),
            (self.checkpoint_target, &mut config.eviction_checkpoint_target),
        ];
        for (value, slot) in shares {
            if let Some(value) = value {
                *slot = value;
            }
        }
        if let Some(value) = self.threads_min {
            config.threads_min = value;
        }
        if let Some(value) = self.threads_max {
            config.threads_max = value;
        }
        if let Some(value) = self.evict_sample_inmem {
            config.evict_sample_inmem = value;
        }
        if let Some(value) = self.walk_base {
            config.walk_base = value;
        }
        if let Some(value) = self.walk_incr {
            config.walk_incr = value;
        }
        if let Some(value) = self.tune_period_ms {
            config.tune_period_ms = value;
        }
        if let Some(value) = self.force_retune_ms {
            config.force_retune_ms = value;
        }
    }
}

/// Defaults for new trees.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeSection {
    /// Largest leaf footprint before forced eviction.
    pub maxmempage: Option<u64>,
}

/// Chunk metadata server settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataSection {
    /// Index file; the server is not started without one.
    pub path: Option<PathBuf>,
    /// Chunk cache capacity in bytes.
    pub capacity: Option<u64>,
    /// Chunk cache hash table buckets.
    pub hashtable_size: Option<u64>,
    /// Chunk size in bytes.
    pub chunk_size: Option<u64>,
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_size(key: &str, value: &str) -> Result<u64, ConfigError> {
    parse_byte_size(value).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
