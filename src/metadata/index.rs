//! Persistent chunk location index
//!
//! The index maps a chunk of a file (`name`, `id`, `file_offset`) to where
//! the chunk cache keeps it. The whole index is a single bincode file with
//! the configuration it was created for as a header. Writes go to a
//! temporary file that is renamed over the old one.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::MetadataError;

/// Settings the index was created with. Reopening with different settings
/// is refused: the recorded locations would not fit the new layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Chunk cache capacity in bytes
    pub capacity: u64,
    /// Buckets in the chunk cache hash table
    pub hashtable_size: u64,
    /// Size of one chunk in bytes
    pub chunk_size: u64,
}

/// Identity of a cached chunk
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    /// Object name
    pub name: String,
    /// Object id within the name
    pub id: u32,
    /// Offset of the chunk in the object
    pub file_offset: u64,
}

/// Where a chunk lives in the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    /// Offset in the cache file
    pub cache_offset: u64,
    /// Bytes of chunk data
    pub data_sz: u64,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    config: IndexConfig,
    entries: BTreeMap<ChunkKey, ChunkLocation>,
}

/// The persisted index
#[derive(Debug)]
pub struct MetadataIndex {
    path: PathBuf,
    config: IndexConfig,
    entries: BTreeMap<ChunkKey, ChunkLocation>,
}

impl MetadataIndex {
    /// Open the index at `path`, creating it when it does not exist.
    pub fn open(path: impl AsRef<Path>, config: IndexConfig) -> Result<Self, MetadataError> {
        let path = path.as_ref().to_path_buf();
        match File::open(&path) {
            Ok(file) => {
                let mut data = Vec::new();
                BufReader::new(file).read_to_end(&mut data)?;
                let stored: IndexFile = bincode::deserialize(&data)?;
                if stored.config != config {
                    return Err(MetadataError::ConfigMismatch {
                        stored: stored.config,
                        requested: config,
                    });
                }
                tracing::debug!(path = %path.display(), entries = stored.entries.len(), "reused chunk metadata index");
                Ok(Self {
                    path,
                    config,
                    entries: stored.entries,
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let index = Self {
                    path,
                    config,
                    entries: BTreeMap::new(),
                };
                index.flush()?;
                tracing::debug!(path = %index.path.display(), "created chunk metadata index");
                Ok(index)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Settings recorded in the index
    pub fn config(&self) -> IndexConfig {
        self.config
    }

    /// Record a chunk location, replacing any earlier one
    pub fn insert(&mut self, key: ChunkKey, location: ChunkLocation) {
        self.entries.insert(key, location);
    }

    /// Forget a chunk. Returns false if it was not recorded.
    pub fn remove(&mut self, key: &ChunkKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Location of a chunk
    pub fn get(&self, key: &ChunkKey) -> Option<ChunkLocation> {
        self.entries.get(key).copied()
    }

    /// Recorded chunks
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No chunk is recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the index to disk.
    pub fn flush(&self) -> Result<(), MetadataError> {
        let file = IndexFile {
            config: self.config,
            entries: self.entries.clone(),
        };
        let data = bincode::serialize(&file)?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            out.write_all(&data)?;
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
