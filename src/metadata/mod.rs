//! Chunk cache metadata
//!
//! A [`MetadataServer`] persists where the chunk cache keeps each chunk. Any
//! thread queues [`WorkUnit`]s; one background thread applies them to a
//! [`MetadataIndex`] file.

mod index;
mod server;

pub use index::{ChunkKey, ChunkLocation, IndexConfig, MetadataIndex};
pub use server::{MetadataServer, MetadataStats, WorkUnit, MAX_WORK, QUEUE_CAPACITY};

/// Errors of the metadata index and server
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// I/O error on the index file or while starting the thread
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The index file could not be encoded or decoded
    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),
    /// The index was created with other settings
    #[error("index created with {stored:?}, opened with {requested:?}")]
    ConfigMismatch {
        /// Settings in the file
        stored: IndexConfig,
        /// Settings asked for
        requested: IndexConfig,
    },
    /// The server is stopping or stopped
    #[error("metadata server is shutting down")]
    ShuttingDown,
    /// The server thread died on a persistence error
    #[error("metadata server thread panicked")]
    ServerPanicked,
}
