//! Chunk metadata server
//!
//! Callers queue inserts and deletes of chunk locations; a single consumer
//! thread applies them to the [`MetadataIndex`] in batches and persists each
//! batch. A batch that cannot be persisted leaves the index out of step with
//! the chunk cache, which cannot be repaired in place, so the server thread
//! panics.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;

use super::{ChunkKey, ChunkLocation, IndexConfig, MetadataError, MetadataIndex};

/// Work units applied per wake
pub const MAX_WORK: usize = 1000;
/// Pending work units before `enqueue` blocks
pub const QUEUE_CAPACITY: usize = 4 * MAX_WORK;
/// Consumer wait when idle
const SERVER_WAIT: Duration = Duration::from_secs(1);

/// One change to the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkUnit {
    /// Record a chunk location
    Insert {
        /// Chunk
        key: ChunkKey,
        /// Where the chunk cache keeps it
        location: ChunkLocation,
    },
    /// Forget a chunk; forgetting an unknown chunk is not an error
    Delete {
        /// Chunk
        key: ChunkKey,
    },
}

enum Message {
    Work(WorkUnit),
    Shutdown,
}

struct Shared {
    index: Mutex<MetadataIndex>,
    running: AtomicBool,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
}

impl Shared {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Counters of the metadata server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataStats {
    /// Work units queued
    pub enqueued: u64,
    /// Work units applied to the index
    pub dequeued: u64,
}

/// The server: a bounded queue and the thread draining it
pub struct MetadataServer {
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MetadataServer {
    /// Open (or create) the index at `path` and start the server thread.
    pub fn create(path: impl AsRef<Path>, config: IndexConfig) -> Result<Self, MetadataError> {
        let index = MetadataIndex::open(path, config)?;
        let (sender, receiver) = bounded(QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            index: Mutex::new(index),
            running: AtomicBool::new(true),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let thread_receiver = receiver.clone();
        let handle = thread::Builder::new()
            .name("oxievict-metadata".into())
            .spawn(move || server_loop(thread_shared, thread_receiver))?;

        tracing::info!("chunk metadata server started");
        Ok(Self {
            sender,
            receiver,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a change. Blocks while the queue is full.
    pub fn enqueue(&self, unit: WorkUnit) -> Result<(), MetadataError> {
        let mut message = Message::Work(unit);
        loop {
            if !self.shared.running() {
                return Err(MetadataError::ShuttingDown);
            }
            match self.sender.send_timeout(message, SERVER_WAIT) {
                Ok(()) => {
                    self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(SendTimeoutError::Timeout(back)) => message = back,
                Err(SendTimeoutError::Disconnected(_)) => return Err(MetadataError::ShuttingDown),
            }
        }
    }

    /// Location recorded for a chunk
    pub fn get(&self, key: &ChunkKey) -> Option<ChunkLocation> {
        self.shared.index.lock().get(key)
    }

    /// Chunks recorded in the index
    pub fn len(&self) -> usize {
        self.shared.index.lock().len()
    }

    /// No chunk is recorded
    pub fn is_empty(&self) -> bool {
        self.shared.index.lock().is_empty()
    }

    /// Work units waiting in the queue
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Counters
    pub fn stats(&self) -> MetadataStats {
        MetadataStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            dequeued: self.shared.dequeued.load(Ordering::Relaxed),
        }
    }

    /// Stop the server thread and free unprocessed work.
    ///
    /// Returns how many queued work units were dropped. Fails with
    /// `ServerPanicked` if the thread died on a persistence error.
    pub fn destroy(&self) -> Result<usize, MetadataError> {
        self.shared.running.store(false, Ordering::Release);
        let _ = self.sender.try_send(Message::Shutdown);

        let joined = match self.handle.lock().take() {
            Some(handle) => handle.join().map_err(|_| MetadataError::ServerPanicked),
            None => Ok(()),
        };

        let dropped = self
            .receiver
            .try_iter()
            .filter(|message| matches!(message, Message::Work(_)))
            .count();
        if dropped > 0 {
            tracing::debug!(dropped, "freed unprocessed chunk metadata work");
        }
        joined.map(|()| dropped)
    }
}

impl Drop for MetadataServer {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            tracing::error!(error = %err, "chunk metadata server stopped with an error");
        }
    }
}

impl std::fmt::Debug for MetadataServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataServer")
            .field("running", &self.shared.running())
            .field("pending", &self.pending())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Clears `running` when the server thread exits, panicking or not, so
/// producers stop waiting on a queue nobody drains.
struct StopOnExit<'a>(&'a Shared);

impl Drop for StopOnExit<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

fn server_loop(shared: Arc<Shared>, receiver: Receiver<Message>) {
    let _stop = StopOnExit(&shared);
    while shared.running() {
        let first = match receiver.recv_timeout(SERVER_WAIT) {
            Ok(Message::Work(unit)) => unit,
            Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => continue,
        };
        if !shared.running() {
            break;
        }
        if let Err(err) = apply_batch(&shared, &receiver, first) {
            panic!("chunk metadata server error: {err}");
        }
    }
    tracing::debug!("chunk metadata server exiting");
}

/// Apply `first` and up to `MAX_WORK - 1` more queued units, then persist.
fn apply_batch(
    shared: &Shared,
    receiver: &Receiver<Message>,
    first: WorkUnit,
) -> Result<(), MetadataError> {
    let mut index = shared.index.lock();
    let mut next = Some(first);
    let mut applied = 0;
    while let Some(unit) = next.take() {
        match unit {
            WorkUnit::Insert { key, location } => index.insert(key, location),
            WorkUnit::Delete { key } => {
                index.remove(&key);
            }
        }
        applied += 1;
        if applied >= MAX_WORK || !shared.running() {
            break;
        }
        match receiver.try_recv() {
            Ok(Message::Work(unit)) => next = Some(unit),
            Ok(Message::Shutdown) | Err(_) => break,
        }
    }
    index.flush()?;
    shared.dequeued.fetch_add(applied as u64, Ordering::Relaxed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    fn config() -> IndexConfig {
        IndexConfig {
            capacity: 1 << 20,
            hashtable_size: 64,
            chunk_size: 4096,
        }
    }

    fn key(offset: u64) -> ChunkKey {
        ChunkKey {
            name: "file.wt".into(),
            id: 1,
            file_offset: offset,
        }
    }

    fn wait_dequeued(server: &MetadataServer, count: u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while server.stats().dequeued < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_inserts_and_deletes_are_applied() {
        let dir = tempdir().unwrap();
        let server = MetadataServer::create(dir.path().join("meta"), config()).unwrap();
        for i in 0..10 {
            server
                .enqueue(WorkUnit::Insert {
                    key: key(i * 4096),
                    location: ChunkLocation {
                        cache_offset: i * 4096,
                        data_sz: 4096,
                    },
                })
                .unwrap();
        }
        server.enqueue(WorkUnit::Delete { key: key(0) }).unwrap();
        server.enqueue(WorkUnit::Delete { key: key(1) }).unwrap();
        wait_dequeued(&server, 12);

        assert_eq!(server.len(), 9);
        assert!(server.get(&key(0)).is_none());
        assert_eq!(server.get(&key(4096)).unwrap().cache_offset, 4096);
        assert_eq!(server.destroy().unwrap(), 0);
        assert!(matches!(
            server.enqueue(WorkUnit::Delete { key: key(0) }),
            Err(MetadataError::ShuttingDown)
        ));

        let index = MetadataIndex::open(dir.path().join("meta"), config()).unwrap();
        assert_eq!(index.len(), 9);
    }

    #[test]
    fn test_persistence_failure_stops_the_server() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let server = MetadataServer::create(sub.join("meta"), config()).unwrap();
        std::fs::remove_dir_all(&sub).unwrap();

        server.enqueue(WorkUnit::Delete { key: key(0) }).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while server
            .handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!server.shared.running());
        assert!(matches!(
            server.enqueue(WorkUnit::Delete { key: key(1) }),
            Err(MetadataError::ShuttingDown)
        ));
        assert!(matches!(server.destroy(), Err(MetadataError::ServerPanicked)));
        assert_eq!(server.stats().dequeued, 0);
    }
}
