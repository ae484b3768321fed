//! Eviction candidate queues
//!
//! A queue is a bounded array of candidates guarded by its own lock. The
//! walk fills it, sorts it by score, and publishes it; workers then drain it
//! front to back. Entries only reference pages: the reference may have moved
//! on before the entry is consumed, so consumers validate it again.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::btree::{PageRef, RefFlags, Tree, TreeId};

/// Number of queues: two ordinary queues plus the urgent queue
pub const EVICT_QUEUE_MAX: usize = 3;
/// Index of the urgent queue
pub const EVICT_URGENT_QUEUE: usize = 2;

/// Lifecycle of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// No candidates
    Empty,
    /// A walk is adding candidates
    Filling,
    /// Candidates published and waiting
    Ready,
    /// Workers are consuming candidates
    Draining,
}

/// An eviction candidate
#[derive(Clone)]
pub struct EvictEntry {
    /// Tree owning the page
    pub tree: Arc<Tree>,
    /// Reference to the page
    pub pref: Arc<PageRef>,
    /// Relative priority; lower is evicted first
    pub score: u64,
}

impl std::fmt::Debug for EvictEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictEntry")
            .field("tree", &self.tree.id())
            .field("pref", &self.pref)
            .field("score", &self.score)
            .finish()
    }
}

struct QueueInner {
    entries: Vec<Option<EvictEntry>>,
    candidates: usize,
    current: usize,
    state: QueueState,
}

impl QueueInner {
    fn release_all(&mut self) {
        for entry in self.entries.drain(..).flatten() {
            entry.pref.clear_flags(RefFlags::EVICT_QUEUED);
        }
        self.candidates = 0;
        self.current = 0;
        self.state = QueueState::Empty;
    }

    /// Drop the slots consumers have already moved past.
    fn compact(&mut self) {
        let consumed = self.current.min(self.entries.len());
        if consumed == 0 {
            return;
        }
        for entry in self.entries.drain(..consumed).flatten() {
            entry.pref.clear_flags(RefFlags::EVICT_QUEUED);
        }
        self.candidates -= consumed.min(self.candidates);
        self.current = 0;
    }
}

/// One bounded candidate queue
pub struct EvictQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
}

impl EvictQueue {
    /// Create a queue holding up to `capacity` candidates
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: Vec::with_capacity(capacity),
                candidates: 0,
                current: 0,
                state: QueueState::Empty,
            }),
            capacity,
        }
    }

    /// Slot count
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current lifecycle state
    pub fn state(&self) -> QueueState {
        self.inner.lock().state
    }

    /// Filled entries, consumed or not
    pub fn entries(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Candidates not yet consumed
    pub fn remaining(&self) -> usize {
        let inner = self.inner.lock();
        inner.candidates.saturating_sub(inner.current)
    }

    /// Whether no candidates remain
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Start a fill; previous contents are dropped
    pub fn begin_fill(&self) {
        let mut inner = self.inner.lock();
        inner.release_all();
        inner.state = QueueState::Filling;
    }

    /// Add a candidate during a fill. Returns `false` when the queue is full
    /// or the reference is already queued elsewhere.
    pub fn push(&self, entry: EvictEntry) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.len() >= self.capacity {
            inner.compact();
        }
        if inner.entries.len() >= self.capacity {
            return false;
        }
        if !entry.pref.test_and_set(RefFlags::EVICT_QUEUED) {
            return false;
        }
        inner.entries.push(Some(entry));
        true
    }

    /// Whether the queue has no free slot
    pub fn is_full(&self) -> bool {
        self.inner.lock().entries.len() >= self.capacity
    }

    /// Sort by score and make every entry available to consumers. Returns
    /// the lowest score queued.
    pub fn publish(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        inner
            .entries
            .sort_by_key(|entry| entry.as_ref().map_or(u64::MAX, |e| e.score));
        inner.candidates = inner.entries.len();
        inner.current = 0;
        inner.state = if inner.candidates == 0 {
            QueueState::Empty
        } else {
            QueueState::Ready
        };
        inner.entries.first().and_then(|e| e.as_ref()).map(|e| e.score)
    }

    /// Add a single candidate outside of a fill, making it available at
    /// once. Used for the urgent queue.
    pub fn push_ready(&self, entry: EvictEntry) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == QueueState::Empty {
            inner.release_all();
        }
        if inner.entries.len() >= self.capacity {
            inner.compact();
        }
        if inner.entries.len() >= self.capacity {
            return false;
        }
        if !entry.pref.test_and_set(RefFlags::EVICT_QUEUED) {
            return false;
        }
        inner.entries.push(Some(entry));
        inner.candidates = inner.entries.len();
        if inner.state != QueueState::Draining {
            inner.state = QueueState::Ready;
        }
        true
    }

    /// Take the next candidate
    pub fn pop(&self) -> Option<EvictEntry> {
        let mut inner = self.inner.lock();
        while inner.current < inner.candidates {
            let idx = inner.current;
            inner.current += 1;
            inner.state = QueueState::Draining;
            if let Some(entry) = inner.entries[idx].take() {
                entry.pref.clear_flags(RefFlags::EVICT_QUEUED);
                if inner.current >= inner.candidates {
                    inner.release_all();
                }
                return Some(entry);
            }
        }
        if inner.state != QueueState::Filling {
            inner.release_all();
        }
        None
    }

    /// Drop the entry for `pref`, if queued here. Returns whether one was
    /// removed.
    pub fn remove_ref(&self, pref: &Arc<PageRef>) -> bool {
        let mut inner = self.inner.lock();
        for slot in inner.entries.iter_mut() {
            if slot.as_ref().is_some_and(|e| Arc::ptr_eq(&e.pref, pref)) {
                if let Some(entry) = slot.take() {
                    entry.pref.clear_flags(RefFlags::EVICT_QUEUED);
                }
                return true;
            }
        }
        false
    }

    /// Drop every entry of tree `id`, returning how many were removed
    pub fn remove_tree(&self, id: TreeId) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for slot in inner.entries.iter_mut() {
            if slot.as_ref().is_some_and(|e| e.tree.id() == id) {
                if let Some(entry) = slot.take() {
                    entry.pref.clear_flags(RefFlags::EVICT_QUEUED);
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.inner.lock().release_all();
    }
}
