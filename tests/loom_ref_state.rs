//! Loom-based model-checked tests for the hazard pin protocol.
//!
//! A reader publishes a pin and then checks the reference is still
//! resident; an evictor moves the reference to locked and then checks no
//! pin is published. Each test replays that handshake on loom atomics so
//! every interleaving is explored without touching production code.
//!
//! Run with:
//! ```bash
//! cargo test --test loom_ref_state
//! ```

use loom::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use loom::sync::Arc;
use loom::thread;

const DISK: u8 = 0;
const LOCKED: u8 = 2;
const MEM: u8 = 3;

// ---------------------------------------------------------------------------
// Test-local harness: a page reference reduced to its state and pin count.
// ---------------------------------------------------------------------------

struct RefModel {
    state: AtomicU8,
    hazard: AtomicU32,
    /// Set when the evictor frees the page
    freed: AtomicU8,
}

impl RefModel {
    fn resident() -> Self {
        Self {
            state: AtomicU8::new(MEM),
            hazard: AtomicU32::new(0),
            freed: AtomicU8::new(0),
        }
    }

    fn hazard_set(&self) -> bool {
        self.hazard.fetch_add(1, Ordering::SeqCst);
        if self.state.load(Ordering::SeqCst) == MEM {
            return true;
        }
        self.hazard.fetch_sub(1, Ordering::SeqCst);
        false
    }

    fn hazard_clear(&self) {
        self.hazard.fetch_sub(1, Ordering::SeqCst);
    }

    fn lock_resident(&self, allowed: u32) -> bool {
        if self
            .state
            .compare_exchange(MEM, LOCKED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if self.hazard.load(Ordering::SeqCst) > allowed {
            self.state.store(MEM, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn evict(&self) -> bool {
        if !self.lock_resident(0) {
            return false;
        }
        self.freed.store(1, Ordering::SeqCst);
        self.state.store(DISK, Ordering::SeqCst);
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// A reader that holds a pin never sees the page freed underneath it.
#[test]
fn test_loom_pin_excludes_eviction() {
    loom::model(|| {
        let pref = Arc::new(RefModel::resident());

        let reader = {
            let pref = Arc::clone(&pref);
            thread::spawn(move || {
                if !pref.hazard_set() {
                    return false;
                }
                // While pinned the page must still be there.
                assert_eq!(pref.freed.load(Ordering::SeqCst), 0);
                pref.hazard_clear();
                true
            })
        };
        let evictor = {
            let pref = Arc::clone(&pref);
            thread::spawn(move || pref.evict())
        };

        let pinned = reader.join().unwrap();
        let evicted = evictor.join().unwrap();

        // Both sides may back off. When both succeed, the pin was dropped
        // before the evictor locked the reference.
        if pinned && evicted {
            assert_eq!(pref.freed.load(Ordering::SeqCst), 1);
        }
        assert_eq!(pref.hazard.load(Ordering::SeqCst), 0);
        let state = pref.state.load(Ordering::SeqCst);
        if evicted {
            assert_eq!(state, DISK);
        } else {
            assert_eq!(state, MEM);
        }
    });
}

/// Two evictors race for the same reference: at most one frees it.
#[test]
fn test_loom_single_evictor_wins() {
    loom::model(|| {
        let pref = Arc::new(RefModel::resident());
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let pref = Arc::clone(&pref);
                thread::spawn(move || pref.evict())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(pref.state.load(Ordering::SeqCst), DISK);
    });
}

/// A forced evictor that holds one pin itself may lock the page, but not
/// while a second reader holds another.
#[test]
fn test_loom_allowed_pins() {
    loom::model(|| {
        let pref = Arc::new(RefModel::resident());
        assert!(pref.hazard_set());

        let reader = {
            let pref = Arc::clone(&pref);
            thread::spawn(move || {
                let pinned = pref.hazard_set();
                if pinned {
                    pref.hazard_clear();
                }
                pinned
            })
        };
        let locked = pref.lock_resident(1);
        if locked {
            pref.state.store(MEM, Ordering::SeqCst);
        }
        reader.join().unwrap();
        pref.hazard_clear();
        assert_eq!(pref.hazard.load(Ordering::SeqCst), 0);
        assert_eq!(pref.state.load(Ordering::SeqCst), MEM);
    });
}
