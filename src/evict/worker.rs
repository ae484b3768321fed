//! Eviction server and worker threads
//!
//! The server thread runs a pass (recompute state, refill queues) and
//! tunes the worker count from throughput. Worker threads drain the
//! queues. Threads hold only a weak reference to the engine, so dropping
//! the connection stops them even without an explicit shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{EvictFlags, EvictionEngine, TuneAction, Tuner};

/// Server wait between passes while some pressure remains
const SERVER_BUSY_WAIT: Duration = Duration::from_millis(10);
/// Server and worker wait while there is nothing to do
const IDLE_WAIT: Duration = Duration::from_millis(100);

struct Worker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn join(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Thread handles owned by the engine
#[derive(Default)]
pub(crate) struct WorkerPool {
    workers: Mutex<Vec<Worker>>,
    server: Mutex<Option<JoinHandle<()>>>,
    server_running: AtomicBool,
    next_id: AtomicUsize,
}

impl WorkerPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn server_running(&self) -> bool {
        self.server_running.load(Ordering::Acquire)
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }
}

fn worker_loop(engine: Weak<EvictionEngine>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Acquire) {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        if engine.is_closing() {
            break;
        }
        if engine.evict_one(false).is_none() {
            engine.wait_for(IDLE_WAIT);
        }
    }
}

fn server_loop(weak: Weak<EvictionEngine>) {
    let mut tuner: Option<Tuner> = None;
    let mut bounds = (0, 0);
    loop {
        let Some(engine) = weak.upgrade() else {
            break;
        };
        if engine.is_closing() {
            break;
        }
        engine.server_pass();

        let (min, max, period_ms, force_retune_ms) = engine.with_config(|c| {
            (
                c.threads_min as usize,
                c.threads_max as usize,
                c.tune_period_ms,
                c.force_retune_ms,
            )
        });
        let tuner = tuner.get_or_insert_with(|| Tuner::new(min, max, period_ms, force_retune_ms));
        if bounds != (min, max) {
            bounds = (min, max);
            tuner.set_bounds(min, max);
        }
        let current = engine.worker_count();
        match tuner.observe(Instant::now(), engine.stats().pages_evicted(), current) {
            TuneAction::Hold => {}
            TuneAction::Add(n) => engine.resize_workers(current + n),
            TuneAction::Settle(n) | TuneAction::Reset(n) => engine.resize_workers(n),
        }
        engine
            .stats()
            .set_workers(engine.worker_count(), tuner.stable().unwrap_or(0));

        let wait = if engine.flags().intersects(EvictFlags::ALL) {
            SERVER_BUSY_WAIT
        } else {
            IDLE_WAIT
        };
        engine.wait_for(wait);
    }
    if let Some(engine) = weak.upgrade() {
        engine.pool.server_running.store(false, Ordering::Release);
    }
}

impl EvictionEngine {
    /// Start the server thread and the minimum number of workers
    pub fn start(self: &Arc<Self>) {
        if self.pool.server_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(self);
        match thread::Builder::new()
            .name("oxievict-server".into())
            .spawn(move || server_loop(weak))
        {
            Ok(handle) => *self.pool.server.lock() = Some(handle),
            Err(err) => {
                self.pool.server_running.store(false, Ordering::Release);
                tracing::warn!(error = %err, "failed to start eviction server");
                return;
            }
        }
        let min = self.with_config(|c| c.threads_min as usize);
        self.resize_workers(min);
        tracing::info!(workers = self.worker_count(), "eviction started");
    }

    /// Number of worker threads running
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Run `count` workers, clamped to the configured bounds
    pub fn resize_workers(self: &Arc<Self>, count: usize) {
        if self.is_closing() {
            return;
        }
        let (min, max) = self.with_config(|c| (c.threads_min as usize, c.threads_max as usize));
        let count = count.clamp(min, max.max(min));

        let retired = {
            let mut workers = self.pool.workers.lock();
            while workers.len() < count {
                let id = self.pool.next_id.fetch_add(1, Ordering::Relaxed);
                let stop = Arc::new(AtomicBool::new(false));
                let weak = Arc::downgrade(self);
                let thread_stop = Arc::clone(&stop);
                match thread::Builder::new()
                    .name(format!("oxievict-worker-{id}"))
                    .spawn(move || worker_loop(weak, thread_stop))
                {
                    Ok(handle) => workers.push(Worker {
                        stop,
                        handle: Some(handle),
                    }),
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to start eviction worker");
                        break;
                    }
                }
            }
            let keep = count.min(workers.len());
            workers.split_off(keep)
        };

        if !retired.is_empty() {
            for worker in &retired {
                worker.stop.store(true, Ordering::Release);
            }
            self.wake();
            for worker in retired {
                worker.join();
            }
        }
        tracing::debug!(workers = count, "eviction workers resized");
    }

    /// Stop the server and every worker, waiting for them to exit
    pub fn shutdown(&self) {
        self.set_closing();
        let server = self.pool.server.lock().take();
        if let Some(handle) = server {
            let _ = handle.join();
        }
        self.pool.server_running.store(false, Ordering::Release);

        let workers: Vec<Worker> = std::mem::take(&mut *self.pool.workers.lock());
        for worker in &workers {
            worker.stop.store(true, Ordering::Release);
        }
        self.wake();
        for worker in workers {
            worker.join();
        }
        self.stats().set_workers(0, 0);
        tracing::info!("eviction stopped");
    }
}
