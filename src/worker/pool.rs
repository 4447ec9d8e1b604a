use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    thread,
};

use parking_lot::Mutex;
use tracing::info;

use super::worker::{Worker, WorkerHandle, WorkerId};

// -----------------------------------------------------------------------------
// ----- WorkerPool ------------------------------------------------------------

pub struct WorkerPool {
    name: String,
    handles: Vec<WorkerHandle>,
    workers: Mutex<Vec<Worker>>,
    next: AtomicUsize,
    shut_down: AtomicBool,
}

// -----------------------------------------------------------------------------
// ----- WorkerPool: Static ----------------------------------------------------

impl WorkerPool {
    /// Spawn `size` workers. A size of zero means one per available core.
    pub fn new(name: impl Into<String>, size: usize) -> std::io::Result<Self> {
        let name = name.into();
        let size = if size == 0 {
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            size
        };

        let mut workers = Vec::with_capacity(size);
        for ordinal in 0..size {
            workers.push(Worker::spawn(&name, WorkerId(ordinal))?);
        }

        let handles = workers.iter().map(|w| w.handle().clone()).collect();

        info!("worker pool '{name}' started with {size} threads");

        Ok(Self {
            name,
            handles,
            workers: Mutex::new(workers),
            next: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        })
    }
}

// -----------------------------------------------------------------------------
// ----- WorkerPool: Public ----------------------------------------------------

impl WorkerPool {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.handles
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.handles.get(id.0)
    }

    /// Round-robin assignment for new sessions.
    pub fn next(&self) -> &WorkerHandle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        &self.handles[i]
    }

    /// The worker the calling thread belongs to, if any.
    pub fn current(&self) -> Option<&WorkerHandle> {
        self.handles.iter().find(|h| h.is_current())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop every worker after its queued tasks and block until all threads
    /// have exited. Later calls return immediately.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers.iter_mut() {
            worker.stop_and_join();
        }

        info!("worker pool '{}' terminated", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.current().is_none() {
            self.shutdown();
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
