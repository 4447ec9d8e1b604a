use std::sync::{Arc, mpsc};

use parking_lot::Mutex;

use crate::worker::{Worker, WorkerExecutor, WorkerHandle, WorkerId};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const THREAD_NAME: &str = "crabgate-mgmt";

// -----------------------------------------------------------------------------
// ----- NotificationExecutor --------------------------------------------------

/// Single thread that runs deferred listener notifications in submission
/// order. One thread for every entity keeps each entity's notifications in
/// the order they were recorded.
#[derive(Clone)]
pub struct NotificationExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    handle: WorkerHandle,
    worker: Mutex<Option<Worker>>,
}

impl NotificationExecutor {
    pub fn new() -> std::io::Result<Self> {
        let worker = Worker::spawn(THREAD_NAME, WorkerId(0))?;
        Ok(Self {
            inner: Arc::new(Inner {
                handle: worker.handle().clone(),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn executor(&self) -> &WorkerExecutor {
        self.inner.handle.executor()
    }

    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.handle.executor().submit(task)
    }

    pub fn is_current(&self) -> bool {
        self.inner.handle.is_current()
    }

    /// Block until everything submitted before this call has run.
    pub fn drain(&self) {
        if self.is_current() {
            return;
        }

        let (tx, rx) = mpsc::channel();
        if self.submit(move || {
            let _ = tx.send(());
        }) {
            let _ = rx.recv();
        }
    }

    /// Run what is queued, then stop the thread.
    pub fn shutdown(&self) {
        if self.is_current() {
            return;
        }
        let worker = self.inner.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop_and_join();
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
