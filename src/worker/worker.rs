use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle, ThreadId},
};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

// -----------------------------------------------------------------------------
// ----- Types -----------------------------------------------------------------

pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum Job {
    Run(Task),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

// -----------------------------------------------------------------------------
// ----- WorkerExecutor --------------------------------------------------------

/// Submits tasks to one worker thread. Cheap to clone.
#[derive(Clone)]
pub struct WorkerExecutor {
    worker: WorkerId,
    tx: mpsc::UnboundedSender<Job>,
}

impl WorkerExecutor {
    /// Queue `task` behind everything already submitted to this worker.
    /// Returns false once the worker has stopped; the task is dropped.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Job::Run(Box::new(task))).is_err() {
            warn!("worker {} stopped; dropping submitted task", self.worker);
            return false;
        }
        true
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    fn stop(&self) {
        let _ = self.tx.send(Job::Stop);
    }
}

impl fmt::Debug for WorkerExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerExecutor")
            .field("worker", &self.worker)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// ----- WorkerHandle ----------------------------------------------------------

/// Identity of a worker thread plus the way to reach it.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    thread: ThreadId,
    executor: WorkerExecutor,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn executor(&self) -> &WorkerExecutor {
        &self.executor
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }
}

impl PartialEq for WorkerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.thread == other.thread
    }
}

impl Eq for WorkerHandle {}

// -----------------------------------------------------------------------------
// ----- Worker ----------------------------------------------------------------

/// One OS thread draining a FIFO of tasks until stopped.
pub struct Worker {
    handle: WorkerHandle,
    join: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(name: &str, id: WorkerId) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let thread_name = format!("{name}-{}", id.0);

        let join = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_worker(id, rx))?;

        let handle = WorkerHandle {
            id,
            thread: join.thread().id(),
            executor: WorkerExecutor { worker: id, tx },
        };

        Ok(Self {
            handle,
            join: Some(join),
        })
    }

    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Ask the thread to exit once its queue drains up to this point, then
    /// wait for it. Must not be called from the worker itself.
    pub fn stop_and_join(&mut self) {
        assert!(
            !self.handle.is_current(),
            "worker {} cannot join itself",
            self.handle.id
        );

        self.handle.executor.stop();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("worker {} exited abnormally", self.handle.id);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.join.is_some() && !self.handle.is_current() {
            self.stop_and_join();
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn run_worker(id: WorkerId, mut rx: mpsc::UnboundedReceiver<Job>) {
    debug!("worker {id} started");

    while let Some(job) = rx.blocking_recv() {
        match job {
            Job::Run(task) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    error!("worker {id} task panicked: {}", panic_message(&*payload));
                }
            }
            Job::Stop => break,
        }
    }

    debug!("worker {id} stopped");
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
