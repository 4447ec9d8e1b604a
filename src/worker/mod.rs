//! Fixed pool of OS threads, each with a stable identity and its own task
//! queue. Sessions are pinned to one of these threads.

pub mod pool;
pub mod worker;

pub use pool::WorkerPool;
pub use worker::{Task, Worker, WorkerExecutor, WorkerHandle, WorkerId};

pub(crate) use worker::panic_message;
