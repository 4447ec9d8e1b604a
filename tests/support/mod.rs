#![allow(dead_code)]

use std::{
    net::{SocketAddr, TcpListener},
    path::Path,
    process::Command,
    sync::{Arc, mpsc},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::sleep;

use crabgate::{
    Session, SessionHandler, WorkerPool,
    errors::ListenerResult,
    management::{ManagementEvent, ManagementEventKind, ManagementListener},
    session::SessionId,
    worker::WorkerHandle,
};

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn reserve_port(host: &str) -> u16 {
    let addr = format!("{host}:0");
    let listener = TcpListener::bind(&addr).expect("bind ephemeral port");
    listener.local_addr().unwrap().port()
}

pub fn spawn_crabgate(config_path: &Path) -> std::process::Child {
    let exe = env!("CARGO_BIN_EXE_crabgate");
    Command::new(exe)
        .env("CRABGATE_CONFIG_FILE", config_path)
        .arg("--log")
        .arg("warn")
        .spawn()
        .expect("spawn crabgate")
}

pub async fn wait_for_listen(host: &str, port: u16) {
    let addr = format!("{host}:{port}");
    for _ in 0..100 {
        if std::net::TcpStream::connect(&addr).is_ok() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("crabgate did not start listening on {addr}");
}

/// Poll `cond` until it holds or two seconds pass.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

/// Run `f` on `worker` and wait for its result.
pub fn on_worker<R, F>(worker: &WorkerHandle, f: F) -> R
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    assert!(worker.executor().submit(move || {
        let _ = tx.send(f());
    }));
    rx.recv().expect("worker dropped the task")
}

/// Let every worker drain what is queued, a few times over, so work queued
/// from inside earlier tasks also runs.
pub fn settle(pool: &WorkerPool) {
    for _ in 0..3 {
        for worker in pool.workers() {
            on_worker(worker, || ());
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Handlers --------------------------------------------------------------

pub struct Echo;

impl SessionHandler for Echo {
    fn message_received(&self, session: &Arc<Session>, message: &Bytes) {
        session.write(message.clone());
    }
}

pub struct Silent;

impl SessionHandler for Silent {}

/// Records which thread each handler callback ran on.
#[derive(Default)]
pub struct ThreadLog {
    pub calls: Mutex<Vec<(&'static str, ThreadId)>>,
}

impl ThreadLog {
    fn push(&self, what: &'static str) {
        self.calls.lock().push((what, thread::current().id()));
    }
}

impl SessionHandler for ThreadLog {
    fn session_created(&self, _session: &Arc<Session>) {
        self.push("created");
    }

    fn message_received(&self, _session: &Arc<Session>, _message: &Bytes) {
        self.push("received");
    }

    fn session_closed(&self, _session: &Arc<Session>) {
        self.push("closed");
    }
}

// -----------------------------------------------------------------------------
// ----- Listeners -------------------------------------------------------------

#[derive(Default)]
pub struct EventLog {
    pub events: Mutex<Vec<(Option<SessionId>, ManagementEventKind)>>,
}

impl EventLog {
    pub fn for_session(&self, id: SessionId) -> Vec<ManagementEventKind> {
        self.events
            .lock()
            .iter()
            .filter(|(s, _)| *s == Some(id))
            .map(|(_, k)| k.clone())
            .collect()
    }
}

impl ManagementListener for EventLog {
    fn on_event(&self, event: &ManagementEvent) -> ListenerResult {
        self.events.lock().push((event.session, event.kind.clone()));
        Ok(())
    }
}
