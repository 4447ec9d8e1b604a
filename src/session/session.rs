use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{
    affinity::AffinityController,
    event::{SessionEvent, SessionHandler, dispatch_to_handler},
    pipeline::{Pipeline, PipelineBuilder},
};
use crate::{transport::Channel, worker::WorkerHandle};

// -----------------------------------------------------------------------------
// ----- SessionId -------------------------------------------------------------

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique and never reused, so beans keyed by it never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// -----------------------------------------------------------------------------
// ----- SessionInit -----------------------------------------------------------

pub struct SessionInit {
    pub service: String,
    pub aligned: bool,
    pub channel: Arc<dyn Channel>,
    pub handler: Arc<dyn SessionHandler>,
    pub pipeline: PipelineBuilder,
}

type CloseHook = Box<dyn Fn(&Arc<Session>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The new owner is the calling thread and registration completed inline.
    Registered,
    /// Registration was queued to the new owner.
    Pending,
    /// A peer close had already arrived; the session was deregistered and
    /// closed instead of getting a new owner.
    Finalized,
}

// -----------------------------------------------------------------------------
// ----- Session ---------------------------------------------------------------

pub struct Session {
    id: SessionId,
    service: String,
    aligned: bool,
    controller: AffinityController,
    handler: Arc<dyn SessionHandler>,
    builder: PipelineBuilder,

    owner: ArcSwapOption<WorkerHandle>,
    pipeline: ArcSwap<Pipeline>,
    generation: AtomicU64,

    registered: AtomicBool,
    created: AtomicBool,
    close_received: AtomicBool,
    closed: AtomicBool,
    read_suspended: AtomicBool,

    pending_writes: Mutex<VecDeque<Bytes>>,
    close_hook: OnceLock<CloseHook>,
}

// -----------------------------------------------------------------------------
// ----- Session: Static -------------------------------------------------------

impl Session {
    pub fn new(init: SessionInit) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::next(),
            service: init.service,
            aligned: init.aligned,
            controller: AffinityController::new(init.channel),
            handler: init.handler,
            builder: init.pipeline,
            owner: ArcSwapOption::empty(),
            pipeline: ArcSwap::from_pointee(Pipeline::unbound()),
            generation: AtomicU64::new(0),
            registered: AtomicBool::new(false),
            created: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            read_suspended: AtomicBool::new(false),
            pending_writes: Mutex::new(VecDeque::new()),
            close_hook: OnceLock::new(),
        })
    }
}

// -----------------------------------------------------------------------------
// ----- Session: Accessors ----------------------------------------------------

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_aligned(&self) -> bool {
        self.aligned
    }

    pub fn owner(&self) -> Option<WorkerHandle> {
        self.owner.load_full().map(|o| (*o).clone())
    }

    pub fn is_on_owner_thread(&self) -> bool {
        self.owner
            .load_full()
            .is_some_and(|owner| owner.is_current())
    }

    /// The live pipeline. May be mid-rebind; see [`Session::registered_pipeline`].
    pub fn pipeline(&self) -> Arc<Pipeline> {
        self.pipeline.load_full()
    }

    /// The pipeline, but only once registration has completed. Registration
    /// is published after the pipeline swap, so this never returns a stale one.
    pub fn registered_pipeline(&self) -> Option<Arc<Pipeline>> {
        if self.registered.load(Ordering::Acquire) {
            Some(self.pipeline.load_full())
        } else {
            None
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_read_suspended(&self) -> bool {
        self.read_suspended.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.controller.channel().local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.controller.channel().remote_addr()
    }

    pub fn controller(&self) -> &AffinityController {
        &self.controller
    }

    /// Runs once, on the owner thread, after the session has closed.
    pub fn set_close_hook<F>(&self, hook: F) -> bool
    where
        F: Fn(&Arc<Session>) + Send + Sync + 'static,
    {
        self.close_hook.set(Box::new(hook)).is_ok()
    }
}

// -----------------------------------------------------------------------------
// ----- Session: Lifecycle ----------------------------------------------------

impl Session {
    /// Give the session its first owner and fire `Created` there.
    pub fn start(self: &Arc<Self>, owner: WorkerHandle) -> MigrationOutcome {
        let outcome = self.set_affinity(owner);

        self.run_on_owner(|session| {
            if session.is_closed() || session.created.swap(true, Ordering::AcqRel) {
                return;
            }
            session.fire(SessionEvent::Created);
        });

        outcome
    }

    /// Move the session to `new_owner`. Must be called from the current owner
    /// thread, or from anywhere before the first owner is set.
    ///
    /// Order: build pipeline, swap pipeline, swap owner, then register and
    /// publish `registered` on the new owner.
    pub fn set_affinity(self: &Arc<Self>, new_owner: WorkerHandle) -> MigrationOutcome {
        if self.aligned {
            if let Some(current) = self.owner.load_full() {
                assert!(
                    current.is_current(),
                    "affinity violation: set_affinity on session {} must run on owner worker {}",
                    self.id,
                    current.id(),
                );
            }
        }

        // nothing left to register
        if self.is_closed() {
            return MigrationOutcome::Finalized;
        }
        if self.close_received.load(Ordering::Acquire) {
            self.finalize_closed();
            return MigrationOutcome::Finalized;
        }

        if self.registered.swap(false, Ordering::AcqRel) {
            self.controller.unregister(self);
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let pipeline = self.builder.build(self.id, new_owner.clone(), generation);
        self.pipeline.store(Arc::new(pipeline));

        let previous = self.owner.swap(Some(Arc::new(new_owner.clone())));
        debug!(
            "session {} affinity {:?} -> {} (pipeline gen {generation})",
            self.id,
            previous.map(|p| p.id()),
            new_owner.id(),
        );

        if !self.aligned || new_owner.is_current() {
            self.complete_registration();
            return MigrationOutcome::Registered;
        }

        let session = self.clone();
        new_owner
            .executor()
            .submit(move || session.complete_registration());
        MigrationOutcome::Pending
    }

    pub fn close(self: &Arc<Self>) {
        self.run_on_owner(|session| session.close_now());
    }

    pub fn suspend_read(self: &Arc<Self>) {
        self.run_on_owner(|session| session.apply_flow_control(false));
    }

    pub fn resume_read(self: &Arc<Self>) {
        self.run_on_owner(|session| session.apply_flow_control(true));
    }

    pub fn write(self: &Arc<Self>, message: Bytes) {
        self.run_on_owner(move |session| session.write_now(message));
    }
}

// -----------------------------------------------------------------------------
// ----- Session: Transport entry points ---------------------------------------

impl Session {
    pub fn dispatch_received(self: &Arc<Self>, message: Bytes) {
        self.post_to_owner(move |session| {
            if !session.is_closed() {
                session.fire(SessionEvent::MessageReceived(message));
            }
        });
    }

    pub fn dispatch_exception(self: &Arc<Self>, error: impl Into<Arc<str>>) {
        let error = error.into();
        self.post_to_owner(move |session| {
            if !session.is_closed() {
                session.fire(SessionEvent::ExceptionCaught(error));
            }
        });
    }

    pub fn closed_by_peer(self: &Arc<Self>) {
        self.close_received.store(true, Ordering::Release);
        self.post_to_owner(|session| session.close_now());
    }
}

// -----------------------------------------------------------------------------
// ----- Session: Private ------------------------------------------------------

impl Session {
    /// Run `op` inline when allowed here, otherwise queue it to the owner.
    fn run_on_owner<F>(self: &Arc<Self>, op: F)
    where
        F: FnOnce(&Arc<Session>) + Send + 'static,
    {
        if !self.aligned {
            op(self);
            return;
        }

        match self.owner.load_full() {
            Some(owner) if !owner.is_current() => {
                let session = self.clone();
                owner
                    .executor()
                    .submit(move || session.run_on_owner(op));
            }
            _ => op(self),
        }
    }

    /// Always queue behind work already submitted to the owner, so transport
    /// events never overtake lifecycle events.
    fn post_to_owner<F>(self: &Arc<Self>, op: F)
    where
        F: FnOnce(&Arc<Session>) + Send + 'static,
    {
        let owner = if self.aligned {
            self.owner.load_full()
        } else {
            None
        };

        match owner {
            Some(owner) => {
                let session = self.clone();
                owner
                    .executor()
                    .submit(move || session.run_on_owner(op));
            }
            None => op(self),
        }
    }

    fn complete_registration(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        if self.close_received.load(Ordering::Acquire) {
            self.finalize_closed();
            return;
        }

        if self.is_read_suspended() {
            self.controller.update_flow_control(self, false);
        }
        self.controller.register(self);
        self.registered.store(true, Ordering::Release);

        trace!("session {} registered", self.id);

        self.fire(SessionEvent::Registered);
        self.flush_pending();
    }

    fn finalize_closed(self: &Arc<Self>) {
        if self.registered.swap(false, Ordering::AcqRel) {
            self.controller.unregister(self);
        }
        self.close_now();
    }

    fn fire(self: &Arc<Self>, event: SessionEvent) {
        let pipeline = self.pipeline.load_full();
        let emitted = pipeline.fire_inbound(self, &event);

        if !emitted.is_empty() {
            self.pending_writes.lock().extend(emitted);
            self.flush_pending();
        }

        dispatch_to_handler(&*self.handler, self, &event);
    }

    fn write_now(self: &Arc<Self>, message: Bytes) {
        if self.is_closed() {
            debug!("dropping write on closed session {}", self.id);
            return;
        }

        let pipeline = self.pipeline.load_full();
        let (message, emitted) = pipeline.fire_outbound(self, message);

        {
            let mut pending = self.pending_writes.lock();
            pending.extend(emitted);
            if let Some(message) = message {
                pending.push_back(message);
            }
        }

        self.flush_pending();
    }

    fn flush_pending(self: &Arc<Self>) {
        if !self.is_registered() {
            return;
        }

        let batch: Vec<Bytes> = self.pending_writes.lock().drain(..).collect();
        if batch.is_empty() {
            return;
        }

        match self.controller.flush(self, batch.clone()) {
            Ok(()) => {
                for message in batch {
                    self.fire(SessionEvent::MessageSent(message));
                }
            }
            Err(e) => {
                warn!("flush failed on session {}: {e}", self.id);
                self.fire(SessionEvent::ExceptionCaught(e.to_string().into()));
            }
        }
    }

    fn apply_flow_control(self: &Arc<Self>, readable: bool) {
        self.read_suspended.store(!readable, Ordering::Release);
        if self.is_registered() {
            self.controller.update_flow_control(self, readable);
        }
    }

    fn close_now(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if !self.close_received.load(Ordering::Acquire) {
            self.flush_pending();
        }

        if self.registered.swap(false, Ordering::AcqRel) {
            self.controller.unregister(self);
        }
        self.controller.channel().close();

        if self.created.load(Ordering::Acquire) {
            self.fire(SessionEvent::Closed);
        }

        if let Some(hook) = self.close_hook.get() {
            hook(self);
        }

        debug!("session {} on '{}' closed", self.id, self.service);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("aligned", &self.aligned)
            .field("owner", &self.owner.load_full().map(|o| o.id()))
            .field("registered", &self.is_registered())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::{Stage, StageContext, WriteBufferStage},
        transport::MemoryChannel,
        worker::WorkerPool,
    };
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::AtomicUsize,
            mpsc,
        },
        thread::{self, ThreadId},
    };

    struct Recorder {
        tx: parking_lot::Mutex<mpsc::Sender<(&'static str, ThreadId)>>,
    }

    impl SessionHandler for Recorder {
        fn session_created(&self, _session: &Arc<Session>) {
            let _ = self.tx.lock().send(("created", thread::current().id()));
        }

        fn message_received(&self, session: &Arc<Session>, message: &Bytes) {
            let _ = self.tx.lock().send(("received", thread::current().id()));
            session.write(message.clone());
        }

        fn session_closed(&self, _session: &Arc<Session>) {
            let _ = self.tx.lock().send(("closed", thread::current().id()));
        }
    }

    /// Reports the buffer's depth after every pass through it.
    struct Gauged {
        inner: WriteBufferStage,
        held: Arc<AtomicUsize>,
    }

    impl Stage for Gauged {
        fn name(&self) -> &'static str {
            self.inner.name()
        }

        fn on_event(&mut self, ctx: &mut StageContext<'_>, event: &SessionEvent) {
            self.inner.on_event(ctx, event);
            self.held.store(self.inner.held_count(), Ordering::SeqCst);
        }

        fn on_write(&mut self, ctx: &mut StageContext<'_>, message: Bytes) -> Option<Bytes> {
            let passed = self.inner.on_write(ctx, message);
            self.held.store(self.inner.held_count(), Ordering::SeqCst);
            passed
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn session_with(
        builder: PipelineBuilder,
    ) -> (
        Arc<Session>,
        Arc<MemoryChannel>,
        mpsc::Receiver<(&'static str, ThreadId)>,
    ) {
        let (client, server) = MemoryChannel::pair(addr(1), addr(2));
        let (tx, rx) = mpsc::channel();
        let session = Session::new(SessionInit {
            service: "test".into(),
            aligned: true,
            channel: server,
            handler: Arc::new(Recorder {
                tx: parking_lot::Mutex::new(tx),
            }),
            pipeline: builder,
        });
        (session, client, rx)
    }

    fn barrier(owner: &WorkerHandle) {
        let (tx, rx) = mpsc::channel();
        owner.executor().submit(move || tx.send(()).unwrap());
        rx.recv().unwrap();
    }

    #[test]
    fn echo_runs_on_owner_thread() {
        let pool = WorkerPool::new("echo", 2).unwrap();
        let owner = pool.workers()[1].clone();
        let (session, client, events) = session_with(PipelineBuilder::new());

        session.start(owner.clone());
        client.send(Bytes::from_static(b"ping")).unwrap();

        let (kind, created_on) = events.recv().unwrap();
        assert_eq!(kind, "created");
        assert_eq!(created_on, owner.thread());

        let (kind, received_on) = events.recv().unwrap();
        assert_eq!(kind, "received");
        assert_eq!(received_on, owner.thread());

        barrier(&owner);
        assert_eq!(client.take_received(), vec![&b"ping"[..]]);
    }

    #[test]
    fn writes_before_registration_are_flushed_after_it() {
        let pool = WorkerPool::new("early", 1).unwrap();
        let owner = pool.workers()[0].clone();
        let builder = PipelineBuilder::new()
            .with_stage(|_| Box::new(WriteBufferStage::new()) as Box<dyn Stage>);
        let (session, client, _events) = session_with(builder);

        session.write(Bytes::from_static(b"early"));
        assert!(client.take_received().is_empty());

        session.start(owner.clone());
        barrier(&owner);

        assert_eq!(client.take_received(), vec![&b"early"[..]]);
    }

    #[test]
    fn writes_during_a_pending_migration_wait_in_the_buffer_stage() {
        let pool = WorkerPool::new("window", 2).unwrap();
        let (first, target) = (pool.workers()[0].clone(), pool.workers()[1].clone());
        let held = Arc::new(AtomicUsize::new(0));
        let gauge = held.clone();
        let builder = PipelineBuilder::new().with_stage(move |_| {
            Box::new(Gauged {
                inner: WriteBufferStage::new(),
                held: gauge.clone(),
            }) as Box<dyn Stage>
        });
        let (session, client, _events) = session_with(builder);

        session.start(first.clone());
        barrier(&first);
        assert!(session.is_registered());

        // queued ahead of the registration; runs on the new owner before it
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (seen_tx, seen_rx) = mpsc::channel();
        let writer = session.clone();
        let in_window = held.clone();
        target.executor().submit(move || {
            let _ = release_rx.recv();
            writer.write(Bytes::from_static(b"one"));
            writer.write(Bytes::from_static(b"two"));
            let _ = seen_tx.send((writer.is_registered(), in_window.load(Ordering::SeqCst)));
        });

        let (outcome_tx, outcome_rx) = mpsc::channel();
        let migrating = session.clone();
        let into = target.clone();
        first.executor().submit(move || {
            let _ = outcome_tx.send(migrating.set_affinity(into));
        });
        assert_eq!(outcome_rx.recv().unwrap(), MigrationOutcome::Pending);

        release_tx.send(()).unwrap();
        let (registered, held_in_window) = seen_rx.recv().unwrap();
        assert!(!registered);
        assert_eq!(held_in_window, 2);

        barrier(&target);
        assert!(session.is_registered());
        assert_eq!(held.load(Ordering::SeqCst), 0);
        assert_eq!(client.take_received(), vec![&b"one"[..], &b"two"[..]]);
    }

    #[test]
    fn migrating_a_closed_session_is_finalized() {
        let pool = WorkerPool::new("shut", 2).unwrap();
        let owner = pool.workers()[0].clone();
        let (session, client, _events) = session_with(PipelineBuilder::new());
        session.start(owner.clone());
        barrier(&owner);

        let (tx, rx) = mpsc::channel();
        let migrating = session.clone();
        let target = pool.workers()[1].clone();
        owner.executor().submit(move || {
            migrating.close();
            let _ = tx.send(migrating.set_affinity(target));
        });

        assert_eq!(rx.recv().unwrap(), MigrationOutcome::Finalized);
        assert!(session.is_closed());
        assert!(!session.is_registered());
        assert_eq!(session.owner().unwrap(), owner);
        assert!(client.is_closed());
    }

    #[test]
    fn migration_from_foreign_thread_panics() {
        let pool = WorkerPool::new("foreign", 2).unwrap();
        let (session, _client, _events) = session_with(PipelineBuilder::new());

        session.start(pool.workers()[0].clone());
        barrier(&pool.workers()[0]);

        let target = pool.workers()[1].clone();
        let result = panic::catch_unwind(AssertUnwindSafe(|| session.set_affinity(target)));
        assert!(result.is_err());
    }

    #[test]
    fn close_from_foreign_thread_runs_on_owner_once() {
        let pool = WorkerPool::new("close", 2).unwrap();
        let owner = pool.workers()[0].clone();
        let (session, client, events) = session_with(PipelineBuilder::new());

        session.start(owner.clone());
        session.close();
        session.close();
        barrier(&owner);

        let kinds: Vec<_> = events.try_iter().collect();
        let closed: Vec<_> = kinds.iter().filter(|(k, _)| *k == "closed").collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].1, owner.thread());
        assert!(client.is_closed());
        assert!(!session.is_registered());
    }

    #[test]
    fn suspend_and_resume_reach_the_channel_on_the_owner() {
        let pool = WorkerPool::new("flow", 2).unwrap();
        let owner = pool.workers()[0].clone();
        let (client, server) = MemoryChannel::pair(addr(1), addr(2));
        let session = Session::new(SessionInit {
            service: "test".into(),
            aligned: true,
            channel: server.clone(),
            handler: Arc::new(Recorder {
                tx: parking_lot::Mutex::new(mpsc::channel().0),
            }),
            pipeline: PipelineBuilder::new(),
        });

        session.start(owner.clone());
        session.suspend_read();
        barrier(&owner);
        assert!(!server.is_readable());
        assert!(session.is_read_suspended());

        session.resume_read();
        barrier(&owner);
        assert!(server.is_readable());
        drop(client);
    }
}
