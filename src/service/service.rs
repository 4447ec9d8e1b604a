use std::{
    collections::BTreeSet,
    fmt,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{connect::ConnectFuture, listener::ServiceListener, service_config::ServiceConfig};
use crate::{
    errors::{GatewayError, ListenerResult},
    management::{ManagementContext, ManagementStage, ServiceBean},
    session::{
        PipelineBuilder, Session, SessionHandler, SessionId, SessionInit, Stage, StageFactory,
        WriteBufferStage,
    },
    transport::{Acceptor, Channel, Transport},
    worker::{WorkerPool, panic_message},
};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

/// Upper bound on how long disposal waits for sessions on a shared pool.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// -----------------------------------------------------------------------------
// ----- DisposalState ---------------------------------------------------------

/// One-way: Active -> Disposing -> Disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DisposalState {
    Active = 0,
    Disposing = 1,
    Disposed = 2,
}

impl DisposalState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => DisposalState::Active,
            1 => DisposalState::Disposing,
            _ => DisposalState::Disposed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DisposalState::Active => "active",
            DisposalState::Disposing => "disposing",
            DisposalState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for DisposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -----------------------------------------------------------------------------
// ----- ExecutorSource --------------------------------------------------------

/// Where the service's worker threads come from. Only an owned pool is shut
/// down on disposal.
pub enum ExecutorSource {
    Owned(WorkerPool),
    Shared(Arc<WorkerPool>),
}

impl ExecutorSource {
    pub fn pool(&self) -> &WorkerPool {
        match self {
            ExecutorSource::Owned(pool) => pool,
            ExecutorSource::Shared(pool) => pool.as_ref(),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, ExecutorSource::Owned(_))
    }
}

// -----------------------------------------------------------------------------
// ----- Service ---------------------------------------------------------------

pub struct Service {
    me: Weak<Service>,
    config: ServiceConfig,
    transport: Arc<dyn Transport>,
    ctx: Arc<ManagementContext>,
    bean: Arc<ServiceBean>,
    executors: ExecutorSource,

    handler: RwLock<Option<Arc<dyn SessionHandler>>>,
    stages: RwLock<PipelineBuilder>,
    listeners: ArcSwap<Vec<Arc<dyn ServiceListener>>>,

    // Guards the empty <-> non-empty edge; the only broad lock in the core.
    bound: Mutex<BTreeSet<SocketAddr>>,
    managed: DashMap<SessionId, Arc<Session>>,
    drain_lock: Mutex<()>,
    drained: Condvar,

    state: AtomicU8,
    disposal: OnceLock<()>,
}

// -----------------------------------------------------------------------------
// ----- Service: Static -------------------------------------------------------

impl Service {
    /// A service with its own worker pool of `config.workers` threads.
    pub fn new(
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
        ctx: Arc<ManagementContext>,
    ) -> Result<Arc<Self>, GatewayError> {
        let pool =
            WorkerPool::new(config.name.clone(), config.workers).map_err(GatewayError::WorkerPool)?;
        Self::build(config, transport, ctx, ExecutorSource::Owned(pool))
    }

    /// A service whose sessions run on an externally owned pool.
    pub fn with_pool(
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
        ctx: Arc<ManagementContext>,
        pool: Arc<WorkerPool>,
    ) -> Result<Arc<Self>, GatewayError> {
        Self::build(config, transport, ctx, ExecutorSource::Shared(pool))
    }

    fn build(
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
        ctx: Arc<ManagementContext>,
        executors: ExecutorSource,
    ) -> Result<Arc<Self>, GatewayError> {
        let bean = ctx.register_service(&config.name)?;

        info!(
            "service '{}' created (transport={}, aligned={}, management={}, workers={})",
            config.name,
            transport.name(),
            config.aligned,
            config.management,
            executors.pool().size(),
        );

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            transport,
            ctx,
            bean,
            executors,
            handler: RwLock::new(None),
            stages: RwLock::new(PipelineBuilder::new()),
            listeners: ArcSwap::from_pointee(Vec::new()),
            bound: Mutex::new(BTreeSet::new()),
            managed: DashMap::new(),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
            state: AtomicU8::new(DisposalState::Active as u8),
            disposal: OnceLock::new(),
        }))
    }
}

// -----------------------------------------------------------------------------
// ----- Service: Accessors ----------------------------------------------------

impl Service {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn state(&self) -> DisposalState {
        DisposalState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.state() == DisposalState::Active
    }

    pub fn bean(&self) -> &Arc<ServiceBean> {
        &self.bean
    }

    pub fn context(&self) -> &Arc<ManagementContext> {
        &self.ctx
    }

    pub fn pool(&self) -> &WorkerPool {
        self.executors.pool()
    }

    pub fn bound_addresses(&self) -> Vec<SocketAddr> {
        self.bound.lock().iter().copied().collect()
    }

    pub fn is_bound(&self) -> bool {
        !self.bound.lock().is_empty()
    }

    /// Open sessions, oldest first.
    pub fn managed_sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.managed.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    pub fn managed_session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.managed.get(&id).map(|s| s.clone())
    }

    pub fn managed_count(&self) -> usize {
        self.managed.len()
    }
}

// -----------------------------------------------------------------------------
// ----- Service: Setup --------------------------------------------------------

impl Service {
    pub fn set_handler(&self, handler: Arc<dyn SessionHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn handler(&self) -> Option<Arc<dyn SessionHandler>> {
        self.handler.read().clone()
    }

    /// Append a stage to the pipeline of sessions created from now on.
    pub fn add_stage<F>(&self, factory: F)
    where
        F: Fn(SessionId) -> Box<dyn Stage> + Send + Sync + 'static,
    {
        self.stages.write().push(Arc::new(factory));
    }

    pub fn add_listener(&self, listener: Arc<dyn ServiceListener>) {
        self.listeners.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(listener.clone());
            next
        });
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ServiceListener>) -> bool {
        let mut removed = false;
        self.listeners.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|l| !Arc::ptr_eq(l, listener))
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }
}

// -----------------------------------------------------------------------------
// ----- Service: Lifecycle ----------------------------------------------------

impl Service {
    /// Start accepting on `addr` and return the bound address. Binding the
    /// first address fires `activated` once.
    pub fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, GatewayError> {
        self.ensure_active("bind")?;

        let bound = self
            .transport
            .bind(addr, self.acceptor())
            .map_err(|e| GatewayError::transport(addr, e))?;

        let mut set = self.bound.lock();

        // disposal may have started while the transport was binding
        let state = self.state();
        if state != DisposalState::Active {
            drop(set);
            let _ = self.transport.unbind(bound);
            return Err(GatewayError::illegal_state(
                self.name(),
                state.as_str(),
                "bind",
            ));
        }

        let first = set.is_empty();
        set.insert(bound);
        info!("service '{}' bound {bound}", self.name());

        if first {
            info!("service '{}' activated", self.name());
            self.notify("activated", |l| l.activated(self.name(), bound));
        }
        Ok(bound)
    }

    /// Stop accepting on `addr`. Unbinding the last address fires
    /// `deactivated` once.
    pub fn unbind(&self, addr: SocketAddr) -> Result<(), GatewayError> {
        let mut set = self.bound.lock();
        if !set.remove(&addr) {
            return Err(GatewayError::NotBound { addr });
        }

        if let Err(e) = self.transport.unbind(addr) {
            warn!("service '{}' transport unbind {addr}: {e}", self.name());
        }
        info!("service '{}' unbound {addr}", self.name());

        if set.is_empty() {
            info!("service '{}' deactivated", self.name());
            self.notify("deactivated", |l| l.deactivated(self.name(), addr));
        }
        Ok(())
    }

    /// Open an outbound session. A handler must be set first.
    pub fn connect(&self, addr: SocketAddr) -> Result<ConnectFuture, GatewayError> {
        self.ensure_active("connect")?;
        let handler = self.handler().ok_or_else(|| GatewayError::HandlerNotSet {
            service: self.name().to_string(),
        })?;

        let future = ConnectFuture::new(addr);
        let pending = future.clone();
        let service = self.me.clone();

        debug!("service '{}' connecting to {addr}", self.name());

        self.transport.connect(
            addr,
            Box::new(move |result| {
                let channel = match result {
                    Ok(channel) => channel,
                    Err(e) => {
                        warn!("connect to {addr} failed: {e}");
                        pending.fail(e.to_string());
                        return;
                    }
                };

                let Some(service) = service.upgrade() else {
                    channel.close();
                    pending.fail("service dropped");
                    return;
                };
                if !service.is_active() {
                    channel.close();
                    pending.fail(format!("service is {}", service.state()));
                    return;
                }

                let session = service.create_session(channel.clone(), handler);

                // armed before the session is visible anywhere
                let on_cancel = session.clone();
                if !pending.set_cancel_hook(move || on_cancel.close()) {
                    debug!("connect to {addr} canceled before completion");
                    channel.close();
                    return;
                }

                if !service.publish(session.clone()) {
                    pending.fail(format!("service is {}", service.state()));
                    return;
                }
                pending.complete(session);
            }),
        );

        Ok(future)
    }

    /// Tear the service down: unbind everything, close every session, and
    /// stop an owned pool. The first caller does the work; concurrent callers
    /// block until it is finished, including the session closes queued to a
    /// shared pool. Must not be called from a worker thread of the service's
    /// pool.
    pub fn dispose(&self) {
        self.disposal.get_or_init(|| self.dispose_now());
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == DisposalState::Disposed
    }
}

// -----------------------------------------------------------------------------
// ----- Service: Private ------------------------------------------------------

impl Service {
    fn ensure_active(&self, operation: &'static str) -> Result<(), GatewayError> {
        let state = self.state();
        if state != DisposalState::Active {
            return Err(GatewayError::illegal_state(
                self.name(),
                state.as_str(),
                operation,
            ));
        }
        Ok(())
    }

    fn acceptor(&self) -> Acceptor {
        let service = self.me.clone();
        Arc::new(move |channel: Arc<dyn Channel>| {
            let Some(service) = service.upgrade() else {
                channel.close();
                return;
            };
            service.accept(channel);
        })
    }

    fn accept(&self, channel: Arc<dyn Channel>) {
        if !self.is_active() {
            debug!("service '{}' refusing connection: {}", self.name(), self.state());
            channel.close();
            return;
        }

        let Some(handler) = self.handler() else {
            warn!(
                "service '{}' has no handler; dropping connection from {}",
                self.name(),
                channel.remote_addr()
            );
            channel.close();
            return;
        };

        let session = self.create_session(channel, handler);
        self.publish(session);
    }

    fn create_session(
        &self,
        channel: Arc<dyn Channel>,
        handler: Arc<dyn SessionHandler>,
    ) -> Arc<Session> {
        let mut pipeline = self.stages.read().clone();
        let buffer: StageFactory =
            Arc::new(|_: SessionId| Box::new(WriteBufferStage::new()) as Box<dyn Stage>);
        pipeline.push_front(buffer);
        pipeline.push_front(ManagementStage::factory(
            self.ctx.clone(),
            self.bean.clone(),
            self.config.management,
        ));

        Session::new(SessionInit {
            service: self.config.name.clone(),
            aligned: self.config.aligned,
            channel,
            handler,
            pipeline,
        })
    }

    /// Track the session and give it its first owner. Returns false when
    /// disposal began first; the connection is then closed and never seen.
    fn publish(&self, session: Arc<Session>) -> bool {
        let service = self.me.clone();
        session.set_close_hook(move |closed| {
            if let Some(service) = service.upgrade() {
                service.forget(closed);
            }
        });

        self.managed.insert(session.id(), session.clone());

        // disposal may have taken its snapshot before the insert
        if !self.is_active() {
            self.managed.remove(&session.id());
            debug!(
                "service '{}' dropping session {} from {}: {}",
                self.name(),
                session.id(),
                session.remote_addr(),
                self.state()
            );
            session.controller().channel().close();
            self.signal_drained();
            return false;
        }

        debug!(
            "service '{}' session {} from {}",
            self.name(),
            session.id(),
            session.remote_addr()
        );
        self.notify("session_created", |l| l.session_created(&session));

        let owner = self.pool().next().clone();
        session.start(owner);

        // closed before the hook could see it
        if session.is_closed() {
            self.forget(&session);
        }
        true
    }

    fn forget(&self, session: &Arc<Session>) {
        if self.managed.remove(&session.id()).is_some() {
            self.notify("session_destroyed", |l| l.session_destroyed(session));
            self.signal_drained();
        }
    }

    fn signal_drained(&self) {
        if self.is_active() {
            return;
        }
        let _guard = self.drain_lock.lock();
        self.drained.notify_all();
    }

    /// Block until every managed session has been forgotten. Closes on a
    /// shared pool run on threads disposal does not stop.
    fn await_drained(&self) {
        let pool = self.pool();
        if pool.current().is_some() || pool.is_shut_down() {
            return;
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        let mut guard = self.drain_lock.lock();
        while !self.managed.is_empty() {
            if self.drained.wait_until(&mut guard, deadline).timed_out() {
                warn!(
                    "service '{}' dispose: {} sessions still open after {:?}",
                    self.name(),
                    self.managed.len(),
                    DRAIN_TIMEOUT
                );
                break;
            }
        }
    }

    fn dispose_now(&self) {
        // pairs with the insert-then-check in publish
        self.state
            .store(DisposalState::Disposing as u8, Ordering::SeqCst);
        info!("service '{}' disposing", self.name());

        for addr in self.bound_addresses() {
            if let Err(e) = self.unbind(addr) {
                debug!("service '{}' dispose: {e}", self.name());
            }
        }

        let sessions = self.managed_sessions();
        for session in &sessions {
            session.close();
        }

        match &self.executors {
            // queued closes run before the workers stop
            ExecutorSource::Owned(pool) => pool.shutdown(),
            ExecutorSource::Shared(_) => self.await_drained(),
        }

        self.ctx.unregister_service(self.name());
        self.state
            .store(DisposalState::Disposed as u8, Ordering::Release);
        info!(
            "service '{}' disposed ({} sessions closed)",
            self.name(),
            sessions.len()
        );
    }

    fn notify<F>(&self, what: &'static str, call: F)
    where
        F: Fn(&dyn ServiceListener) -> ListenerResult,
    {
        for (index, listener) in self.listeners.load().iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    "service '{}' listener #{index} failed on {what}: {e}",
                    self.name()
                ),
                Err(payload) => error!(
                    "service '{}' listener #{index} panicked on {what}: {}",
                    self.name(),
                    panic_message(&*payload)
                ),
            }
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("bound", &self.bound_addresses())
            .field("managed", &self.managed.len())
            .finish()
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if self.disposal.get().is_none() && self.pool().current().is_none() {
            self.dispose();
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryChannel, MemoryTransport};
    use std::sync::atomic::AtomicUsize;

    struct Silent;

    impl SessionHandler for Silent {}

    #[derive(Default)]
    struct Edges {
        activated: AtomicUsize,
        deactivated: AtomicUsize,
        created: AtomicUsize,
    }

    impl ServiceListener for Edges {
        fn activated(&self, _service: &str, _first: SocketAddr) -> ListenerResult {
            self.activated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn deactivated(&self, _service: &str, _last: SocketAddr) -> ListenerResult {
            self.deactivated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn session_created(&self, _session: &Arc<Session>) -> ListenerResult {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn service(name: &str) -> Arc<Service> {
        let ctx = ManagementContext::new("gw", 10).unwrap();
        Service::new(
            ServiceConfig::new(name).workers(2),
            Arc::new(MemoryTransport::new()),
            ctx,
        )
        .unwrap()
    }

    #[test]
    fn activation_edges_fire_once() {
        let svc = service("edges");
        let edges = Arc::new(Edges::default());
        svc.add_listener(edges.clone());

        svc.bind(addr(1)).unwrap();
        svc.bind(addr(2)).unwrap();
        svc.unbind(addr(2)).unwrap();
        svc.unbind(addr(1)).unwrap();

        assert_eq!(edges.activated.load(Ordering::SeqCst), 1);
        assert_eq!(edges.deactivated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unbinding_unknown_address_fails() {
        let svc = service("unknown");
        assert!(matches!(
            svc.unbind(addr(9)),
            Err(GatewayError::NotBound { .. })
        ));
    }

    #[test]
    fn connect_needs_a_handler() {
        let svc = service("nohandler");
        assert!(matches!(
            svc.connect(addr(1)),
            Err(GatewayError::HandlerNotSet { .. })
        ));
    }

    #[test]
    fn bind_after_dispose_is_rejected() {
        let svc = service("gone");
        svc.dispose();
        svc.dispose();

        assert_eq!(svc.state(), DisposalState::Disposed);
        assert!(svc.pool().is_shut_down());
        assert!(matches!(
            svc.bind(addr(1)),
            Err(GatewayError::IllegalState { state: "disposed", .. })
        ));
    }

    #[test]
    fn session_arriving_after_disposal_began_is_closed_and_never_tracked() {
        let svc = service("late-accept");
        let edges = Arc::new(Edges::default());
        svc.add_listener(edges.clone());

        // the accept check passed, then disposal ran before the session was published
        let (client, server) = MemoryChannel::pair(addr(1), addr(2));
        let session = svc.create_session(server.clone(), Arc::new(Silent));
        svc.dispose();

        assert!(!svc.publish(session.clone()));
        assert_eq!(svc.managed_count(), 0);
        assert!(server.is_closed());
        assert!(client.is_closed());
        assert!(session.owner().is_none());
        assert_eq!(edges.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn duplicate_service_names_are_rejected() {
        let ctx = ManagementContext::new("gw", 10).unwrap();
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let _a = Service::new(ServiceConfig::new("dup").workers(1), transport.clone(), ctx.clone())
            .unwrap();
        assert!(matches!(
            Service::new(ServiceConfig::new("dup").workers(1), transport, ctx),
            Err(GatewayError::BeanAlreadyInitialized { .. })
        ));
    }

    #[test]
    fn accepted_connections_become_managed_sessions() {
        let ctx = ManagementContext::new("gw", 10).unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let svc = Service::new(
            ServiceConfig::new("accept").workers(1),
            transport.clone(),
            ctx,
        )
        .unwrap();
        svc.set_handler(Arc::new(Silent));
        let bound = svc.bind(addr(0)).unwrap();

        let client = transport.dial(bound).unwrap();
        assert_eq!(svc.managed_count(), 1);

        client.close();
        svc.dispose();
        assert_eq!(svc.managed_count(), 0);
    }
}
