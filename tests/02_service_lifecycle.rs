mod support;

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;

use crabgate::{
    ManagementContext, Service, ServiceConfig, Session, WorkerPool,
    errors::{GatewayError, ListenerResult},
    service::{ConnectState, DisposalState, ServiceListener},
    transport::{Acceptor, ConnectCallback, MemoryTransport, Transport},
};

use support::{Echo, Silent, addr, settle, wait_until};

fn memory_service(
    name: &str,
    ctx: &Arc<ManagementContext>,
    transport: &Arc<MemoryTransport>,
) -> Arc<Service> {
    Service::new(
        ServiceConfig::new(name).workers(2),
        transport.clone(),
        ctx.clone(),
    )
    .unwrap()
}

#[derive(Default)]
struct Lifecycle {
    activated: AtomicUsize,
    deactivated: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl ServiceListener for Lifecycle {
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

    fn session_destroyed(&self, _session: &Arc<Session>) -> ListenerResult {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn concurrent_binds_activate_exactly_once() {
    let ctx = ManagementContext::new("gw", 10).unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let service = memory_service("edges", &ctx, &transport);
    let lifecycle = Arc::new(Lifecycle::default());
    service.add_listener(lifecycle.clone());

    const THREADS: u16 = 8;
    let barrier = Barrier::new(THREADS as usize);

    thread::scope(|s| {
        for port in 1..=THREADS {
            let service = &service;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                service.bind(addr(port)).unwrap();
            });
        }
    });
    assert_eq!(lifecycle.activated.load(Ordering::SeqCst), 1);
    assert_eq!(service.bound_addresses().len(), THREADS as usize);

    thread::scope(|s| {
        for port in 1..=THREADS {
            let service = &service;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                service.unbind(addr(port)).unwrap();
            });
        }
    });
    assert_eq!(lifecycle.deactivated.load(Ordering::SeqCst), 1);
    assert!(!service.is_bound());

    // a second round fires a second pair
    service.bind(addr(1)).unwrap();
    service.unbind(addr(1)).unwrap();
    assert_eq!(lifecycle.activated.load(Ordering::SeqCst), 2);
    assert_eq!(lifecycle.deactivated.load(Ordering::SeqCst), 2);
}

#[test]
fn concurrent_dispose_runs_once_and_everyone_waits() {
    let ctx = ManagementContext::new("gw", 10).unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let service = memory_service("dispose", &ctx, &transport);
    service.set_handler(Arc::new(Silent));
    let lifecycle = Arc::new(Lifecycle::default());
    service.add_listener(lifecycle.clone());

    let bound = service.bind(addr(0)).unwrap();
    let clients: Vec<_> = (0..4).map(|_| transport.dial(bound).unwrap()).collect();
    settle(service.pool());
    assert_eq!(service.managed_count(), 4);

    let barrier = Barrier::new(4);
    thread::scope(|s| {
        for _ in 0..4 {
            let service = &service;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                service.dispose();
                // nobody returns before the work is done
                assert_eq!(service.state(), DisposalState::Disposed);
            });
        }
    });

    assert_eq!(service.managed_count(), 0);
    assert!(!transport.is_bound(bound));
    assert!(service.pool().is_shut_down());
    assert!(ctx.service_bean("dispose").is_none());
    assert!(clients.iter().all(|c| c.is_closed()));
    assert_eq!(lifecycle.activated.load(Ordering::SeqCst), 1);
    assert_eq!(lifecycle.deactivated.load(Ordering::SeqCst), 1);
    assert_eq!(lifecycle.created.load(Ordering::SeqCst), 4);
    assert_eq!(lifecycle.destroyed.load(Ordering::SeqCst), 4);
}

#[test]
fn dispose_on_a_shared_pool_waits_for_queued_closes() {
    let ctx = ManagementContext::new("gw", 10).unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let pool = Arc::new(WorkerPool::new("shared-dispose", 2).unwrap());
    let service = Service::with_pool(
        ServiceConfig::new("shared"),
        transport.clone(),
        ctx.clone(),
        pool.clone(),
    )
    .unwrap();
    service.set_handler(Arc::new(Silent));
    let lifecycle = Arc::new(Lifecycle::default());
    service.add_listener(lifecycle.clone());

    let bound = service.bind(addr(0)).unwrap();
    let clients: Vec<_> = (0..4).map(|_| transport.dial(bound).unwrap()).collect();
    settle(&pool);
    assert_eq!(service.managed_count(), 4);

    // hold every worker so the closes queued by dispose cannot run yet
    let gates: Vec<_> = pool
        .workers()
        .iter()
        .map(|worker| {
            let (tx, rx) = mpsc::channel::<()>();
            worker.executor().submit(move || {
                let _ = rx.recv();
            });
            tx
        })
        .collect();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        for gate in gates {
            let _ = gate.send(());
        }
    });

    service.dispose();

    assert_eq!(service.state(), DisposalState::Disposed);
    assert_eq!(service.managed_count(), 0);
    assert_eq!(lifecycle.destroyed.load(Ordering::SeqCst), 4);
    assert!(clients.iter().all(|c| c.is_closed()));
    assert!(ctx.service_bean("shared").is_none());
    assert!(!pool.is_shut_down());

    releaser.join().unwrap();
    pool.shutdown();
}

#[test]
fn operations_after_dispose_report_the_state() {
    let ctx = ManagementContext::new("gw", 10).unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let service = memory_service("late", &ctx, &transport);
    service.set_handler(Arc::new(Silent));
    service.dispose();

    assert!(matches!(
        service.connect(addr(1)),
        Err(GatewayError::IllegalState {
            state: "disposed",
            ..
        })
    ));

    // the name is free again
    let again = memory_service("late", &ctx, &transport);
    assert!(again.is_active());
    again.dispose();
}

#[test]
fn connect_without_handler_is_rejected() {
    let ctx = ManagementContext::new("gw", 10).unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let service = memory_service("client", &ctx, &transport);

    let err = service.connect(addr(5)).err().unwrap();
    assert!(matches!(err, GatewayError::HandlerNotSet { .. }));
    service.dispose();
}

#[test]
fn connect_to_unbound_address_fails_the_future() {
    let ctx = ManagementContext::new("gw", 10).unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let service = memory_service("client", &ctx, &transport);
    service.set_handler(Arc::new(Silent));

    let future = service.connect(addr(5)).unwrap();
    assert!(matches!(future.state(), ConnectState::Failed(_)));
    assert!(future.try_result().unwrap().is_err());
    assert!(!future.cancel());
    service.dispose();
}

#[test]
fn connected_sessions_talk_to_accepted_ones() {
    let ctx = ManagementContext::new("gw", 10).unwrap();
    let transport = Arc::new(MemoryTransport::new());

    let server = memory_service("server", &ctx, &transport);
    server.set_handler(Arc::new(Echo));
    let bound = server.bind(addr(0)).unwrap();

    let client = memory_service("client", &ctx, &transport);
    client.set_handler(Arc::new(Silent));

    let future = client.connect(bound).unwrap();
    let session = future.try_result().expect("memory connect settles inline").unwrap();
    assert_eq!(session.remote_addr(), bound);
    assert_eq!(client.managed_count(), 1);
    assert_eq!(server.managed_count(), 1);

    session.write(Bytes::from_static(b"ping"));
    wait_until("echo round trip", || {
        settle(client.pool());
        settle(server.pool());
        ctx.service_bean("client")
            .is_some_and(|bean| bean.summary().bytes_read == 4)
    });

    let summary = ctx.service_bean("client").unwrap().summary();
    assert_eq!(summary.bytes_written, 4);
    assert_eq!(ctx.gateway_bean().summary().current_sessions, 2);

    // settled futures ignore cancel
    assert!(!future.cancel());
    assert!(!session.is_closed());

    client.dispose();
    server.dispose();
    assert_eq!(ctx.gateway_bean().summary().current_sessions, 0);
}

/// Wraps the memory transport and holds connect completions until released.
#[derive(Default)]
struct DeferredTransport {
    inner: MemoryTransport,
    parked: Mutex<Vec<(SocketAddr, ConnectCallback)>>,
}

impl DeferredTransport {
    fn release(&self) {
        let parked: Vec<_> = self.parked.lock().drain(..).collect();
        for (addr, done) in parked {
            self.inner.connect(addr, done);
        }
    }
}

impl Transport for DeferredTransport {
    fn name(&self) -> &'static str {
        "deferred"
    }

    fn bind(&self, addr: SocketAddr, acceptor: Acceptor) -> io::Result<SocketAddr> {
        self.inner.bind(addr, acceptor)
    }

    fn unbind(&self, addr: SocketAddr) -> io::Result<()> {
        self.inner.unbind(addr)
    }

    fn connect(&self, addr: SocketAddr, done: ConnectCallback) {
        self.parked.lock().push((addr, done));
    }
}

#[test]
fn canceling_a_pending_connect_never_publishes_the_session() {
    let ctx = ManagementContext::new("gw", 10).unwrap();
    let transport = Arc::new(DeferredTransport::default());
    let pool = Arc::new(WorkerPool::new("cancel", 2).unwrap());

    let server = Service::with_pool(
        ServiceConfig::new("server"),
        transport.clone(),
        ctx.clone(),
        pool.clone(),
    )
    .unwrap();
    server.set_handler(Arc::new(Silent));
    let bound = server.bind(addr(0)).unwrap();

    let client = Service::with_pool(
        ServiceConfig::new("client"),
        transport.clone(),
        ctx.clone(),
        pool.clone(),
    )
    .unwrap();
    client.set_handler(Arc::new(Silent));

    let future = client.connect(bound).unwrap();
    assert!(!future.is_done());
    assert!(future.cancel());
    assert!(matches!(future.state(), ConnectState::Canceled));

    transport.release();
    settle(&pool);

    assert_eq!(client.managed_count(), 0);
    assert!(matches!(future.state(), ConnectState::Canceled));
    assert!(matches!(
        future.try_result(),
        Some(Err(GatewayError::ConnectCanceled { .. }))
    ));

    // the far end saw the connection and then lost it
    wait_until("server side closes", || {
        settle(&pool);
        server.managed_count() == 0
    });

    client.dispose();
    server.dispose();
    pool.shutdown();
}

#[tokio::test]
async fn awaiting_a_connect_yields_the_session() {
    let ctx = ManagementContext::new("gw", 10).unwrap();
    let transport = Arc::new(DeferredTransport::default());
    let pool = Arc::new(WorkerPool::new("await", 1).unwrap());

    let server = Service::with_pool(
        ServiceConfig::new("server"),
        transport.clone(),
        ctx.clone(),
        pool.clone(),
    )
    .unwrap();
    server.set_handler(Arc::new(Silent));
    let bound = server.bind(addr(0)).unwrap();

    let client = Service::with_pool(
        ServiceConfig::new("client"),
        transport.clone(),
        ctx.clone(),
        pool.clone(),
    )
    .unwrap();
    client.set_handler(Arc::new(Silent));

    let future = client.connect(bound).unwrap();
    let waiting = {
        let future = future.clone();
        tokio::spawn(async move { future.wait().await })
    };

    transport.release();
    let session = waiting.await.unwrap().unwrap();
    assert_eq!(session.service(), "client");
    assert!(future.is_done());

    tokio::task::spawn_blocking(move || {
        client.dispose();
        server.dispose();
        pool.shutdown();
    })
    .await
    .unwrap();
}
