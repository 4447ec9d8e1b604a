//! In-process transport. Channels come in connected pairs; whatever one end
//! flushes is delivered to the other end's session, or parked in its inbox
//! while that end is unregistered, paused, or not attached to a session.

use std::{
    collections::VecDeque,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::{Acceptor, Channel, ConnectCallback, Transport};
use crate::session::Session;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const FIRST_EPHEMERAL_PORT: u16 = 40_000;

// -----------------------------------------------------------------------------
// ----- MemoryTransport -------------------------------------------------------

#[derive(Default)]
pub struct MemoryTransport {
    listeners: DashMap<SocketAddr, Acceptor>,
    next_port: AtomicU16,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self, addr: SocketAddr) -> bool {
        self.listeners.contains_key(&addr)
    }

    /// Open a connection to a bound address from outside the gateway. The
    /// returned end is not attached to any session; read what the gateway
    /// sends with [`MemoryChannel::take_received`].
    pub fn dial(&self, addr: SocketAddr) -> io::Result<Arc<MemoryChannel>> {
        let acceptor = self
            .listeners
            .get(&addr)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "not bound"))?;

        let client_addr = self.ephemeral_addr();
        let (client, server) = MemoryChannel::pair(client_addr, addr);
        acceptor(server);
        Ok(client)
    }

    fn ephemeral_addr(&self) -> SocketAddr {
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed);
        SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            FIRST_EPHEMERAL_PORT.wrapping_add(offset),
        )
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn bind(&self, addr: SocketAddr, acceptor: Acceptor) -> io::Result<SocketAddr> {
        let addr = if addr.port() == 0 {
            SocketAddr::new(addr.ip(), self.ephemeral_addr().port())
        } else {
            addr
        };

        match self.listeners.entry(addr) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already bound"),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(acceptor);
                Ok(addr)
            }
        }
    }

    fn unbind(&self, addr: SocketAddr) -> io::Result<()> {
        self.listeners
            .remove(&addr)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{addr} not bound")))
    }

    fn connect(&self, addr: SocketAddr, done: ConnectCallback) {
        let Some(acceptor) = self.listeners.get(&addr).map(|e| e.value().clone()) else {
            done(Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{addr} not bound"),
            )));
            return;
        };

        let (client, server) = MemoryChannel::pair(self.ephemeral_addr(), addr);
        acceptor(server);
        done(Ok(client));
    }
}

// -----------------------------------------------------------------------------
// ----- MemoryChannel ---------------------------------------------------------

pub struct MemoryChannel {
    local: SocketAddr,
    remote: SocketAddr,
    peer: Mutex<Weak<MemoryChannel>>,
    session: Mutex<Option<Weak<Session>>>,
    inbox: Mutex<VecDeque<Bytes>>,
    written: Mutex<Vec<Bytes>>,
    registered: AtomicBool,
    readable: AtomicBool,
    closed: AtomicBool,
    registrations: AtomicUsize,
    deregistrations: AtomicUsize,
}

// -----------------------------------------------------------------------------
// ----- MemoryChannel: Static -------------------------------------------------

impl MemoryChannel {
    /// Two connected ends: `(a, b)` where `a` lives at `a_addr`.
    pub fn pair(a_addr: SocketAddr, b_addr: SocketAddr) -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::new(a_addr, b_addr));
        let b = Arc::new(Self::new(b_addr, a_addr));
        *a.peer.lock() = Arc::downgrade(&b);
        *b.peer.lock() = Arc::downgrade(&a);
        (a, b)
    }

    fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            local,
            remote,
            peer: Mutex::new(Weak::new()),
            session: Mutex::new(None),
            inbox: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            registered: AtomicBool::new(false),
            readable: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            registrations: AtomicUsize::new(0),
            deregistrations: AtomicUsize::new(0),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- MemoryChannel: Public -------------------------------------------------

impl MemoryChannel {
    /// Push `message` to the other end, as if this end had flushed it.
    pub fn send(&self, message: Bytes) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.deliver(message);
        }
        Ok(())
    }

    /// Drain what arrived while nothing consumed it.
    pub fn take_received(&self) -> Vec<Bytes> {
        self.inbox.lock().drain(..).collect()
    }

    /// Everything flushed through this end so far.
    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().clone()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn is_readable(&self) -> bool {
        self.readable.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::Acquire)
    }

    pub fn deregistrations(&self) -> usize {
        self.deregistrations.load(Ordering::Acquire)
    }
}

// -----------------------------------------------------------------------------
// ----- MemoryChannel: Private ------------------------------------------------

impl MemoryChannel {
    fn attached_session(&self) -> Option<Arc<Session>> {
        self.session.lock().as_ref().and_then(Weak::upgrade)
    }

    fn deliver(&self, message: Bytes) {
        let consumer = if self.registered.load(Ordering::Acquire)
            && self.readable.load(Ordering::Acquire)
        {
            self.attached_session()
        } else {
            None
        };

        match consumer {
            Some(session) => session.dispatch_received(message),
            None => self.inbox.lock().push_back(message),
        }
    }

    fn drain_backlog(&self) {
        let Some(session) = self.attached_session() else {
            return;
        };
        let backlog: Vec<Bytes> = self.inbox.lock().drain(..).collect();
        for message in backlog {
            session.dispatch_received(message);
        }
    }

    fn peer_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(session) = self.attached_session() {
            session.closed_by_peer();
        }
    }
}

// -----------------------------------------------------------------------------
// ----- MemoryChannel: Channel ------------------------------------------------

impl Channel for MemoryChannel {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn register(&self, session: Arc<Session>) {
        trace!("memory channel {} registered", self.local);
        *self.session.lock() = Some(Arc::downgrade(&session));
        self.registered.store(true, Ordering::Release);
        self.registrations.fetch_add(1, Ordering::AcqRel);

        if self.is_readable() {
            self.drain_backlog();
        }

        // the peer hung up before anyone was listening
        if self.is_closed() {
            session.closed_by_peer();
        }
    }

    fn unregister(&self) {
        self.registered.store(false, Ordering::Release);
        self.deregistrations.fetch_add(1, Ordering::AcqRel);
    }

    fn flush(&self, batch: Vec<Bytes>) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }

        let peer = self.peer.lock().upgrade();
        for message in batch {
            self.written.lock().push(message.clone());
            if let Some(peer) = peer.as_ref() {
                peer.deliver(message);
            }
        }
        Ok(())
    }

    fn set_readable(&self, readable: bool) {
        self.readable.store(readable, Ordering::Release);
        if readable && self.is_registered() {
            self.drain_backlog();
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registered.store(false, Ordering::Release);
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.peer_closed();
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn unattached_end_collects_what_the_peer_flushes() {
        let (a, b) = MemoryChannel::pair(addr(1), addr(2));
        a.flush(vec![Bytes::from_static(b"hi"), Bytes::from_static(b"there")])
            .unwrap();

        assert_eq!(b.take_received(), vec![&b"hi"[..], &b"there"[..]]);
        assert_eq!(a.written().len(), 2);
    }

    #[test]
    fn bind_rejects_duplicates_and_assigns_ephemeral_ports() {
        let transport = MemoryTransport::new();
        let acceptor: Acceptor = Arc::new(|_| {});

        transport.bind(addr(7000), acceptor.clone()).unwrap();
        let err = transport.bind(addr(7000), acceptor.clone()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        let ephemeral = transport.bind(addr(0), acceptor).unwrap();
        assert_ne!(ephemeral.port(), 0);
    }

    #[test]
    fn dial_unbound_address_is_refused() {
        let transport = MemoryTransport::new();
        let err = transport.dial(addr(9)).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn closing_one_end_closes_the_other() {
        let (a, b) = MemoryChannel::pair(addr(1), addr(2));
        a.close();
        assert!(b.is_closed());
        assert!(b.flush(vec![Bytes::from_static(b"x")]).is_err());
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
