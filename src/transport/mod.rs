//! Interface boundary to concrete transports. The gateway core only ever
//! talks to a transport through these traits; framing and codecs live
//! behind them.

pub mod memory;
pub mod tcp;

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;

use crate::session::Session;

pub use memory::{MemoryChannel, MemoryTransport};
pub use tcp::{TcpChannel, TcpTransport};

// -----------------------------------------------------------------------------
// ----- Callbacks -------------------------------------------------------------

/// Invoked by a transport for every accepted connection on a bound address.
pub type Acceptor = Arc<dyn Fn(Arc<dyn Channel>) + Send + Sync>;

/// Completion of an outbound connect.
pub type ConnectCallback = Box<dyn FnOnce(std::io::Result<Arc<dyn Channel>>) + Send>;

// -----------------------------------------------------------------------------
// ----- Channel ---------------------------------------------------------------

/// One established connection as seen by the processor layer.
///
/// `register`, `unregister`, `flush` and `set_readable` are only ever
/// invoked through the session's affinity controller, so for aligned
/// sessions they arrive on the owning worker thread.
pub trait Channel: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// Start delivering inbound data and close notifications to `session`.
    fn register(&self, session: Arc<Session>);

    /// Stop delivering inbound events. The connection stays open.
    fn unregister(&self);

    /// Hand a batch of outbound buffers to the connection, in order.
    fn flush(&self, batch: Vec<Bytes>) -> std::io::Result<()>;

    /// Pause (`false`) or resume (`true`) inbound delivery.
    fn set_readable(&self, readable: bool);

    fn close(&self);
}

// -----------------------------------------------------------------------------
// ----- Transport -------------------------------------------------------------

pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Start accepting on `addr`. Returns the address actually bound, which
    /// differs from `addr` when an ephemeral port was requested.
    fn bind(&self, addr: SocketAddr, acceptor: Acceptor) -> std::io::Result<SocketAddr>;

    fn unbind(&self, addr: SocketAddr) -> std::io::Result<()>;

    /// Open a connection to `addr`; `done` runs exactly once, on whatever
    /// thread the transport completes on.
    fn connect(&self, addr: SocketAddr, done: ConnectCallback);
}
