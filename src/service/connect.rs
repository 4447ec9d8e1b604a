use std::{fmt, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{errors::GatewayError, session::Session};

// -----------------------------------------------------------------------------
// ----- ConnectState ----------------------------------------------------------

#[derive(Clone)]
pub enum ConnectState {
    Pending,
    Connected(Arc<Session>),
    Failed(String),
    Canceled,
}

impl ConnectState {
    pub fn is_pending(&self) -> bool {
        matches!(self, ConnectState::Pending)
    }
}

impl fmt::Debug for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectState::Pending => f.write_str("Pending"),
            ConnectState::Connected(s) => write!(f, "Connected({})", s.id()),
            ConnectState::Failed(reason) => write!(f, "Failed({reason})"),
            ConnectState::Canceled => f.write_str("Canceled"),
        }
    }
}

type CancelHook = Box<dyn FnOnce() + Send>;

// -----------------------------------------------------------------------------
// ----- ConnectFuture ---------------------------------------------------------

/// Outcome of `Service::connect`. Settles exactly once; whichever of
/// complete, fail or cancel gets there first wins.
#[derive(Clone)]
pub struct ConnectFuture {
    inner: Arc<Inner>,
}

struct Inner {
    addr: SocketAddr,
    state: watch::Sender<ConnectState>,
    cancel_hook: Mutex<Option<CancelHook>>,
}

// -----------------------------------------------------------------------------
// ----- ConnectFuture: Public -------------------------------------------------

impl ConnectFuture {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        let (state, _) = watch::channel(ConnectState::Pending);
        Self {
            inner: Arc::new(Inner {
                addr,
                state,
                cancel_hook: Mutex::new(None),
            }),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn state(&self) -> ConnectState {
        self.inner.state.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        !self.inner.state.borrow().is_pending()
    }

    /// Cancel a pending connect. If the session already exists it is closed.
    /// Returns false when the connect had already settled.
    pub fn cancel(&self) -> bool {
        let canceled = self.settle(ConnectState::Canceled);
        if canceled {
            let hook = self.inner.cancel_hook.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }
        canceled
    }

    pub async fn wait(&self) -> Result<Arc<Session>, GatewayError> {
        let addr = self.inner.addr;
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| !s.is_pending())
            .await
            .map_err(|_| GatewayError::ConnectCanceled { addr })?
            .clone();
        into_result(addr, state)
    }

    /// Non-blocking view of the outcome; `None` while pending.
    pub fn try_result(&self) -> Option<Result<Arc<Session>, GatewayError>> {
        let state = self.state();
        if state.is_pending() {
            return None;
        }
        Some(into_result(self.inner.addr, state))
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectFuture: Crate --------------------------------------------------

impl ConnectFuture {
    /// Install what cancel must undo. Returns false if the connect was
    /// already canceled, in which case the caller cleans up itself.
    pub(crate) fn set_cancel_hook<F>(&self, hook: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.inner.cancel_hook.lock();
        if !self.inner.state.borrow().is_pending() {
            return false;
        }
        *slot = Some(Box::new(hook));
        true
    }

    pub(crate) fn complete(&self, session: Arc<Session>) -> bool {
        let done = self.settle(ConnectState::Connected(session));
        if done {
            self.inner.cancel_hook.lock().take();
        }
        done
    }

    pub(crate) fn fail(&self, reason: impl Into<String>) -> bool {
        self.settle(ConnectState::Failed(reason.into()))
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectFuture: Private ------------------------------------------------

impl ConnectFuture {
    fn settle(&self, next: ConnectState) -> bool {
        self.inner.state.send_if_modified(|state| {
            if !state.is_pending() {
                return false;
            }
            *state = next;
            true
        })
    }
}

impl fmt::Debug for ConnectFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectFuture")
            .field("addr", &self.inner.addr)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

fn into_result(addr: SocketAddr, state: ConnectState) -> Result<Arc<Session>, GatewayError> {
    match state {
        ConnectState::Connected(session) => Ok(session),
        ConnectState::Failed(reason) => Err(GatewayError::ConnectFailed { addr, reason }),
        ConnectState::Canceled | ConnectState::Pending => {
            Err(GatewayError::ConnectCanceled { addr })
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
