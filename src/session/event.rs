use std::sync::Arc;

use bytes::Bytes;

use super::session::Session;

// -----------------------------------------------------------------------------
// ----- SessionEvent ----------------------------------------------------------

/// Everything that travels through a session's pipeline. For aligned
/// sessions every event is fired on the owning worker thread.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Synthetic sentinel fired right after the session is (re)registered
    /// with its processor. Never reaches the handler.
    Registered,
    Created,
    MessageReceived(Bytes),
    MessageSent(Bytes),
    ExceptionCaught(Arc<str>),
    Closed,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Registered => "registered",
            SessionEvent::Created => "created",
            SessionEvent::MessageReceived(_) => "message_received",
            SessionEvent::MessageSent(_) => "message_sent",
            SessionEvent::ExceptionCaught(_) => "exception_caught",
            SessionEvent::Closed => "closed",
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SessionHandler --------------------------------------------------------

/// Application callbacks at the tail of every pipeline. Handlers run with no
/// pipeline lock held, so they may write to or close the session.
pub trait SessionHandler: Send + Sync + 'static {
    fn session_created(&self, _session: &Arc<Session>) {}

    fn message_received(&self, _session: &Arc<Session>, _message: &Bytes) {}

    fn message_sent(&self, _session: &Arc<Session>, _message: &Bytes) {}

    fn exception_caught(&self, _session: &Arc<Session>, _error: &str) {}

    fn session_closed(&self, _session: &Arc<Session>) {}
}

pub(crate) fn dispatch_to_handler(
    handler: &dyn SessionHandler,
    session: &Arc<Session>,
    event: &SessionEvent,
) {
    match event {
        SessionEvent::Registered => {}
        SessionEvent::Created => handler.session_created(session),
        SessionEvent::MessageReceived(m) => handler.message_received(session, m),
        SessionEvent::MessageSent(m) => handler.message_sent(session, m),
        SessionEvent::ExceptionCaught(e) => handler.exception_caught(session, e),
        SessionEvent::Closed => handler.session_closed(session),
    }
}
