use std::{sync::Arc, thread};

use bytes::Bytes;

use super::session::Session;
use crate::transport::Channel;

// -----------------------------------------------------------------------------
// ----- AffinityController ----------------------------------------------------

/// Gatekeeper for the four operations that change a session's registration
/// with its processor. When the session is aligned, each one must be called
/// from the session's current owner thread; anything else is a bug and
/// panics. Callers on a foreign thread re-submit the whole operation to the
/// owner's executor instead of coming here.
pub struct AffinityController {
    channel: Arc<dyn Channel>,
}

// -----------------------------------------------------------------------------
// ----- AffinityController: Static --------------------------------------------

impl AffinityController {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }
}

// -----------------------------------------------------------------------------
// ----- AffinityController: Public --------------------------------------------

impl AffinityController {
    pub fn register(&self, session: &Arc<Session>) {
        self.assert_owner(session, "register");
        self.channel.register(session.clone());
    }

    pub fn unregister(&self, session: &Session) {
        self.assert_owner(session, "unregister");
        self.channel.unregister();
    }

    pub fn flush(&self, session: &Session, batch: Vec<Bytes>) -> std::io::Result<()> {
        self.assert_owner(session, "flush");
        self.channel.flush(batch)
    }

    pub fn update_flow_control(&self, session: &Session, readable: bool) {
        self.assert_owner(session, "update_flow_control");
        self.channel.set_readable(readable);
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }
}

// -----------------------------------------------------------------------------
// ----- AffinityController: Private -------------------------------------------

impl AffinityController {
    fn assert_owner(&self, session: &Session, operation: &'static str) {
        if !session.is_aligned() {
            return;
        }

        let Some(owner) = session.owner() else {
            // No owner yet: the session is still being set up.
            return;
        };

        assert!(
            owner.is_current(),
            "affinity violation: {operation} on session {} from thread {:?}; owner is worker {}",
            session.id(),
            thread::current().name().unwrap_or("<unnamed>"),
            owner.id(),
        );
    }
}
