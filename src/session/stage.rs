use std::collections::VecDeque;

use bytes::Bytes;

use super::{event::SessionEvent, session::Session};

// -----------------------------------------------------------------------------
// ----- Stage -----------------------------------------------------------------

/// One step of a session pipeline.
///
/// Stages get a plain `&Session` and cannot re-enter the pipeline; anything
/// they want written goes through [`StageContext::emit`] and is queued once
/// the pipeline lock is released.
pub trait Stage: Send + 'static {
    fn name(&self) -> &'static str;

    /// Inbound events, in stage order.
    fn on_event(&mut self, _ctx: &mut StageContext<'_>, _event: &SessionEvent) {}

    /// Outbound writes, in reverse stage order. Returning `None` swallows the
    /// message (the stage may emit it later).
    fn on_write(&mut self, _ctx: &mut StageContext<'_>, message: Bytes) -> Option<Bytes> {
        Some(message)
    }
}

// -----------------------------------------------------------------------------
// ----- StageContext ----------------------------------------------------------

pub struct StageContext<'a> {
    session: &'a Session,
    emitted: Vec<Bytes>,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(session: &'a Session) -> Self {
        Self {
            session,
            emitted: Vec::new(),
        }
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    /// Queue `message` for writing after the current pipeline pass.
    pub fn emit(&mut self, message: Bytes) {
        self.emitted.push(message);
    }

    pub(crate) fn into_emitted(self) -> Vec<Bytes> {
        self.emitted
    }
}

// -----------------------------------------------------------------------------
// ----- WriteBufferStage ------------------------------------------------------

/// Holds outbound messages while the session is not registered with its
/// processor and releases them, in order, on the `Registered` sentinel.
#[derive(Debug, Default)]
pub struct WriteBufferStage {
    held: VecDeque<Bytes>,
    held_bytes: usize,
}

impl WriteBufferStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn held_bytes(&self) -> usize {
        self.held_bytes
    }
}

impl Stage for WriteBufferStage {
    fn name(&self) -> &'static str {
        "write_buffer"
    }

    fn on_event(&mut self, ctx: &mut StageContext<'_>, event: &SessionEvent) {
        if !matches!(event, SessionEvent::Registered) {
            return;
        }

        self.held_bytes = 0;
        for message in self.held.drain(..) {
            ctx.emit(message);
        }
    }

    fn on_write(&mut self, ctx: &mut StageContext<'_>, message: Bytes) -> Option<Bytes> {
        if ctx.session().is_registered() && self.held.is_empty() {
            return Some(message);
        }

        self.held_bytes += message.len();
        self.held.push_back(message);
        None
    }
}
