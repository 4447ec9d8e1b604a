use std::sync::Arc;

use super::{
    bean::ServiceBean, context::ManagementContext, listener::ManagementEventKind, stats::Stats,
};
use crate::session::{SessionEvent, SessionId, Stage, StageContext, StageFactory};

// -----------------------------------------------------------------------------
// ----- ManagementStage -------------------------------------------------------

/// First stage of every managed pipeline. Turns session events into bean
/// updates, doing as much work as the active bundle asks for.
///
/// Runs on the session's owner thread, so each bean update lands in that
/// thread's stat slot.
pub struct ManagementStage {
    ctx: Arc<ManagementContext>,
    service: Arc<ServiceBean>,
    management: bool,
}

impl ManagementStage {
    pub fn new(ctx: Arc<ManagementContext>, service: Arc<ServiceBean>, management: bool) -> Self {
        Self {
            ctx,
            service,
            management,
        }
    }

    /// A factory that gives each new pipeline its own stage instance.
    pub fn factory(
        ctx: Arc<ManagementContext>,
        service: Arc<ServiceBean>,
        management: bool,
    ) -> StageFactory {
        Arc::new(move |_: SessionId| {
            let stage = ManagementStage::new(ctx.clone(), service.clone(), management);
            Box::new(stage) as Box<dyn Stage>
        })
    }

    fn session_opened(&self) {
        if self.management {
            self.ctx.increment_management();
        } else {
            self.ctx.increment_overall();
        }
    }

    fn session_closed(&self) {
        if self.management {
            self.ctx.decrement_management();
        } else {
            self.ctx.decrement_overall();
        }
    }
}

impl Stage for ManagementStage {
    fn name(&self) -> &'static str {
        "management"
    }

    fn on_event(&mut self, ctx: &mut StageContext<'_>, event: &SessionEvent) {
        let (delta, kind) = match event {
            SessionEvent::Registered => return,
            SessionEvent::Created => {
                // counters first, so this event already sees its own effect
                self.session_opened();
                (Stats::session_opened(), ManagementEventKind::SessionCreated)
            }
            SessionEvent::MessageReceived(m) => (
                Stats::received(m.len()),
                ManagementEventKind::MessageReceived { bytes: m.len() },
            ),
            SessionEvent::MessageSent(m) => (
                Stats::sent(m.len()),
                ManagementEventKind::MessageSent { bytes: m.len() },
            ),
            SessionEvent::ExceptionCaught(e) => (
                Stats::exception(),
                ManagementEventKind::ExceptionCaught { error: e.clone() },
            ),
            SessionEvent::Closed => {
                self.session_closed();
                (Stats::session_closed(), ManagementEventKind::SessionClosed)
            }
        };

        let session = ctx.session();
        let id = session.id();

        // one load per event; the bundle may change between events
        let bundle = self.ctx.active_bundle();

        let session_bean = if bundle.filter().creates_session_beans() {
            Some(self.ctx.session_bean(id, session.service()))
        } else {
            self.ctx.find_session_bean(id)
        };

        bundle
            .gateway()
            .apply(self.ctx.gateway_bean(), &delta, Some(id), &kind);
        bundle.service().apply(&self.service, &delta, Some(id), &kind);
        if let Some(bean) = &session_bean {
            bundle.session().apply(bean, &delta, Some(id), &kind);
        }

        if matches!(event, SessionEvent::Closed) {
            self.ctx.remove_session_bean(id);
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
