use std::sync::Arc;

use super::strategy::BundleKind;
use crate::{errors::ListenerResult, session::SessionId};

// -----------------------------------------------------------------------------
// ----- ManagementEvent -------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementEventKind {
    SessionCreated,
    SessionClosed,
    MessageReceived { bytes: usize },
    MessageSent { bytes: usize },
    ExceptionCaught { error: Arc<str> },
}

/// What a bean hands to its listeners, after the fact and off the data path.
#[derive(Debug, Clone)]
pub struct ManagementEvent {
    /// `gateway`, `service` or `session`.
    pub entity_kind: &'static str,
    pub entity: Arc<str>,
    pub session: Option<SessionId>,
    pub kind: ManagementEventKind,
}

// -----------------------------------------------------------------------------
// ----- Listeners -------------------------------------------------------------

/// Registered on a bean. Runs on the notification executor; a slow listener
/// delays other notifications but never the session that caused them.
pub trait ManagementListener: Send + Sync + 'static {
    fn on_event(&self, event: &ManagementEvent) -> ListenerResult;
}

/// Told synchronously, on the thread that caused the switch, whenever the
/// active bundle changes. Must not block.
pub trait StrategyChangeListener: Send + Sync + 'static {
    fn strategy_changed(&self, previous: BundleKind, current: BundleKind);
}
