use std::fmt;

use super::{
    bean::{BeanKind, ManagementBean},
    listener::ManagementEventKind,
    stats::Stats,
};
use crate::session::SessionId;

// -----------------------------------------------------------------------------
// ----- BundleKind ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleKind {
    /// Counters only; nobody is watching or load is too high.
    CollectOnly,
    /// Counters plus listener notifications.
    Full,
}

impl fmt::Display for BundleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleKind::CollectOnly => f.write_str("collect-only"),
            BundleKind::Full => f.write_str("full"),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- FilterStrategy --------------------------------------------------------

/// Behaviour of the management stage itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStrategy {
    /// Only record into beans that already exist.
    CollectOnly,
    /// Create session beans on demand.
    Full,
}

impl FilterStrategy {
    pub fn creates_session_beans(self) -> bool {
        matches!(self, FilterStrategy::Full)
    }
}

// -----------------------------------------------------------------------------
// ----- EntityStrategy --------------------------------------------------------

/// How much work one gateway, service or session event triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStrategy {
    CollectOnly,
    Full,
}

impl EntityStrategy {
    pub fn notifies(self) -> bool {
        matches!(self, EntityStrategy::Full)
    }

    /// Record `delta` on the calling thread and, under `Full`, queue a
    /// notification for the bean's listeners.
    pub fn apply<K: BeanKind>(
        self,
        bean: &ManagementBean<K>,
        delta: &Stats,
        session: Option<SessionId>,
        event: &ManagementEventKind,
    ) {
        bean.record(delta);
        if self.notifies() {
            bean.notify(session, event.clone());
        }
    }
}

// -----------------------------------------------------------------------------
// ----- StrategyBundle --------------------------------------------------------

/// The four strategies, always swapped together. Only the two constants
/// below ever exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyBundle {
    kind: BundleKind,
    filter: FilterStrategy,
    gateway: EntityStrategy,
    service: EntityStrategy,
    session: EntityStrategy,
}

impl StrategyBundle {
    // The filter stays full in both bundles so session beans keep being
    // created and are there when load drops again.
    pub const COLLECT_ONLY: StrategyBundle = StrategyBundle {
        kind: BundleKind::CollectOnly,
        filter: FilterStrategy::Full,
        gateway: EntityStrategy::CollectOnly,
        service: EntityStrategy::CollectOnly,
        session: EntityStrategy::CollectOnly,
    };

    pub const FULL: StrategyBundle = StrategyBundle {
        kind: BundleKind::Full,
        filter: FilterStrategy::Full,
        gateway: EntityStrategy::Full,
        service: EntityStrategy::Full,
        session: EntityStrategy::Full,
    };

    pub fn kind(&self) -> BundleKind {
        self.kind
    }

    pub fn filter(&self) -> FilterStrategy {
        self.filter
    }

    pub fn gateway(&self) -> EntityStrategy {
        self.gateway
    }

    pub fn service(&self) -> EntityStrategy {
        self.service
    }

    pub fn session(&self) -> EntityStrategy {
        self.session
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
