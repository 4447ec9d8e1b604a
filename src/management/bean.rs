use std::{
    fmt,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use arc_swap::ArcSwap;
use tracing::error;

use super::{
    listener::{ManagementEvent, ManagementEventKind, ManagementListener},
    notifier::NotificationExecutor,
    stats::{StatTable, Stats},
};
use crate::{errors::GatewayError, session::SessionId, worker::panic_message};

// -----------------------------------------------------------------------------
// ----- BeanKind --------------------------------------------------------------

/// Per-kind summary layout. The same aggregation machinery serves every
/// kind; only the exported field list differs.
pub trait BeanKind: Send + Sync + 'static {
    const KIND: &'static str;
    const SUMMARY_FIELDS: &'static [&'static str];

    /// Values in `SUMMARY_FIELDS` order.
    fn project(stats: &Stats) -> Vec<i64>;
}

const ENTITY_FIELDS: &[&str] = &[
    "current_sessions",
    "total_sessions",
    "bytes_read",
    "bytes_written",
    "exceptions",
];

fn project_entity(s: &Stats) -> Vec<i64> {
    vec![
        s.current_sessions,
        s.total_sessions,
        s.bytes_read,
        s.bytes_written,
        s.exceptions,
    ]
}

pub struct GatewayKind;

impl BeanKind for GatewayKind {
    const KIND: &'static str = "gateway";
    const SUMMARY_FIELDS: &'static [&'static str] = ENTITY_FIELDS;

    fn project(stats: &Stats) -> Vec<i64> {
        project_entity(stats)
    }
}

pub struct ServiceKind;

impl BeanKind for ServiceKind {
    const KIND: &'static str = "service";
    const SUMMARY_FIELDS: &'static [&'static str] = ENTITY_FIELDS;

    fn project(stats: &Stats) -> Vec<i64> {
        project_entity(stats)
    }
}

pub struct SessionKind;

impl BeanKind for SessionKind {
    const KIND: &'static str = "session";
    const SUMMARY_FIELDS: &'static [&'static str] = &[
        "bytes_read",
        "bytes_written",
        "messages_read",
        "messages_written",
        "exceptions",
    ];

    fn project(s: &Stats) -> Vec<i64> {
        vec![
            s.bytes_read,
            s.bytes_written,
            s.messages_read,
            s.messages_written,
            s.exceptions,
        ]
    }
}

pub type GatewayBean = ManagementBean<GatewayKind>;
pub type ServiceBean = ManagementBean<ServiceKind>;
pub type SessionBean = ManagementBean<SessionKind>;

// -----------------------------------------------------------------------------
// ----- ManagementBean --------------------------------------------------------

pub struct ManagementBean<K: BeanKind> {
    name: Arc<str>,
    stats: StatTable,
    listeners: ArcSwap<Vec<Arc<dyn ManagementListener>>>,
    notifier: NotificationExecutor,
    initialized: AtomicBool,
    _kind: PhantomData<fn() -> K>,
}

// -----------------------------------------------------------------------------
// ----- ManagementBean: Static ------------------------------------------------

impl<K: BeanKind> ManagementBean<K> {
    pub fn new(name: impl Into<Arc<str>>, notifier: NotificationExecutor) -> Self {
        Self {
            name: name.into(),
            stats: StatTable::new(),
            listeners: ArcSwap::from_pointee(Vec::new()),
            notifier,
            initialized: AtomicBool::new(false),
            _kind: PhantomData,
        }
    }

    pub fn summary_fields() -> &'static [&'static str] {
        K::SUMMARY_FIELDS
    }
}

// -----------------------------------------------------------------------------
// ----- ManagementBean: Public ------------------------------------------------

impl<K: BeanKind> ManagementBean<K> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        K::KIND
    }

    /// Mark the bean as bound to its entity. A second call is a bug in the
    /// caller and fails.
    pub fn init(&self) -> Result<(), GatewayError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(GatewayError::BeanAlreadyInitialized {
                name: format!("{}:{}", K::KIND, self.name),
            });
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Cheap and synchronous: lands in the calling thread's slot.
    pub fn record(&self, delta: &Stats) {
        self.stats.record(delta);
    }

    pub fn summary(&self) -> Stats {
        self.stats.summary()
    }

    pub fn summary_values(&self) -> Vec<i64> {
        K::project(&self.summary())
    }

    pub fn add_listener(&self, listener: Arc<dyn ManagementListener>) {
        self.listeners.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(listener.clone());
            next
        });
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ManagementListener>) -> bool {
        let mut removed = false;
        self.listeners.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|l| !Arc::ptr_eq(l, listener))
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.load().len()
    }

    /// Queue delivery of `kind` to the current listener snapshot.
    pub fn notify(&self, session: Option<SessionId>, kind: ManagementEventKind) {
        let listeners = self.listeners.load_full();
        if listeners.is_empty() {
            return;
        }

        let event = ManagementEvent {
            entity_kind: K::KIND,
            entity: self.name.clone(),
            session,
            kind,
        };

        self.notifier.submit(move || deliver(&listeners, &event));
    }
}

impl<K: BeanKind> fmt::Debug for ManagementBean<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementBean")
            .field("kind", &K::KIND)
            .field("name", &self.name)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn deliver(listeners: &[Arc<dyn ManagementListener>], event: &ManagementEvent) {
    for (index, listener) in listeners.iter().enumerate() {
        match panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                "{} '{}' listener #{index} failed on {:?}: {e}",
                event.entity_kind, event.entity, event.kind
            ),
            Err(payload) => error!(
                "{} '{}' listener #{index} panicked on {:?}: {}",
                event.entity_kind,
                event.entity,
                event.kind,
                panic_message(&*payload)
            ),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
