use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tracing::{debug, error, info};

use super::{
    bean::{GatewayBean, ServiceBean, SessionBean},
    listener::StrategyChangeListener,
    notifier::NotificationExecutor,
    strategy::{BundleKind, EntityStrategy, FilterStrategy, StrategyBundle},
};
use crate::{errors::GatewayError, session::SessionId, worker::panic_message};

// -----------------------------------------------------------------------------
// ----- ManagementContext -----------------------------------------------------

/// Process-scoped management state. Built once by the gateway and handed to
/// every service; there is no global instance.
///
/// Decision rule: the `Full` bundle is active iff at least one management
/// session is open (`M > 0`) and the overall session count is at or below
/// the threshold (`O <= T`). M and O are independent atomics read without a
/// combined transaction, so the active bundle can briefly lag the true
/// pair. Every counter change re-evaluates, which corrects it.
pub struct ManagementContext {
    management_sessions: AtomicI64,
    overall_sessions: AtomicI64,
    threshold: AtomicI64,

    active: ArcSwap<StrategyBundle>,
    collect_only: Arc<StrategyBundle>,
    full: Arc<StrategyBundle>,
    strategy_listeners: ArcSwap<Vec<Arc<dyn StrategyChangeListener>>>,

    notifier: NotificationExecutor,
    gateway: Arc<GatewayBean>,
    services: DashMap<String, Arc<ServiceBean>>,
    sessions: DashMap<SessionId, Arc<SessionBean>>,
}

// -----------------------------------------------------------------------------
// ----- ManagementContext: Static ---------------------------------------------

impl ManagementContext {
    pub fn new(gateway_name: &str, threshold: i64) -> std::io::Result<Arc<Self>> {
        let notifier = NotificationExecutor::new()?;
        Ok(Self::with_notifier(gateway_name, threshold, notifier))
    }

    pub fn with_notifier(
        gateway_name: &str,
        threshold: i64,
        notifier: NotificationExecutor,
    ) -> Arc<Self> {
        let collect_only = Arc::new(StrategyBundle::COLLECT_ONLY);
        let full = Arc::new(StrategyBundle::FULL);

        let gateway = Arc::new(GatewayBean::new(gateway_name, notifier.clone()));
        let fresh = gateway.init();
        debug_assert!(fresh.is_ok());

        Arc::new(Self {
            management_sessions: AtomicI64::new(0),
            overall_sessions: AtomicI64::new(0),
            threshold: AtomicI64::new(threshold),
            active: ArcSwap::new(collect_only.clone()),
            collect_only,
            full,
            strategy_listeners: ArcSwap::from_pointee(Vec::new()),
            notifier,
            gateway,
            services: DashMap::new(),
            sessions: DashMap::new(),
        })
    }
}

// -----------------------------------------------------------------------------
// ----- ManagementContext: Counters -------------------------------------------

impl ManagementContext {
    /// A management session also counts as a session overall.
    pub fn increment_management(&self) {
        self.management_sessions.fetch_add(1, Ordering::SeqCst);
        self.overall_sessions.fetch_add(1, Ordering::SeqCst);
        self.reevaluate();
    }

    pub fn decrement_management(&self) {
        self.management_sessions.fetch_sub(1, Ordering::SeqCst);
        self.overall_sessions.fetch_sub(1, Ordering::SeqCst);
        self.reevaluate();
    }

    pub fn increment_overall(&self) {
        self.overall_sessions.fetch_add(1, Ordering::SeqCst);
        self.reevaluate();
    }

    pub fn decrement_overall(&self) {
        self.overall_sessions.fetch_sub(1, Ordering::SeqCst);
        self.reevaluate();
    }

    pub fn management_session_count(&self) -> i64 {
        self.management_sessions.load(Ordering::SeqCst)
    }

    pub fn overall_session_count(&self) -> i64 {
        self.overall_sessions.load(Ordering::SeqCst)
    }

    pub fn threshold(&self) -> i64 {
        self.threshold.load(Ordering::SeqCst)
    }

    /// Best-effort runtime update.
    pub fn set_threshold(&self, threshold: i64) {
        let previous = self.threshold.swap(threshold, Ordering::SeqCst);
        if previous != threshold {
            info!("management session threshold {previous} -> {threshold}");
        }
        self.reevaluate();
    }
}

// -----------------------------------------------------------------------------
// ----- ManagementContext: Strategies -----------------------------------------

impl ManagementContext {
    /// The whole bundle, read in one load. Callers re-fetch per event.
    pub fn active_bundle(&self) -> StrategyBundle {
        **self.active.load()
    }

    pub fn filter_strategy(&self) -> FilterStrategy {
        self.active.load().filter()
    }

    pub fn gateway_strategy(&self) -> EntityStrategy {
        self.active.load().gateway()
    }

    pub fn service_strategy(&self) -> EntityStrategy {
        self.active.load().service()
    }

    pub fn session_strategy(&self) -> EntityStrategy {
        self.active.load().session()
    }

    pub fn add_strategy_listener(&self, listener: Arc<dyn StrategyChangeListener>) {
        self.strategy_listeners.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(listener.clone());
            next
        });
    }

    pub fn remove_strategy_listener(&self, listener: &Arc<dyn StrategyChangeListener>) -> bool {
        let mut removed = false;
        self.strategy_listeners.rcu(|current| {
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
}

// -----------------------------------------------------------------------------
// ----- ManagementContext: Beans ----------------------------------------------

impl ManagementContext {
    pub fn notifier(&self) -> &NotificationExecutor {
        &self.notifier
    }

    pub fn gateway_bean(&self) -> &Arc<GatewayBean> {
        &self.gateway
    }

    /// Create and initialise the bean for a service. A second registration
    /// under the same name fails.
    pub fn register_service(&self, name: &str) -> Result<Arc<ServiceBean>, GatewayError> {
        let bean = self
            .services
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ServiceBean::new(name, self.notifier.clone())))
            .clone();
        bean.init()?;
        debug!("service bean '{name}' registered");
        Ok(bean)
    }

    pub fn unregister_service(&self, name: &str) -> Option<Arc<ServiceBean>> {
        self.services.remove(name).map(|(_, bean)| bean)
    }

    pub fn service_bean(&self, name: &str) -> Option<Arc<ServiceBean>> {
        self.services.get(name).map(|b| b.clone())
    }

    /// Registered service beans, sorted by name.
    pub fn services(&self) -> Vec<Arc<ServiceBean>> {
        let mut beans: Vec<_> = self.services.iter().map(|e| e.value().clone()).collect();
        beans.sort_by(|a, b| a.name().cmp(b.name()));
        beans
    }

    /// Get or lazily create the bean for `session`.
    pub fn session_bean(&self, session: SessionId, service: &str) -> Arc<SessionBean> {
        self.sessions
            .entry(session)
            .or_insert_with(|| {
                let bean = SessionBean::new(format!("{service}{session}"), self.notifier.clone());
                let fresh = bean.init();
                debug_assert!(fresh.is_ok());
                Arc::new(bean)
            })
            .clone()
    }

    pub fn find_session_bean(&self, session: SessionId) -> Option<Arc<SessionBean>> {
        self.sessions.get(&session).map(|b| b.clone())
    }

    pub fn remove_session_bean(&self, session: SessionId) -> Option<Arc<SessionBean>> {
        self.sessions.remove(&session).map(|(_, bean)| bean)
    }

    pub fn session_bean_count(&self) -> usize {
        self.sessions.len()
    }
}

// -----------------------------------------------------------------------------
// ----- ManagementContext: Private --------------------------------------------

impl ManagementContext {
    fn select(&self) -> &Arc<StrategyBundle> {
        let m = self.management_sessions.load(Ordering::SeqCst);
        let o = self.overall_sessions.load(Ordering::SeqCst);
        let t = self.threshold.load(Ordering::SeqCst);

        if m > 0 && o <= t {
            &self.full
        } else {
            &self.collect_only
        }
    }

    /// Swap until the active bundle matches what the counters select.
    ///
    /// A racing evaluator may store a decision made from stale counters. Each
    /// swapper re-reads afterwards, so once the counters stop moving the last
    /// swapper leaves the right bundle in place.
    fn reevaluate(&self) {
        loop {
            let target = self.select();
            let current = self.active.load_full();
            if Arc::ptr_eq(&current, target) {
                return;
            }

            let previous = self.active.compare_and_swap(&current, target.clone());
            if Arc::ptr_eq(&previous, &current) {
                self.strategy_changed(current.kind(), target.kind());
            }
        }
    }

    fn strategy_changed(&self, previous: BundleKind, current: BundleKind) {
        info!(
            "management strategy {previous} -> {current} (management={}, overall={}, threshold={})",
            self.management_session_count(),
            self.overall_session_count(),
            self.threshold(),
        );

        // a failing listener must not unwind into the caller that moved the counters
        for (index, listener) in self.strategy_listeners.load().iter().enumerate() {
            let call = AssertUnwindSafe(|| listener.strategy_changed(previous, current));
            if let Err(payload) = panic::catch_unwind(call) {
                error!(
                    "strategy listener #{index} panicked on {previous} -> {current}: {}",
                    panic_message(&*payload)
                );
            }
        }
    }
}

impl fmt::Debug for ManagementContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementContext")
            .field("management_sessions", &self.management_session_count())
            .field("overall_sessions", &self.overall_session_count())
            .field("threshold", &self.threshold())
            .field("active", &self.active.load().kind())
            .field("services", &self.services.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
