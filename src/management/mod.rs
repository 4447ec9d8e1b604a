//! Adaptive instrumentation: per-entity statistic beans, deferred listener
//! fan-out, and the engine that switches between the collect-only and full
//! strategy bundles as load changes.

pub mod bean;
pub mod context;
pub mod export;
pub mod filter;
pub mod listener;
pub mod notifier;
pub mod stats;
pub mod strategy;

pub use bean::{
    BeanKind, GatewayBean, GatewayKind, ManagementBean, ServiceBean, ServiceKind, SessionBean,
    SessionKind,
};
pub use context::ManagementContext;
pub use export::{CounterExporter, CounterRegion};
pub use filter::ManagementStage;
pub use listener::{
    ManagementEvent, ManagementEventKind, ManagementListener, StrategyChangeListener,
};
pub use notifier::NotificationExecutor;
pub use stats::{StatTable, Stats};
pub use strategy::{BundleKind, EntityStrategy, FilterStrategy, StrategyBundle};
