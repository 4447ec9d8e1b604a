//! Services own the bind/connect lifecycle: they create sessions, hand them
//! their first worker, and track them until they close.

pub mod connect;
pub mod listener;
pub mod service;
pub mod service_config;

pub use connect::{ConnectFuture, ConnectState};
pub use listener::ServiceListener;
pub use service::{DisposalState, ExecutorSource, Service};
pub use service_config::ServiceConfig;
