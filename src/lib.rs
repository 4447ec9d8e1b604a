pub mod config;
pub mod errors;
pub mod management;
pub mod service;
pub mod session;
pub mod transport;
pub mod worker;

pub use config::Config;
pub use errors::GatewayError;
pub use management::ManagementContext;
pub use service::{Service, ServiceConfig};
pub use session::{Session, SessionHandler};
pub use worker::WorkerPool;
