pub mod cli;
#[allow(clippy::module_inception)]
pub mod config;
pub mod errors;
pub mod gateway;
pub mod types;

pub use cli::CliConfig;
pub use config::Config;
pub use errors::ConfigError;
pub use gateway::{GatewayConfig, ServiceEntry};
pub use types::LogLevel;
