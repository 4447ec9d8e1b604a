use std::{error::Error, net::SocketAddr};

use thiserror::Error;

// -----------------------------------------------------------------------------
// ----- GatewayError ----------------------------------------------------------

/// Structural failures. These abort the triggering call and are never retried.
///
/// Concurrency-contract violations (touching an aligned session from the
/// wrong thread) are not represented here: they panic.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("service '{service}' is {state}; cannot {operation}")]
    IllegalState {
        service: String,
        state: &'static str,
        operation: &'static str,
    },

    #[error("service '{service}' has no handler; set one before connecting")]
    HandlerNotSet { service: String },

    #[error("management bean '{name}' already initialized")]
    BeanAlreadyInitialized { name: String },

    #[error("counter export has no free service slot (max {max})")]
    ExportSlotsExhausted { max: usize },

    #[error("address {addr} is not bound")]
    NotBound { addr: SocketAddr },

    #[error("transport error on {addr}: {source}")]
    Transport {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("connect to {addr} canceled")]
    ConnectCanceled { addr: SocketAddr },

    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: SocketAddr, reason: String },

    #[error("failed to start worker threads: {0}")]
    WorkerPool(#[source] std::io::Error),
}

impl GatewayError {
    pub fn illegal_state(
        service: impl Into<String>,
        state: &'static str,
        operation: &'static str,
    ) -> Self {
        GatewayError::IllegalState {
            service: service.into(),
            state,
            operation,
        }
    }

    pub fn transport(addr: SocketAddr, source: std::io::Error) -> Self {
        GatewayError::Transport { addr, source }
    }
}

// -----------------------------------------------------------------------------
// ----- Listener results ------------------------------------------------------

/// What listener callbacks hand back. Failures are logged by the caller and
/// never reach sibling listeners or the data path.
pub type ListenerResult = Result<(), Box<dyn Error + Send + Sync>>;

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
