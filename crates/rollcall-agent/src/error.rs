//! Agent error taxonomy.

use rollcall_catalog::CatalogError;
use thiserror::Error;

/// Errors surfaced by the agent's components.
///
/// None of these terminate the process by themselves; the driver decides
/// whether an error is fatal.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("registration failed: {0}")]
    Register(#[source] CatalogError),

    #[error("heartbeat failed after {attempts} attempt(s): {source}")]
    Heartbeat {
        attempts: u32,
        #[source]
        source: CatalogError,
    },

    #[error("deregistration failed: {0}")]
    Deregister(#[source] CatalogError),

    #[error("accept loop failed: {0}")]
    Accept(#[source] std::io::Error),
}
