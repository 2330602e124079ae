//! # Tollgate Gateway
//!
//! Admission hooks for the LLM request path and the HTTP API that
//! administers usage plans.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Usage-plan administration.
pub mod admin;
/// REST error envelope.
pub mod api;
/// Read-through plan cache.
pub mod cache;
mod middleware;
mod server;
/// Admission hooks for the request path.
pub mod shim;

pub use admin::{AdminError, CreateUsagePlan, RateLimitsPatch, UsagePlanAdmin, UsagePlanPatch};
pub use cache::PlanCache;
pub use middleware::AdminThrottle;
pub use server::{Gateway, GatewayBuilder, GatewayState, router};
pub use shim::{
    Admission, AdmissionRejection, AdmissionShim, AdmissionTicket, CallerIdentity, TokenEstimate,
};

use tollgate_core::config::Config;

/// Start the gateway server.
///
/// # Errors
///
/// Returns error if the stores cannot be opened or the server fails to start.
pub async fn start(config: &Config) -> Result<(), GatewayError> {
    let gateway = Gateway::from_config(config)?;
    gateway.run().await
}

/// Gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Server error.
    #[error("Server error: {0}")]
    Server(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// Store error.
    #[error("Store error: {0}")]
    Store(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
