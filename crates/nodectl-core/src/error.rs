//! Error types for the node controller
//!
//! This module defines all error types used throughout the crate.
//!
//! "Not modified" answers from the remote API are not errors; they are
//! expressed with [`crate::model::Fetch::NotModified`].

use thiserror::Error;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the node controller
#[derive(Error, Debug)]
pub enum Error {
    /// Remote management API failure (transient, retried next tick)
    #[error("Remote API error: {0}")]
    RemoteApi(String),

    /// Traffic engine rejected a provisioning operation
    #[error("Traffic engine error: {0}")]
    TrafficEngine(String),

    /// Initial provisioning failed; the node was left unconfigured
    #[error("Startup failed: {0}")]
    Startup(String),

    /// Upstream rejected a traffic or online-IP report
    #[error("Report failed: {0}")]
    Report(String),

    /// Certificate lifecycle errors
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// A collaborator call or shutdown exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not allowed in the controller's current phase
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a remote API error
    pub fn remote_api(msg: impl Into<String>) -> Self {
        Self::RemoteApi(msg.into())
    }

    /// Create a traffic engine error
    pub fn traffic_engine(msg: impl Into<String>) -> Self {
        Self::TrafficEngine(msg.into())
    }

    /// Create a startup error
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }

    /// Create a report error
    pub fn report(msg: impl Into<String>) -> Self {
        Self::Report(msg.into())
    }

    /// Create a certificate error
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether the failure is expected to clear up on a later tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RemoteApi(_) | Self::Timeout(_) | Self::Report(_) | Self::TrafficEngine(_)
        )
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Self::InvalidInput(err.to_string())
    }
}
