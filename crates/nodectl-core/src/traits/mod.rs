//! Collaborator traits for the node controller
//!
//! This module defines the abstract interfaces the controller drives.
//!
//! - [`TrafficEngine`]: Install runtime objects and read counters
//! - [`RemoteApi`]: Poll the management panel and report back
//! - [`CertificateManager`]: Renew the node's TLS certificate

pub mod cert_manager;
pub mod remote_api;
pub mod traffic_engine;

pub use cert_manager::{CertificateManager, RenewOutcome};
pub use remote_api::RemoteApi;
pub use traffic_engine::{
    AccountLimit, InboundConfig, InboundKind, OutboundConfig, OutboundKind, RelayOutbound,
    TrafficEngine,
};
