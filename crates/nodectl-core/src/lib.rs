// # nodectl-core
//
// Control-plane core for a multi-protocol proxy node.
//
// ## Architecture Overview
//
// This library keeps a local traffic engine converged on the desired state
// published by a remote management API:
// - **RemoteApi**: Trait for polling node/account/rule snapshots and reporting back
// - **TrafficEngine**: Trait for installing runtime objects in the proxy core
// - **CertificateManager**: Trait for renewing the node's TLS certificate
// - **AccountBuilder**: Records → protocol-specific credentials
// - **diff**: Snapshot comparison driving incremental provisioning
// - **RelayTopology**: Per-account relay outbounds
// - **TaskScheduler**: Named periodic jobs with failure isolation
// - **Controller**: Orchestrates start-up, node sync, traffic sync and renewal
//
// ## Design Principles
//
// 1. **Separation of Concerns**: The controller decides, the engine executes
// 2. **Deterministic Tags**: Every runtime object is keyed by a pure function of its inputs
// 3. **Incremental**: Only the difference between snapshots is applied
// 4. **Library-First**: Transport to the panel and the proxy core are plugged in by the embedder

pub mod account;
pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod relay;
pub mod scheduler;
pub mod tag;
pub mod traffic;
pub mod traits;

// Re-export core types for convenience
pub use account::{AccountBuilder, AccountDescriptor, AccountDiff, Cipher, Credential, diff};
pub use config::ControllerConfig;
pub use controller::{Controller, ControllerEvent, ControllerStatus, Phase};
pub use error::{Error, Result};
pub use model::{AccountRecord, DetectRule, Fetch, NodeDescriptor, NodeType, RelayNodeDescriptor};
pub use relay::RelayTopology;
pub use scheduler::TaskScheduler;
pub use tag::Tag;
pub use traffic::MemoryTrafficEngine;
pub use traits::{CertificateManager, RemoteApi, TrafficEngine};
