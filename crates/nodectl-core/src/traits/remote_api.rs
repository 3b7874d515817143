// # Remote API Trait
//
// Defines the polled interface of the management panel that owns the
// node's configuration. Transport (HTTP, auth, ETag bookkeeping) lives in
// the implementation; the controller only sees typed snapshots.
//
// ## Not Modified
//
// Versioned resources return `Fetch::NotModified` when nothing changed
// since the previous poll. That is a normal answer, not an error: the
// controller reuses its previous snapshot.

use async_trait::async_trait;

use crate::model::{
    AccountRecord, ClientInfo, DetectRule, Fetch, NodeDescriptor, OnlineIp, RelayNodeDescriptor,
    TrafficSample,
};

/// Trait for remote management API implementations
///
/// # Thread Safety
///
/// Implementations must be thread-safe and usable across async tasks.
///
/// # Responsibilities
///
/// - ✅ Fetch and decode snapshots
/// - ✅ Track upstream versions to answer `NotModified`
/// - ❌ Retry or back off (the controller's scheduler owns timing)
/// - ❌ Touch the traffic engine
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Identity of the endpoint, for log prefixes
    fn describe(&self) -> ClientInfo;

    /// Fetch the node descriptor
    async fn node_descriptor(&self) -> Result<Fetch<NodeDescriptor>, crate::Error>;

    /// Fetch the descriptor of the relay node this node chains through
    async fn relay_node_descriptor(&self) -> Result<RelayNodeDescriptor, crate::Error>;

    /// Fetch the full account list for this node
    async fn account_list(&self) -> Result<Fetch<Vec<AccountRecord>>, crate::Error>;

    /// Fetch the detection rule list
    async fn detection_rules(&self) -> Result<Fetch<Vec<DetectRule>>, crate::Error>;

    /// Report addresses currently online
    async fn report_online_ips(&self, online: &[OnlineIp]) -> Result<(), crate::Error>;

    /// Report accumulated traffic
    ///
    /// `Ok` means upstream acknowledged exactly these values.
    async fn report_traffic(&self, samples: &[TrafficSample]) -> Result<(), crate::Error>;
}
