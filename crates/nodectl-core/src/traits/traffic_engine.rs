// # Traffic Engine Trait
//
// Defines the management interface of the proxy core that carries the
// node's traffic. The controller never touches packets; it only adds and
// removes runtime objects keyed by tags and reads counters back.
//
// ## Implementations
//
// - In-process: `MemoryTrafficEngine` (embedding, tests)
// - Out of process: gRPC/command bridges to a proxy core
//
// ## Usage
//
// ```rust,ignore
// use nodectl_core::TrafficEngine;
//
// let engine = /* TrafficEngine implementation */;
// engine.add_inbound(inbound).await?;
// engine.add_outbound(outbound).await?;
// engine.add_accounts(&node_tag, &accounts).await?;
// let counters = engine.traffic(&account_tag).await?;
// ```

use async_trait::async_trait;

use crate::account::AccountDescriptor;
use crate::model::{
    AccountRecord, DetectResult, DetectRule, NodeDescriptor, NodeType, OnlineIp,
    RelayNodeDescriptor, TrafficCounters,
};
use crate::tag::Tag;

/// What an inbound listener speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// Terminates the node's proxy protocol
    Proxy(NodeType),
    /// Forwards raw streams to another local listener
    Forwarder,
}

/// Inbound listener to install
#[derive(Debug, Clone, PartialEq)]
pub struct InboundConfig {
    pub tag: Tag,
    pub kind: InboundKind,
    pub listen_ip: String,
    pub port: u16,
    pub transport: String,
    /// Full descriptor for protocol and security settings
    pub node: NodeDescriptor,
}

/// Egress path to install
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundConfig {
    pub tag: Tag,
    pub kind: OutboundKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundKind {
    /// Leave the node directly, optionally from a fixed source address
    Direct { send_ip: Option<String> },
    /// Chain through a relay node with one account's credentials
    Relay(RelayOutbound),
}

/// Per-account credentials used to reach the relay node
#[derive(Debug, Clone, PartialEq)]
pub struct RelayOutbound {
    pub relay: RelayNodeDescriptor,
    pub uid: u32,
    pub label: String,
    pub uuid: String,
    /// Password or derived key presented to the relay
    pub key: String,
}

/// Limiter entry for one account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountLimit {
    pub account_tag: Tag,
    pub uid: u32,
    pub speed_limit: u64,
    pub device_limit: u32,
}

impl AccountLimit {
    pub fn for_account(node_tag: &Tag, account: &AccountRecord) -> Self {
        Self {
            account_tag: crate::tag::account_tag(node_tag, account),
            uid: account.uid,
            speed_limit: account.speed_limit,
            device_limit: account.device_limit,
        }
    }
}

/// Management interface of the traffic engine
///
/// # Thread Safety
///
/// Implementations must be thread-safe and usable across async tasks.
///
/// # Responsibilities
///
/// The engine executes single operations and reports failures. It does
/// not decide what should be provisioned, does not retry, and does not
/// talk to the remote API; all of that belongs to the controller.
///
/// # Tags
///
/// Every runtime object is addressed by a [`Tag`]. Adding an object whose
/// tag already exists and removing an unknown inbound or outbound are
/// errors. Removing unknown accounts or route bindings is not.
#[async_trait]
pub trait TrafficEngine: Send + Sync {
    /// Install an inbound listener
    async fn add_inbound(&self, config: InboundConfig) -> Result<(), crate::Error>;

    /// Remove an inbound listener and every account attached to it
    async fn remove_inbound(&self, tag: &Tag) -> Result<(), crate::Error>;

    /// Install an outbound egress path
    async fn add_outbound(&self, config: OutboundConfig) -> Result<(), crate::Error>;

    /// Remove an outbound egress path
    async fn remove_outbound(&self, tag: &Tag) -> Result<(), crate::Error>;

    /// Attach accounts to the inbound identified by `tag`
    ///
    /// A failed call may still have attached part of the batch.
    async fn add_accounts(
        &self,
        tag: &Tag,
        accounts: &[AccountDescriptor],
    ) -> Result<(), crate::Error>;

    /// Detach accounts, by account tag, from the inbound identified by `tag`
    async fn remove_accounts(&self, tag: &Tag, account_tags: &[Tag]) -> Result<(), crate::Error>;

    /// Read an account's counters without resetting them
    async fn traffic(&self, account_tag: &Tag) -> Result<TrafficCounters, crate::Error>;

    /// Deduct acknowledged traffic from an account's counters
    ///
    /// Subtracting exactly what was reported keeps bytes counted between
    /// the read and the acknowledgement.
    async fn reset_traffic(
        &self,
        account_tag: &Tag,
        acknowledged: TrafficCounters,
    ) -> Result<(), crate::Error>;

    /// Addresses currently connected through the inbound `tag`
    async fn online_ips(&self, tag: &Tag) -> Result<Vec<OnlineIp>, crate::Error>;

    /// Detection rule hits since the previous call, drained on read
    async fn detections(&self, tag: &Tag) -> Result<Vec<DetectResult>, crate::Error>;

    /// Install the limiter for inbound `tag`, replacing any existing one
    async fn set_inbound_limiter(
        &self,
        tag: &Tag,
        global_limit: u64,
        accounts: &[AccountLimit],
    ) -> Result<(), crate::Error>;

    /// Add or replace per-account entries in an existing limiter
    async fn update_limiter(&self, tag: &Tag, accounts: &[AccountLimit])
    -> Result<(), crate::Error>;

    /// Remove the limiter of inbound `tag`
    async fn remove_limiter(&self, tag: &Tag) -> Result<(), crate::Error>;

    /// Route traffic of the given accounts to `outbound_tag`
    async fn bind_route(&self, outbound_tag: &Tag, account_tags: &[Tag])
    -> Result<(), crate::Error>;

    /// Drop any routing rule for the given accounts
    async fn unbind_route(&self, account_tags: &[Tag]) -> Result<(), crate::Error>;

    /// Replace the detection rule set of inbound `tag`
    async fn bind_rules(&self, tag: &Tag, rules: &[DetectRule]) -> Result<(), crate::Error>;

    /// Remove the detection rule set of inbound `tag`
    async fn unbind_rules(&self, tag: &Tag) -> Result<(), crate::Error>;

    /// Engine name (for logging/debugging)
    fn engine_name(&self) -> &'static str;
}
