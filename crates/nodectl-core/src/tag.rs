//! Deterministic tags
//!
//! Tags join the controller's bookkeeping to runtime objects inside the
//! traffic engine. They are pure functions of the identifying fields, so
//! the same descriptor always maps to the same tag:
//!
//! - node: `{type}_{port}_{node_id}`
//! - relay: `Relay_{node_id}_{relay_type}_{relay_port}_{relay_node_id}`
//! - account: `{node_tag}|{label}|{uid}`
//! - relay route: `{relay_tag}_{uid}`
//! - plugin forwarder: `dokodemo-door_{node_tag}+1`

use crate::model::{AccountRecord, NodeDescriptor, RelayNodeDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of a traffic-engine runtime object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Tag of the node's primary inbound/outbound pair
pub fn node_tag(node: &NodeDescriptor) -> Tag {
    Tag(format!("{}_{}_{}", node.node_type, node.port, node.node_id))
}

/// Tag of the relay target as seen from `node`
pub fn relay_tag(node: &NodeDescriptor, relay: &RelayNodeDescriptor) -> Tag {
    Tag(format!(
        "Relay_{}_{}_{}_{}",
        node.node_id, relay.node_type, relay.port, relay.node_id
    ))
}

/// Tag of an account provisioned under `node_tag`
pub fn account_tag(node_tag: &Tag, account: &AccountRecord) -> Tag {
    Tag(format!("{}|{}|{}", node_tag, account.label, account.uid))
}

/// Tag of the relay outbound dedicated to one account
pub fn relay_route_tag(relay_tag: &Tag, uid: u32) -> Tag {
    Tag(format!("{}_{}", relay_tag, uid))
}

/// Tag of the forwarding inbound that fronts a Shadowsocks-Plugin node
pub fn forwarder_tag(node_tag: &Tag) -> Tag {
    Tag(format!("dokodemo-door_{}+1", node_tag))
}
