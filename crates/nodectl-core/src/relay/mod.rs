//! Relay topology
//!
//! A relayed node does not egress directly: every account gets its own
//! outbound to the relay node, carrying that account's credentials, and a
//! routing rule sends the account's inbound traffic there.
//!
//! ```text
//!  account A ──▶ node inbound ──rule──▶ Relay_..._A ──▶ relay node
//!  account B ──▶ node inbound ──rule──▶ Relay_..._B ──▶ relay node
//! ```
//!
//! [`RelayTopology`] owns the bookkeeping for those outbounds. Only one
//! relay target is active at a time; provisioning a new target tears the
//! old one down first.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::account::{Cipher, derive_key};
use crate::model::{AccountRecord, NodeDescriptor, NodeType, RelayNodeDescriptor};
use crate::tag::{self, Tag};
use crate::traits::{OutboundConfig, OutboundKind, RelayOutbound, TrafficEngine};

/// One account's egress through the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRoute {
    pub outbound_tag: Tag,
    pub account_tag: Tag,
}

#[derive(Debug)]
struct ActiveRelay {
    descriptor: RelayNodeDescriptor,
    tag: Tag,
    /// Keyed by account UID
    routes: BTreeMap<u32, RelayRoute>,
}

/// Manages the per-account relay outbounds of one node
pub struct RelayTopology {
    engine: Arc<dyn TrafficEngine>,
    active: Option<ActiveRelay>,
}

impl RelayTopology {
    pub fn new(engine: Arc<dyn TrafficEngine>) -> Self {
        Self {
            engine,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_tag(&self) -> Option<&Tag> {
        self.active.as_ref().map(|active| &active.tag)
    }

    /// Whether `relay` is the target currently provisioned for `node`
    pub fn is_active_for(&self, node: &NodeDescriptor, relay: &RelayNodeDescriptor) -> bool {
        self.active.as_ref().is_some_and(|active| {
            active.descriptor == *relay && active.tag == tag::relay_tag(node, relay)
        })
    }

    pub fn route_count(&self) -> usize {
        self.active.as_ref().map_or(0, |active| active.routes.len())
    }

    pub fn routes(&self) -> Vec<RelayRoute> {
        self.active
            .as_ref()
            .map(|active| active.routes.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Point `node`'s accounts at a relay target
    ///
    /// Any previously active target is torn down first. Accounts whose
    /// route cannot be installed are skipped with a warning. Returns the
    /// number of routes installed.
    pub async fn provision(
        &mut self,
        node: &NodeDescriptor,
        node_tag: &Tag,
        relay: RelayNodeDescriptor,
        accounts: &[AccountRecord],
    ) -> usize {
        if self.active.is_some() {
            self.teardown().await;
        }

        let relay_tag = tag::relay_tag(node, &relay);
        info!(
            "Taking a relay route [{}] via {}:{} for {} account(s)",
            relay_tag,
            relay.address,
            relay.port,
            accounts.len()
        );

        self.active = Some(ActiveRelay {
            descriptor: relay,
            tag: relay_tag,
            routes: BTreeMap::new(),
        });
        self.add_routes(node_tag, accounts).await
    }

    /// Install routes for additional accounts on the active target
    pub async fn add_routes(&mut self, node_tag: &Tag, accounts: &[AccountRecord]) -> usize {
        let Some(active) = self.active.as_mut() else {
            return 0;
        };

        if active.descriptor.node_type == NodeType::ShadowsocksPlugin {
            debug!(
                "Relay target {} is a plugin node, no per-account routes",
                active.tag
            );
            return 0;
        }

        let cipher = Cipher::parse(&active.descriptor.cipher_method);
        let mut installed = 0;
        for account in accounts {
            if active.routes.contains_key(&account.uid) {
                continue;
            }

            let key = match relay_key(&active.descriptor, cipher, account) {
                Ok(key) => key,
                Err(e) => {
                    warn!("[UID: {}] skipping relay route: {}", account.uid, e);
                    continue;
                }
            };

            let route = RelayRoute {
                outbound_tag: tag::relay_route_tag(&active.tag, account.uid),
                account_tag: tag::account_tag(node_tag, account),
            };
            let outbound = OutboundConfig {
                tag: route.outbound_tag.clone(),
                kind: OutboundKind::Relay(RelayOutbound {
                    relay: active.descriptor.clone(),
                    uid: account.uid,
                    label: account.label.clone(),
                    uuid: account.uuid.clone(),
                    key,
                }),
            };

            if let Err(e) = self.engine.add_outbound(outbound).await {
                warn!("[UID: {}] failed to add relay outbound: {}", account.uid, e);
                continue;
            }
            if let Err(e) = self
                .engine
                .bind_route(&route.outbound_tag, std::slice::from_ref(&route.account_tag))
                .await
            {
                warn!("[UID: {}] failed to bind relay route: {}", account.uid, e);
                if let Err(e) = self.engine.remove_outbound(&route.outbound_tag).await {
                    warn!("[UID: {}] failed to remove relay outbound: {}", account.uid, e);
                }
                continue;
            }

            active.routes.insert(account.uid, route);
            installed += 1;
        }

        installed
    }

    /// Remove the routes of accounts leaving the node
    pub async fn remove_routes(&mut self, accounts: &[AccountRecord]) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        for account in accounts {
            if let Some(route) = active.routes.remove(&account.uid) {
                remove_route(self.engine.as_ref(), &route).await;
            }
        }
    }

    /// Remove every relay route
    ///
    /// Best effort: individual failures are logged and bookkeeping is
    /// cleared regardless, so a later provision starts from scratch.
    pub async fn teardown(&mut self) -> Option<Tag> {
        let active = self.active.take()?;
        for route in active.routes.values() {
            remove_route(self.engine.as_ref(), route).await;
        }
        info!(
            "Relay route [{}] removed ({} route(s))",
            active.tag,
            active.routes.len()
        );
        Some(active.tag)
    }
}

async fn remove_route(engine: &dyn TrafficEngine, route: &RelayRoute) {
    if let Err(e) = engine
        .unbind_route(std::slice::from_ref(&route.account_tag))
        .await
    {
        warn!("Failed to unbind relay route {}: {}", route.outbound_tag, e);
    }
    if let Err(e) = engine.remove_outbound(&route.outbound_tag).await {
        warn!("Failed to remove relay outbound {}: {}", route.outbound_tag, e);
    }
}

/// Credentials an account presents to the relay node
fn relay_key(
    relay: &RelayNodeDescriptor,
    cipher: Option<Cipher>,
    account: &AccountRecord,
) -> Result<String, crate::Error> {
    match cipher {
        Some(cipher) if cipher.is_2022() => {
            let user_key = derive_key(&account.secret, cipher)?;
            Ok(format!("{}:{}", relay.server_key, user_key))
        }
        _ => Ok(account.secret.clone()),
    }
}
