// Node layout: the inbound/outbound pairs a node descriptor expands to.
//
// A plain node is one inbound plus one direct outbound sharing the node
// tag. A Shadowsocks-Plugin node listens for Shadowsocks on TCP at the
// node port and adds a forwarder on port+1 that carries the descriptor's
// transport; the forwarder has its own direct outbound.

use tracing::{debug, warn};

use crate::Error;
use crate::model::{NodeDescriptor, NodeType};
use crate::tag::{self, Tag};
use crate::traits::{InboundConfig, InboundKind, OutboundConfig, OutboundKind, TrafficEngine};

const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// One inbound and the outbound sharing its tag
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutEntry {
    pub inbound: InboundConfig,
    pub outbound: OutboundConfig,
}

/// Runtime objects installed for one node descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLayout {
    pub descriptor: NodeDescriptor,
    pub tag: Tag,
    /// The node's own listener first, then any forwarder
    pub entries: Vec<LayoutEntry>,
    /// Engine objects already removed, counted inbound then outbound per entry
    removed: usize,
}

impl NodeLayout {
    pub fn plan(node: &NodeDescriptor) -> Result<Self, Error> {
        let tag = tag::node_tag(node);
        let listen_ip = if node.listen_ip.is_empty() {
            DEFAULT_LISTEN_IP.to_string()
        } else {
            node.listen_ip.clone()
        };
        let direct = OutboundKind::Direct {
            send_ip: (!node.send_ip.is_empty()).then(|| node.send_ip.clone()),
        };

        let entries = if node.node_type == NodeType::ShadowsocksPlugin {
            let forward_port = node.port.checked_add(1).ok_or_else(|| {
                Error::invalid_input(format!(
                    "plugin node {} needs a forwarder port above {}",
                    node.node_id, node.port
                ))
            })?;
            let forwarder = tag::forwarder_tag(&tag);
            vec![
                LayoutEntry {
                    inbound: InboundConfig {
                        tag: tag.clone(),
                        kind: InboundKind::Proxy(node.node_type),
                        listen_ip: listen_ip.clone(),
                        port: node.port,
                        transport: "tcp".to_string(),
                        node: node.clone(),
                    },
                    outbound: OutboundConfig {
                        tag: tag.clone(),
                        kind: direct.clone(),
                    },
                },
                LayoutEntry {
                    inbound: InboundConfig {
                        tag: forwarder.clone(),
                        kind: InboundKind::Forwarder,
                        listen_ip,
                        port: forward_port,
                        transport: node.transport.clone(),
                        node: node.clone(),
                    },
                    outbound: OutboundConfig {
                        tag: forwarder,
                        kind: direct,
                    },
                },
            ]
        } else {
            vec![LayoutEntry {
                inbound: InboundConfig {
                    tag: tag.clone(),
                    kind: InboundKind::Proxy(node.node_type),
                    listen_ip,
                    port: node.port,
                    transport: node.transport.clone(),
                    node: node.clone(),
                },
                outbound: OutboundConfig {
                    tag: tag.clone(),
                    kind: direct,
                },
            }]
        };

        Ok(Self {
            descriptor: node.clone(),
            tag,
            entries,
            removed: 0,
        })
    }

    /// Install every entry, undoing partial work on failure
    pub async fn install(&self, engine: &dyn TrafficEngine) -> Result<(), Error> {
        let mut installed: Vec<(&Tag, bool)> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            if let Err(e) = engine.add_inbound(entry.inbound.clone()).await {
                rollback(engine, &installed).await;
                return Err(e);
            }
            installed.push((&entry.inbound.tag, false));

            if let Err(e) = engine.add_outbound(entry.outbound.clone()).await {
                rollback(engine, &installed).await;
                return Err(e);
            }
            if let Some(last) = installed.last_mut() {
                last.1 = true;
            }
            debug!("Installed {}", entry.inbound.tag);
        }
        Ok(())
    }

    /// Whether no part of the layout has been removed yet
    pub fn is_intact(&self) -> bool {
        self.removed == 0
    }

    /// Remove every entry; the first failure aborts
    ///
    /// A later call resumes after the objects an earlier call already
    /// removed.
    pub async fn remove(&mut self, engine: &dyn TrafficEngine) -> Result<(), Error> {
        while let Some(entry) = self.entries.get(self.removed / 2) {
            if self.removed % 2 == 0 {
                engine.remove_inbound(&entry.inbound.tag).await?;
            } else {
                engine.remove_outbound(&entry.outbound.tag).await?;
            }
            self.removed += 1;
        }
        Ok(())
    }
}

/// `installed` holds inbound tags and whether their outbound was added
async fn rollback(engine: &dyn TrafficEngine, installed: &[(&Tag, bool)]) {
    for (tag, with_outbound) in installed.iter().rev() {
        if *with_outbound
            && let Err(e) = engine.remove_outbound(tag).await
        {
            warn!("Rollback: failed to remove outbound {}: {}", tag, e);
        }
        if let Err(e) = engine.remove_inbound(tag).await {
            warn!("Rollback: failed to remove inbound {}: {}", tag, e);
        }
    }
}
