//! Protocol-specific account descriptors
//!
//! [`AccountBuilder`] turns abstract [`AccountRecord`]s into the credential
//! descriptors the traffic engine installs. Accounts that cannot be
//! expressed for the node's protocol are skipped with a warning; one bad
//! record never aborts the batch.

use tracing::warn;

use crate::account::cipher::{self, Cipher};
use crate::model::{AccountRecord, NodeDescriptor, NodeType};
use crate::tag::{self, Tag};

/// Credential material for one protocol family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Vmess { uuid: String, security: String },
    Vless { uuid: String, flow: String },
    Trojan { password: String },
    /// Legacy Shadowsocks, password used as is
    Shadowsocks { password: String, cipher: Cipher },
    /// Shadowsocks 2022, base64 key derived from the secret
    Shadowsocks2022 { key: String, cipher: Cipher },
}

/// An account ready to be attached to an inbound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountDescriptor {
    pub tag: Tag,
    pub uid: u32,
    pub label: String,
    pub speed_limit: u64,
    pub device_limit: u32,
    pub credential: Credential,
}

/// Node-level parameters that shape credentials
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildParams {
    /// VLESS flow control, e.g. `xtls-rprx-vision`
    pub flow: String,
    /// Shadowsocks cipher name
    pub cipher_method: String,
}

impl BuildParams {
    pub fn from_node(node: &NodeDescriptor) -> Self {
        Self {
            flow: node.flow.clone(),
            cipher_method: node.cipher_method.clone(),
        }
    }
}

/// Builds account descriptors tagged under one node tag
#[derive(Debug, Clone, Copy)]
pub struct AccountBuilder<'a> {
    node_tag: &'a Tag,
}

impl<'a> AccountBuilder<'a> {
    pub fn new(node_tag: &'a Tag) -> Self {
        Self { node_tag }
    }

    /// Build descriptors for `records` under the given protocol
    ///
    /// Output order follows input order; skipped records are absent.
    pub fn build(
        &self,
        records: &[AccountRecord],
        node_type: NodeType,
        params: &BuildParams,
    ) -> Vec<AccountDescriptor> {
        let cipher = match node_type {
            NodeType::Shadowsocks | NodeType::ShadowsocksPlugin => {
                match Cipher::parse(&params.cipher_method) {
                    Some(cipher) => Some(cipher),
                    None => {
                        warn!(
                            "Unsupported cipher '{}' for {} node {}, no accounts built",
                            params.cipher_method, node_type, self.node_tag
                        );
                        return Vec::new();
                    }
                }
            }
            _ => None,
        };

        if node_type == NodeType::ShadowsocksPlugin
            && let Some(cipher) = cipher
            && !(cipher.is_aead() || cipher.is_2022())
        {
            warn!(
                "Cipher {} is not AEAD, plugin node {} cannot serve it",
                cipher, self.node_tag
            );
            return Vec::new();
        }

        records
            .iter()
            .filter_map(|record| {
                let credential = match self.credential(record, node_type, params, cipher) {
                    Ok(credential) => credential,
                    Err(e) => {
                        warn!("[UID: {}] skipping account: {}", record.uid, e);
                        return None;
                    }
                };
                Some(AccountDescriptor {
                    tag: tag::account_tag(self.node_tag, record),
                    uid: record.uid,
                    label: record.label.clone(),
                    speed_limit: record.speed_limit,
                    device_limit: record.device_limit,
                    credential,
                })
            })
            .collect()
    }

    fn credential(
        &self,
        record: &AccountRecord,
        node_type: NodeType,
        params: &BuildParams,
        cipher: Option<Cipher>,
    ) -> Result<Credential, crate::Error> {
        match (node_type, cipher) {
            (NodeType::Vmess, _) => Ok(Credential::Vmess {
                uuid: require_uuid(record)?,
                security: "auto".to_string(),
            }),
            (NodeType::Vless, _) => Ok(Credential::Vless {
                uuid: require_uuid(record)?,
                flow: params.flow.clone(),
            }),
            (NodeType::Trojan, _) => Ok(Credential::Trojan {
                password: require_uuid(record)?,
            }),
            (NodeType::Shadowsocks | NodeType::ShadowsocksPlugin, Some(cipher))
                if cipher.is_2022() =>
            {
                Ok(Credential::Shadowsocks2022 {
                    key: cipher::derive_key(&record.secret, cipher)?,
                    cipher,
                })
            }
            (NodeType::Shadowsocks | NodeType::ShadowsocksPlugin, Some(cipher)) => {
                Ok(Credential::Shadowsocks {
                    password: record.secret.clone(),
                    cipher,
                })
            }
            (NodeType::Shadowsocks | NodeType::ShadowsocksPlugin, None) => Err(
                crate::Error::invalid_input("shadowsocks account built without a cipher"),
            ),
        }
    }
}

fn require_uuid(record: &AccountRecord) -> Result<String, crate::Error> {
    if record.uuid.is_empty() {
        return Err(crate::Error::invalid_input("account has no UUID"));
    }
    Ok(record.uuid.clone())
}
