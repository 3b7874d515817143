// # Memory Traffic Engine
//
// In-process implementation of TrafficEngine.
//
// ## Purpose
//
// Keeps every runtime object the controller provisions in plain maps so
// that embedders can run the controller without a proxy core, and tests can
// assert on exactly what was installed and in which order.
//
// ## Behavior
//
// - Traffic, online addresses and detection hits are fed in from outside
//   (`record_traffic`, `set_online_ips`, `record_detection`)
// - Every mutating trait call is appended to an operation journal
// - Nothing survives a restart

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::Error;
use crate::account::AccountDescriptor;
use crate::model::{DetectResult, DetectRule, OnlineIp, TrafficCounters};
use crate::tag::Tag;
use crate::traits::{AccountLimit, InboundConfig, OutboundConfig, TrafficEngine};

/// A mutating call received by [`MemoryTrafficEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOp {
    AddInbound(Tag),
    RemoveInbound(Tag),
    AddOutbound(Tag),
    RemoveOutbound(Tag),
    /// Inbound tag and the account tags attached
    AddAccounts(Tag, Vec<Tag>),
    RemoveAccounts(Tag, Vec<Tag>),
    ResetTraffic(Tag, TrafficCounters),
    SetLimiter(Tag, Vec<Tag>),
    UpdateLimiter(Tag, Vec<Tag>),
    RemoveLimiter(Tag),
    BindRoute(Tag, Vec<Tag>),
    UnbindRoute(Vec<Tag>),
    BindRules(Tag, Vec<u32>),
    UnbindRules(Tag),
}

/// Limiter installed on one inbound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterState {
    pub global_limit: u64,
    /// Keyed by account tag
    pub accounts: BTreeMap<Tag, AccountLimit>,
}

#[derive(Debug, Default)]
struct EngineState {
    inbounds: BTreeMap<Tag, InboundConfig>,
    outbounds: BTreeMap<Tag, OutboundConfig>,
    /// Inbound tag -> account tag -> descriptor
    accounts: BTreeMap<Tag, BTreeMap<Tag, AccountDescriptor>>,
    limiters: BTreeMap<Tag, LimiterState>,
    /// Account tag -> outbound tag
    routes: BTreeMap<Tag, Tag>,
    rules: BTreeMap<Tag, Vec<DetectRule>>,
    traffic: HashMap<Tag, TrafficCounters>,
    online: HashMap<Tag, Vec<OnlineIp>>,
    detections: HashMap<Tag, Vec<DetectResult>>,
    journal: Vec<EngineOp>,
}

/// In-memory traffic engine
///
/// Cloning shares the underlying state.
///
/// # Example
///
/// ```rust,no_run
/// use nodectl_core::traffic::MemoryTrafficEngine;
/// use nodectl_core::tag::Tag;
/// use nodectl_core::model::TrafficCounters;
///
/// #[tokio::main]
/// async fn main() {
///     let engine = MemoryTrafficEngine::new();
///     let account = Tag::new("Vless_443_1|a@example.com|1");
///     engine.record_traffic(&account, 1024, 4096).await;
///     assert_eq!(
///         engine.counters(&account).await,
///         TrafficCounters::new(1024, 4096)
///     );
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryTrafficEngine {
    inner: Arc<RwLock<EngineState>>,
}

impl MemoryTrafficEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add bytes to an account's counters
    pub async fn record_traffic(&self, account_tag: &Tag, upload: u64, download: u64) {
        let mut guard = self.inner.write().await;
        let counters = guard.traffic.entry(account_tag.clone()).or_default();
        counters.upload = counters.upload.saturating_add(upload);
        counters.download = counters.download.saturating_add(download);
    }

    /// Replace the addresses reported online for an inbound
    pub async fn set_online_ips(&self, inbound: &Tag, ips: Vec<OnlineIp>) {
        self.inner.write().await.online.insert(inbound.clone(), ips);
    }

    /// Queue a detection hit on an inbound
    pub async fn record_detection(&self, inbound: &Tag, hit: DetectResult) {
        self.inner
            .write()
            .await
            .detections
            .entry(inbound.clone())
            .or_default()
            .push(hit);
    }

    /// Mutating calls received so far, oldest first
    pub async fn operations(&self) -> Vec<EngineOp> {
        self.inner.read().await.journal.clone()
    }

    pub async fn clear_operations(&self) {
        self.inner.write().await.journal.clear();
    }

    pub async fn has_inbound(&self, tag: &Tag) -> bool {
        self.inner.read().await.inbounds.contains_key(tag)
    }

    pub async fn inbound(&self, tag: &Tag) -> Option<InboundConfig> {
        self.inner.read().await.inbounds.get(tag).cloned()
    }

    pub async fn inbound_tags(&self) -> Vec<Tag> {
        self.inner.read().await.inbounds.keys().cloned().collect()
    }

    pub async fn has_outbound(&self, tag: &Tag) -> bool {
        self.inner.read().await.outbounds.contains_key(tag)
    }

    pub async fn outbound(&self, tag: &Tag) -> Option<OutboundConfig> {
        self.inner.read().await.outbounds.get(tag).cloned()
    }

    pub async fn outbound_tags(&self) -> Vec<Tag> {
        self.inner.read().await.outbounds.keys().cloned().collect()
    }

    /// Accounts attached to an inbound, sorted by tag
    pub async fn accounts(&self, inbound: &Tag) -> Vec<AccountDescriptor> {
        self.inner
            .read()
            .await
            .accounts
            .get(inbound)
            .map(|accounts| accounts.values().cloned().collect())
            .unwrap_or_default()
    }

    /// UIDs attached to an inbound, ascending
    pub async fn account_uids(&self, inbound: &Tag) -> Vec<u32> {
        let mut uids: Vec<u32> = self.accounts(inbound).await.iter().map(|a| a.uid).collect();
        uids.sort_unstable();
        uids
    }

    pub async fn limiter(&self, inbound: &Tag) -> Option<LimiterState> {
        self.inner.read().await.limiters.get(inbound).cloned()
    }

    pub async fn route_of(&self, account_tag: &Tag) -> Option<Tag> {
        self.inner.read().await.routes.get(account_tag).cloned()
    }

    pub async fn route_count(&self) -> usize {
        self.inner.read().await.routes.len()
    }

    pub async fn rules(&self, inbound: &Tag) -> Option<Vec<DetectRule>> {
        self.inner.read().await.rules.get(inbound).cloned()
    }

    /// Counters without going through the trait's `Result`
    pub async fn counters(&self, account_tag: &Tag) -> TrafficCounters {
        self.inner
            .read()
            .await
            .traffic
            .get(account_tag)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TrafficEngine for MemoryTrafficEngine {
    async fn add_inbound(&self, config: InboundConfig) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        if guard.inbounds.contains_key(&config.tag) {
            return Err(Error::traffic_engine(format!(
                "inbound {} already exists",
                config.tag
            )));
        }
        guard.journal.push(EngineOp::AddInbound(config.tag.clone()));
        guard.inbounds.insert(config.tag.clone(), config);
        Ok(())
    }

    async fn remove_inbound(&self, tag: &Tag) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        if guard.inbounds.remove(tag).is_none() {
            return Err(Error::traffic_engine(format!("inbound {} not found", tag)));
        }
        guard.accounts.remove(tag);
        guard.journal.push(EngineOp::RemoveInbound(tag.clone()));
        Ok(())
    }

    async fn add_outbound(&self, config: OutboundConfig) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        if guard.outbounds.contains_key(&config.tag) {
            return Err(Error::traffic_engine(format!(
                "outbound {} already exists",
                config.tag
            )));
        }
        guard.journal.push(EngineOp::AddOutbound(config.tag.clone()));
        guard.outbounds.insert(config.tag.clone(), config);
        Ok(())
    }

    async fn remove_outbound(&self, tag: &Tag) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        if guard.outbounds.remove(tag).is_none() {
            return Err(Error::traffic_engine(format!("outbound {} not found", tag)));
        }
        guard.journal.push(EngineOp::RemoveOutbound(tag.clone()));
        Ok(())
    }

    async fn add_accounts(&self, tag: &Tag, accounts: &[AccountDescriptor]) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        if !guard.inbounds.contains_key(tag) {
            return Err(Error::traffic_engine(format!("inbound {} not found", tag)));
        }

        let attached = guard.accounts.entry(tag.clone()).or_default();
        if let Some(duplicate) = accounts.iter().find(|a| attached.contains_key(&a.tag)) {
            return Err(Error::traffic_engine(format!(
                "account {} already exists on {}",
                duplicate.tag, tag
            )));
        }
        for account in accounts {
            attached.insert(account.tag.clone(), account.clone());
        }

        let tags = accounts.iter().map(|a| a.tag.clone()).collect();
        guard.journal.push(EngineOp::AddAccounts(tag.clone(), tags));
        Ok(())
    }

    async fn remove_accounts(&self, tag: &Tag, account_tags: &[Tag]) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        if let Some(attached) = guard.accounts.get_mut(tag) {
            for account_tag in account_tags {
                attached.remove(account_tag);
            }
        }
        guard
            .journal
            .push(EngineOp::RemoveAccounts(tag.clone(), account_tags.to_vec()));
        Ok(())
    }

    async fn traffic(&self, account_tag: &Tag) -> Result<TrafficCounters, Error> {
        Ok(self.counters(account_tag).await)
    }

    async fn reset_traffic(&self, account_tag: &Tag, acknowledged: TrafficCounters) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        if let Some(counters) = guard.traffic.get_mut(account_tag) {
            counters.upload = counters.upload.saturating_sub(acknowledged.upload);
            counters.download = counters.download.saturating_sub(acknowledged.download);
        }
        guard
            .journal
            .push(EngineOp::ResetTraffic(account_tag.clone(), acknowledged));
        Ok(())
    }

    async fn online_ips(&self, tag: &Tag) -> Result<Vec<OnlineIp>, Error> {
        Ok(self
            .inner
            .read()
            .await
            .online
            .get(tag)
            .cloned()
            .unwrap_or_default())
    }

    async fn detections(&self, tag: &Tag) -> Result<Vec<DetectResult>, Error> {
        Ok(self
            .inner
            .write()
            .await
            .detections
            .remove(tag)
            .unwrap_or_default())
    }

    async fn set_inbound_limiter(
        &self,
        tag: &Tag,
        global_limit: u64,
        accounts: &[AccountLimit],
    ) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        let limiter = LimiterState {
            global_limit,
            accounts: accounts
                .iter()
                .map(|limit| (limit.account_tag.clone(), limit.clone()))
                .collect(),
        };
        guard.limiters.insert(tag.clone(), limiter);
        let tags = accounts.iter().map(|l| l.account_tag.clone()).collect();
        guard.journal.push(EngineOp::SetLimiter(tag.clone(), tags));
        Ok(())
    }

    async fn update_limiter(&self, tag: &Tag, accounts: &[AccountLimit]) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        let Some(limiter) = guard.limiters.get_mut(tag) else {
            return Err(Error::traffic_engine(format!("no limiter on {}", tag)));
        };
        for limit in accounts {
            limiter.accounts.insert(limit.account_tag.clone(), limit.clone());
        }
        let tags = accounts.iter().map(|l| l.account_tag.clone()).collect();
        guard.journal.push(EngineOp::UpdateLimiter(tag.clone(), tags));
        Ok(())
    }

    async fn remove_limiter(&self, tag: &Tag) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        if guard.limiters.remove(tag).is_none() {
            return Err(Error::traffic_engine(format!("no limiter on {}", tag)));
        }
        guard.journal.push(EngineOp::RemoveLimiter(tag.clone()));
        Ok(())
    }

    async fn bind_route(&self, outbound_tag: &Tag, account_tags: &[Tag]) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        if !guard.outbounds.contains_key(outbound_tag) {
            return Err(Error::traffic_engine(format!(
                "outbound {} not found",
                outbound_tag
            )));
        }
        for account_tag in account_tags {
            guard.routes.insert(account_tag.clone(), outbound_tag.clone());
        }
        guard
            .journal
            .push(EngineOp::BindRoute(outbound_tag.clone(), account_tags.to_vec()));
        Ok(())
    }

    async fn unbind_route(&self, account_tags: &[Tag]) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        for account_tag in account_tags {
            guard.routes.remove(account_tag);
        }
        guard.journal.push(EngineOp::UnbindRoute(account_tags.to_vec()));
        Ok(())
    }

    async fn bind_rules(&self, tag: &Tag, rules: &[DetectRule]) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.rules.insert(tag.clone(), rules.to_vec());
        let ids = rules.iter().map(|r| r.id).collect();
        guard.journal.push(EngineOp::BindRules(tag.clone(), ids));
        Ok(())
    }

    async fn unbind_rules(&self, tag: &Tag) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.rules.remove(tag);
        guard.journal.push(EngineOp::UnbindRules(tag.clone()));
        Ok(())
    }

    fn engine_name(&self) -> &'static str {
        "memory"
    }
}
