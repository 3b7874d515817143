//! Test doubles and common utilities for controller contract tests
//!
//! The doubles are deliberately small: a remote API answering from
//! scripted queues, a traffic engine that injects failures in front of
//! `MemoryTrafficEngine`, and a counting certificate manager.

#![allow(dead_code)]

use async_trait::async_trait;
use nodectl_core::account::AccountDescriptor;
use nodectl_core::error::{Error, Result};
use nodectl_core::model::{
    AccountRecord, CertMode, ClientInfo, DetectResult, DetectRule, Fetch, NodeDescriptor,
    NodeType, OnlineIp, RelayNodeDescriptor, TrafficCounters, TrafficSample,
};
use nodectl_core::tag::Tag;
use nodectl_core::traits::{
    AccountLimit, CertificateManager, InboundConfig, OutboundConfig, RemoteApi, RenewOutcome,
    TrafficEngine,
};
use nodectl_core::{Controller, ControllerConfig, ControllerEvent, MemoryTrafficEngine};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One scripted answer; an empty queue answers `NotModified`
enum Step<T> {
    Fresh(T),
    Fail(String),
}

struct Script<T> {
    queue: Mutex<VecDeque<Step<T>>>,
    calls: AtomicUsize,
    /// Fail every call regardless of the queue
    always_fail: AtomicBool,
}

impl<T> Script<T> {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            always_fail: AtomicBool::new(false),
        }
    }

    fn push(&self, step: Step<T>) {
        self.queue.lock().unwrap().push_back(step);
    }

    fn next(&self, what: &str) -> Result<Fetch<T>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(Error::remote_api(format!("{} unavailable", what)));
        }
        match self.queue.lock().unwrap().pop_front() {
            Some(Step::Fresh(value)) => Ok(Fetch::Modified(value)),
            Some(Step::Fail(msg)) => Err(Error::remote_api(msg)),
            None => Ok(Fetch::NotModified),
        }
    }
}

struct ApiState {
    node: Script<NodeDescriptor>,
    accounts: Script<Vec<AccountRecord>>,
    rules: Script<Vec<DetectRule>>,
    relay: Mutex<Option<RelayNodeDescriptor>>,
    relay_calls: AtomicUsize,
    reject_reports: AtomicBool,
    traffic_reports: Mutex<Vec<Vec<TrafficSample>>>,
    online_reports: Mutex<Vec<Vec<OnlineIp>>>,
}

/// A RemoteApi answering from per-resource queues
///
/// Each `set_*` call queues one `Modified` answer; once a queue is drained
/// the resource answers `NotModified`, the way an ETag-aware panel does.
/// Clones share state, so a test can keep a handle after moving one into
/// the controller.
#[derive(Clone)]
pub struct ScriptedApi {
    inner: Arc<ApiState>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ApiState {
                node: Script::new(),
                accounts: Script::new(),
                rules: Script::new(),
                relay: Mutex::new(None),
                relay_calls: AtomicUsize::new(0),
                reject_reports: AtomicBool::new(false),
                traffic_reports: Mutex::new(Vec::new()),
                online_reports: Mutex::new(Vec::new()),
            }),
        }
    }

    /// API already holding a node and its accounts
    pub fn with_node(node: NodeDescriptor, accounts: Vec<AccountRecord>) -> Self {
        let api = Self::new();
        api.set_node(node);
        api.set_accounts(accounts);
        api
    }

    pub fn set_node(&self, node: NodeDescriptor) {
        self.inner.node.push(Step::Fresh(node));
    }

    pub fn fail_node_once(&self, msg: &str) {
        self.inner.node.push(Step::Fail(msg.to_string()));
    }

    pub fn fail_node_always(&self, fail: bool) {
        self.inner.node.always_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_accounts(&self, accounts: Vec<AccountRecord>) {
        self.inner.accounts.push(Step::Fresh(accounts));
    }

    pub fn fail_accounts_once(&self, msg: &str) {
        self.inner.accounts.push(Step::Fail(msg.to_string()));
    }

    pub fn set_rules(&self, rules: Vec<DetectRule>) {
        self.inner.rules.push(Step::Fresh(rules));
    }

    pub fn fail_rules_once(&self, msg: &str) {
        self.inner.rules.push(Step::Fail(msg.to_string()));
    }

    pub fn set_relay(&self, relay: Option<RelayNodeDescriptor>) {
        *self.inner.relay.lock().unwrap() = relay;
    }

    pub fn reject_reports(&self, reject: bool) {
        self.inner.reject_reports.store(reject, Ordering::SeqCst);
    }

    pub fn node_call_count(&self) -> usize {
        self.inner.node.calls.load(Ordering::SeqCst)
    }

    pub fn relay_call_count(&self) -> usize {
        self.inner.relay_calls.load(Ordering::SeqCst)
    }

    /// Reports upstream accepted, oldest first
    pub fn traffic_reports(&self) -> Vec<Vec<TrafficSample>> {
        self.inner.traffic_reports.lock().unwrap().clone()
    }

    pub fn online_reports(&self) -> Vec<Vec<OnlineIp>> {
        self.inner.online_reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteApi for ScriptedApi {
    fn describe(&self) -> ClientInfo {
        ClientInfo {
            api_host: "panel.test".to_string(),
            node_id: 1,
        }
    }

    async fn node_descriptor(&self) -> Result<Fetch<NodeDescriptor>> {
        self.inner.node.next("node descriptor")
    }

    async fn relay_node_descriptor(&self) -> Result<RelayNodeDescriptor> {
        self.inner.relay_calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .relay
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::remote_api("relay node not found"))
    }

    async fn account_list(&self) -> Result<Fetch<Vec<AccountRecord>>> {
        self.inner.accounts.next("account list")
    }

    async fn detection_rules(&self) -> Result<Fetch<Vec<DetectRule>>> {
        self.inner.rules.next("detection rules")
    }

    async fn report_online_ips(&self, online: &[OnlineIp]) -> Result<()> {
        if self.inner.reject_reports.load(Ordering::SeqCst) {
            return Err(Error::report("online report rejected"));
        }
        self.inner.online_reports.lock().unwrap().push(online.to_vec());
        Ok(())
    }

    async fn report_traffic(&self, samples: &[TrafficSample]) -> Result<()> {
        if self.inner.reject_reports.load(Ordering::SeqCst) {
            return Err(Error::report("traffic report rejected"));
        }
        self.inner.traffic_reports.lock().unwrap().push(samples.to_vec());
        Ok(())
    }
}

/// A TrafficEngine that injects failures in front of a MemoryTrafficEngine
#[derive(Clone)]
pub struct FailingEngine {
    pub memory: MemoryTrafficEngine,
    fail_batch_adds: Arc<AtomicBool>,
    fail_uids: Arc<Mutex<HashSet<u32>>>,
    fail_limiter: Arc<AtomicBool>,
    fail_add_inbound: Arc<AtomicBool>,
    fail_next_outbound_removal: Arc<AtomicBool>,
    partial_batches: Arc<AtomicBool>,
    traffic_delay: Arc<Mutex<Option<Duration>>>,
    removal_delay: Arc<Mutex<Option<Duration>>>,
}

impl FailingEngine {
    pub fn new(memory: MemoryTrafficEngine) -> Self {
        Self {
            memory,
            fail_batch_adds: Arc::new(AtomicBool::new(false)),
            fail_uids: Arc::new(Mutex::new(HashSet::new())),
            fail_limiter: Arc::new(AtomicBool::new(false)),
            fail_add_inbound: Arc::new(AtomicBool::new(false)),
            fail_next_outbound_removal: Arc::new(AtomicBool::new(false)),
            partial_batches: Arc::new(AtomicBool::new(false)),
            traffic_delay: Arc::new(Mutex::new(None)),
            removal_delay: Arc::new(Mutex::new(None)),
        }
    }

    /// Reject any add_accounts call carrying more than one account
    pub fn fail_batch_adds(&self, fail: bool) {
        self.fail_batch_adds.store(fail, Ordering::SeqCst);
    }

    /// Reject any add_accounts call carrying one of these UIDs
    pub fn fail_uids(&self, uids: &[u32]) {
        *self.fail_uids.lock().unwrap() = uids.iter().copied().collect();
    }

    pub fn fail_limiter(&self, fail: bool) {
        self.fail_limiter.store(fail, Ordering::SeqCst);
    }

    pub fn fail_add_inbound(&self, fail: bool) {
        self.fail_add_inbound.store(fail, Ordering::SeqCst);
    }

    /// Fail the next remove_outbound call, then behave again
    pub fn fail_next_outbound_removal(&self) {
        self.fail_next_outbound_removal.store(true, Ordering::SeqCst);
    }

    /// Attach only the first account of a multi-account add, then fail
    pub fn apply_batches_partially(&self, partial: bool) {
        self.partial_batches.store(partial, Ordering::SeqCst);
    }

    /// Delay every traffic read
    pub fn slow_traffic(&self, delay: Duration) {
        *self.traffic_delay.lock().unwrap() = Some(delay);
    }

    /// Delay every inbound removal
    pub fn slow_removals(&self, delay: Duration) {
        *self.removal_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl TrafficEngine for FailingEngine {
    async fn add_inbound(&self, config: InboundConfig) -> Result<()> {
        if self.fail_add_inbound.load(Ordering::SeqCst) {
            return Err(Error::traffic_engine("port in use"));
        }
        self.memory.add_inbound(config).await
    }

    async fn remove_inbound(&self, tag: &Tag) -> Result<()> {
        let delay = *self.removal_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.memory.remove_inbound(tag).await
    }

    async fn add_outbound(&self, config: OutboundConfig) -> Result<()> {
        self.memory.add_outbound(config).await
    }

    async fn remove_outbound(&self, tag: &Tag) -> Result<()> {
        if self.fail_next_outbound_removal.swap(false, Ordering::SeqCst) {
            return Err(Error::traffic_engine("outbound manager busy"));
        }
        self.memory.remove_outbound(tag).await
    }

    async fn add_accounts(&self, tag: &Tag, accounts: &[AccountDescriptor]) -> Result<()> {
        if accounts.len() > 1 && self.fail_batch_adds.load(Ordering::SeqCst) {
            return Err(Error::traffic_engine("batch add rejected"));
        }
        let rejected = {
            let fail_uids = self.fail_uids.lock().unwrap();
            accounts.iter().any(|a| fail_uids.contains(&a.uid))
        };
        if rejected {
            return Err(Error::traffic_engine("account rejected"));
        }
        if accounts.len() > 1 && self.partial_batches.load(Ordering::SeqCst) {
            self.memory.add_accounts(tag, &accounts[..1]).await?;
            return Err(Error::traffic_engine("batch add interrupted"));
        }
        self.memory.add_accounts(tag, accounts).await
    }

    async fn remove_accounts(&self, tag: &Tag, account_tags: &[Tag]) -> Result<()> {
        self.memory.remove_accounts(tag, account_tags).await
    }

    async fn traffic(&self, account_tag: &Tag) -> Result<TrafficCounters> {
        let delay = *self.traffic_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.memory.traffic(account_tag).await
    }

    async fn reset_traffic(&self, account_tag: &Tag, acknowledged: TrafficCounters) -> Result<()> {
        self.memory.reset_traffic(account_tag, acknowledged).await
    }

    async fn online_ips(&self, tag: &Tag) -> Result<Vec<OnlineIp>> {
        self.memory.online_ips(tag).await
    }

    async fn detections(&self, tag: &Tag) -> Result<Vec<DetectResult>> {
        self.memory.detections(tag).await
    }

    async fn set_inbound_limiter(
        &self,
        tag: &Tag,
        global_limit: u64,
        accounts: &[AccountLimit],
    ) -> Result<()> {
        if self.fail_limiter.load(Ordering::SeqCst) {
            return Err(Error::traffic_engine("limiter rejected"));
        }
        self.memory.set_inbound_limiter(tag, global_limit, accounts).await
    }

    async fn update_limiter(&self, tag: &Tag, accounts: &[AccountLimit]) -> Result<()> {
        self.memory.update_limiter(tag, accounts).await
    }

    async fn remove_limiter(&self, tag: &Tag) -> Result<()> {
        self.memory.remove_limiter(tag).await
    }

    async fn bind_route(&self, outbound_tag: &Tag, account_tags: &[Tag]) -> Result<()> {
        self.memory.bind_route(outbound_tag, account_tags).await
    }

    async fn unbind_route(&self, account_tags: &[Tag]) -> Result<()> {
        self.memory.unbind_route(account_tags).await
    }

    async fn bind_rules(&self, tag: &Tag, rules: &[DetectRule]) -> Result<()> {
        self.memory.bind_rules(tag, rules).await
    }

    async fn unbind_rules(&self, tag: &Tag) -> Result<()> {
        self.memory.unbind_rules(tag).await
    }

    fn engine_name(&self) -> &'static str {
        "failing"
    }
}

/// A certificate manager that counts renewals
pub struct MockCertificateManager {
    renew_call_count: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl MockCertificateManager {
    pub fn new() -> Self {
        Self {
            renew_call_count: Arc::new(AtomicUsize::new(0)),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a new MockCertificateManager that shares counters with an existing one
    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            renew_call_count: Arc::clone(&other.renew_call_count),
            fail: Arc::clone(&other.fail),
        }
    }

    pub fn renew_call_count(&self) -> usize {
        self.renew_call_count.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CertificateManager for MockCertificateManager {
    async fn renew(&self, _mode: CertMode, domain: &str) -> Result<RenewOutcome> {
        self.renew_call_count.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::certificate(format!("ACME order for {} failed", domain)));
        }
        Ok(RenewOutcome::Renewed)
    }
}

/// Shortest intervals the configuration accepts
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        update_periodic_secs: 1,
        traffic_periodic_secs: 1,
        cert_periodic_secs: 1,
        request_timeout_secs: 1,
        shutdown_grace_secs: 1,
        event_channel_capacity: 100,
    }
}

pub fn vless_node(port: u16) -> NodeDescriptor {
    NodeDescriptor::new(NodeType::Vless, 1, port)
}

pub fn relayed_node(port: u16) -> NodeDescriptor {
    let mut node = vless_node(port);
    node.relay = true;
    node.relay_node_id = 9;
    node
}

pub fn relay_target(node_id: u32) -> RelayNodeDescriptor {
    RelayNodeDescriptor::new(NodeType::Vless, node_id, 443, "relay.example.net")
}

pub fn tls_node(port: u16, mode: CertMode) -> NodeDescriptor {
    let mut node = vless_node(port);
    node.tls_type = "tls".to_string();
    node.cert_mode = mode;
    node.cert_domain = "node.example.net".to_string();
    node
}

pub fn account(uid: u32) -> AccountRecord {
    AccountRecord::new(uid, format!("user{}@example.com", uid), format!("uuid-{}", uid))
        .with_secret("0123456789abcdef0123456789abcdef")
}

pub fn accounts(uids: &[u32]) -> Vec<AccountRecord> {
    uids.iter().copied().map(account).collect()
}

pub fn account_tag(node_tag: &str, uid: u32) -> Tag {
    Tag::new(format!("{}|user{}@example.com|{}", node_tag, uid, uid))
}

/// Controller over `api` and `engine` with [`fast_config`]
pub fn controller(
    api: &ScriptedApi,
    engine: impl TrafficEngine + 'static,
) -> (Arc<Controller>, mpsc::Receiver<ControllerEvent>) {
    controller_with_certificates(api, engine, None)
}

pub fn controller_with_certificates(
    api: &ScriptedApi,
    engine: impl TrafficEngine + 'static,
    certificates: Option<Arc<dyn CertificateManager>>,
) -> (Arc<Controller>, mpsc::Receiver<ControllerEvent>) {
    let (controller, events) = Controller::new(
        Arc::new(api.clone()),
        Arc::new(engine),
        certificates,
        fast_config(),
    )
    .expect("controller construction succeeds");
    (Arc::new(controller), events)
}

/// Everything currently buffered in the event channel
pub fn drain_events(rx: &mut mpsc::Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
