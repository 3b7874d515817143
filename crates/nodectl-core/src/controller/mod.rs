//! Reconciliation controller
//!
//! The Controller is responsible for:
//! - Initial provisioning of the node, its accounts and relay routes
//! - Periodically converging the traffic engine onto the remote snapshot
//! - Reporting traffic, online addresses and detection hits upstream
//! - Renewing the node's certificate
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!                 │  RemoteApi   │
//!                 └──────────────┘
//!                   ▲          │ snapshots
//!          reports  │          ▼
//!                 ┌──────────────┐       ┌───────────────┐
//!                 │  Controller  │──────▶│ TaskScheduler │
//!                 └──────────────┘       └───────────────┘
//!                         │    node-sync / traffic-sync / cert-renewal
//!         ┌───────────────┼───────────────────────┐
//!         ▼               ▼                       ▼
//! ┌──────────────┐ ┌──────────────┐      ┌─────────────────┐
//! │ NodeLayout   │ │ AccountDiff  │      │ RelayTopology   │
//! │ (tags)       │ │ + Builder    │      │ (routes)        │
//! └──────────────┘ └──────────────┘      └─────────────────┘
//!         └───────────────┴───────────┬───────────┘
//!                                     ▼
//!                            ┌────────────────┐
//!                            │ TrafficEngine  │
//!                            └────────────────┘
//! ```
//!
//! ## Node sync
//!
//! 1. Fetch descriptor, accounts and rules (`NotModified` reuses the
//!    previous snapshot, a fetch error aborts the tick)
//! 2. Descriptor changed: relay down, old node down, new node up, accounts,
//!    relay up
//! 3. Descriptor unchanged: apply the account diff, refresh relay routes
//! 4. Bind a fresh non-empty rule set
//!
//! All of the controller's state sits behind one mutex held for a whole
//! job, so node-sync and traffic-sync never interleave.

mod deadline;
mod events;
mod layout;

pub use events::ControllerEvent;
pub use layout::{LayoutEntry, NodeLayout};

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::account::{AccountBuilder, BuildParams, diff};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::model::{AccountRecord, ClientInfo, DetectRule, Fetch, NodeDescriptor, TrafficSample};
use crate::relay::RelayTopology;
use crate::scheduler::TaskScheduler;
use crate::tag::{self, Tag};
use crate::traits::{AccountLimit, CertificateManager, RemoteApi, RenewOutcome, TrafficEngine};
use deadline::{DeadlineEngine, bounded};

/// Lifecycle phase of a [`Controller`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uninitialized,
    Provisioned,
    /// Rebuilding the node under a new descriptor
    Retagging,
    Terminated,
}

/// Point-in-time view of the controller, for status endpoints and logs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub phase: Phase,
    pub node_tag: Option<Tag>,
    pub relay_tag: Option<Tag>,
    pub accounts: usize,
    pub relay_routes: usize,
    pub rules: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub last_node_sync: Option<DateTime<Utc>>,
    pub last_traffic_report: Option<DateTime<Utc>>,
}

struct ControllerState {
    /// `[{api_host}] {NodeType}(NodeID={id})`
    prefix: String,
    /// Last descriptor fetched, installed or not
    node: Option<NodeDescriptor>,
    /// Kept after a failed removal so the next rebuild resumes it
    installed: Option<NodeLayout>,
    /// Last account list fetched
    desired: Vec<AccountRecord>,
    /// Accounts the engine holds, plus those the builder skipped.
    /// Engine failures stay out so the next diff retries them.
    accounts: Vec<AccountRecord>,
    relay: RelayTopology,
    rules: Vec<DetectRule>,
    started_at: Option<DateTime<Utc>>,
    last_node_sync: Option<DateTime<Utc>>,
    last_traffic_report: Option<DateTime<Utc>>,
}

/// Keeps one proxy node converged on the remote management API
///
/// ## Lifecycle
///
/// 1. Create with [`Controller::new()`] and wrap in an `Arc`
/// 2. [`start()`](Controller::start) provisions the node and schedules jobs
/// 3. [`stop()`](Controller::stop) cancels the jobs; the engine keeps its
///    runtime objects
pub struct Controller {
    api: Arc<dyn RemoteApi>,
    engine: Arc<dyn TrafficEngine>,
    certificates: Option<Arc<dyn CertificateManager>>,
    config: ControllerConfig,
    client: ClientInfo,
    /// Written only while `state` is locked
    phase: watch::Sender<Phase>,
    state: Mutex<ControllerState>,
    scheduler: Mutex<Option<TaskScheduler>>,
    event_tx: mpsc::Sender<ControllerEvent>,
}

impl Controller {
    /// Create a new controller
    ///
    /// # Returns
    ///
    /// A tuple of (controller, event_receiver) where event_receiver yields
    /// controller events
    pub fn new(
        api: Arc<dyn RemoteApi>,
        engine: Arc<dyn TrafficEngine>,
        certificates: Option<Arc<dyn CertificateManager>>,
        config: ControllerConfig,
    ) -> Result<(Self, mpsc::Receiver<ControllerEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);
        let engine: Arc<dyn TrafficEngine> =
            Arc::new(DeadlineEngine::new(engine, config.request_timeout()));
        let client = api.describe();

        let (phase, _) = watch::channel(Phase::Uninitialized);
        let state = ControllerState {
            prefix: format!("[{}] (NodeID={})", client.api_host, client.node_id),
            node: None,
            installed: None,
            desired: Vec::new(),
            accounts: Vec::new(),
            relay: RelayTopology::new(engine.clone()),
            rules: Vec::new(),
            started_at: None,
            last_node_sync: None,
            last_traffic_report: None,
        };

        let controller = Self {
            api,
            engine,
            certificates,
            config,
            client,
            phase,
            state: Mutex::new(state),
            scheduler: Mutex::new(None),
            event_tx: tx,
        };

        Ok((controller, rx))
    }

    /// Provision the node and schedule the periodic jobs
    ///
    /// Fails with [`Error::Startup`] if the node cannot be brought up, in
    /// which case nothing is left installed in the engine.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        let phase = self.phase();
        if phase != Phase::Uninitialized {
            return Err(Error::invalid_state(format!(
                "cannot start a controller in phase {:?}",
                phase
            )));
        }

        let node = match self.call("node descriptor", self.api.node_descriptor()).await {
            Ok(Fetch::Modified(node)) => node,
            Ok(Fetch::NotModified) => {
                return Err(Error::startup("node descriptor is not available"));
            }
            Err(e) => return Err(Error::startup(format!("failed to fetch node descriptor: {}", e))),
        };
        let accounts = match self.call("account list", self.api.account_list()).await {
            Ok(Fetch::Modified(accounts)) => accounts,
            Ok(Fetch::NotModified) => return Err(Error::startup("account list is not available")),
            Err(e) => return Err(Error::startup(format!("failed to fetch account list: {}", e))),
        };

        state.prefix = log_prefix(&self.client, &node);
        let prefix = state.prefix.clone();
        let node_tag = tag::node_tag(&node);

        if node.relay {
            let relay = self
                .call("relay node descriptor", self.api.relay_node_descriptor())
                .await
                .map_err(|e| Error::startup(format!("failed to fetch relay node: {}", e)))?;
            let routes = state.relay.provision(&node, &node_tag, relay, &accounts).await;
            if let Some(relay_tag) = state.relay.active_tag().cloned() {
                self.emit_event(ControllerEvent::RelayProvisioned { relay_tag, routes });
            }
        }

        let (layout, settled) = match self.provision_node(&prefix, &node, &accounts).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                state.relay.teardown().await;
                return Err(Error::startup(format!("failed to provision node: {}", e)));
            }
        };
        info!("{} Started with {} account(s)", prefix, settled.len());

        match self.call("detection rules", self.api.detection_rules()).await {
            Ok(Fetch::Modified(rules)) if !rules.is_empty() => {
                match self.engine.bind_rules(&layout.tag, &rules).await {
                    Ok(()) => {
                        info!("{} Bound {} detection rule(s)", prefix, rules.len());
                        state.rules = rules;
                    }
                    Err(e) => warn!("{} Failed to bind detection rules: {}", prefix, e),
                }
            }
            Ok(_) => {}
            Err(e) => warn!("{} Failed to fetch detection rules: {}", prefix, e),
        }

        let started_tag = layout.tag.clone();
        let started_accounts = settled.len();
        state.node = Some(node.clone());
        state.desired = accounts;
        state.accounts = settled;
        state.installed = Some(layout);
        self.phase.send_replace(Phase::Provisioned);
        state.started_at = Some(Utc::now());
        drop(state);

        let mut scheduler = TaskScheduler::new();
        self.schedule(&mut scheduler, "node-sync", self.config.update_interval(), |c| async move {
            c.sync_node().await
        });
        self.schedule(&mut scheduler, "traffic-sync", self.config.traffic_interval(), |c| async move {
            c.sync_traffic().await
        });
        if node.wants_certificate_job() {
            self.schedule(&mut scheduler, "cert-renewal", self.config.cert_interval(), |c| async move {
                c.renew_certificate().await
            });
        }
        scheduler.start()?;
        *self.scheduler.lock().await = Some(scheduler);

        self.emit_event(ControllerEvent::Started {
            node_tag: started_tag,
            accounts: started_accounts,
        });
        Ok(())
    }

    /// Converge the engine onto the latest node snapshot
    pub async fn sync_node(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let phase = self.phase();
        if phase != Phase::Provisioned {
            debug!("{} Skipping node sync in phase {:?}", state.prefix, phase);
            return Ok(());
        }

        let node = match self.call("node descriptor", self.api.node_descriptor()).await? {
            Fetch::Modified(node) => node,
            Fetch::NotModified => state
                .node
                .clone()
                .ok_or_else(|| Error::invalid_state("no node descriptor cached"))?,
        };
        let accounts = match self.call("account list", self.api.account_list()).await? {
            Fetch::Modified(accounts) => accounts,
            Fetch::NotModified => state.desired.clone(),
        };
        let rules = match self.call("detection rules", self.api.detection_rules()).await {
            Ok(fetched) => fetched.modified(),
            Err(e) => {
                warn!("{} Failed to fetch detection rules: {}", state.prefix, e);
                None
            }
        };

        state.node = Some(node.clone());
        state.desired = accounts;

        let needs_retag = state
            .installed
            .as_ref()
            .is_none_or(|layout| !layout.is_intact() || layout.descriptor != node);
        if needs_retag {
            self.phase.send_replace(Phase::Retagging);
            let result = self.retag(&mut state, &node).await;
            self.phase.send_replace(Phase::Provisioned);
            result?;
        } else {
            self.reconcile_accounts(&mut state, &node).await?;
        }

        let node_tag = live_tag(&state);
        if let Some(rules) = rules
            && !rules.is_empty()
            && let Some(node_tag) = node_tag
        {
            match self.engine.bind_rules(&node_tag, &rules).await {
                Ok(()) => {
                    info!("{} Bound {} detection rule(s)", state.prefix, rules.len());
                    self.emit_event(ControllerEvent::RulesUpdated { rules: rules.len() });
                    state.rules = rules;
                }
                Err(e) => warn!("{} Failed to bind detection rules: {}", state.prefix, e),
            }
        }

        state.last_node_sync = Some(Utc::now());
        Ok(())
    }

    /// Report traffic, online addresses and detection hits
    ///
    /// Counters are only deducted after upstream acknowledged the report.
    /// Failures are logged and emitted as events; this never fails.
    pub async fn sync_traffic(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.phase() != Phase::Provisioned {
            return Ok(());
        }
        let Some(node_tag) = live_tag(&state) else {
            return Ok(());
        };
        let prefix = state.prefix.clone();

        let mut samples = Vec::new();
        let mut acknowledged = Vec::new();
        for account in &state.accounts {
            let account_tag = tag::account_tag(&node_tag, account);
            match self.engine.traffic(&account_tag).await {
                Ok(counters) if !counters.is_zero() => {
                    samples.push(TrafficSample {
                        uid: account.uid,
                        label: account.label.clone(),
                        upload: counters.upload,
                        download: counters.download,
                    });
                    acknowledged.push((account_tag, counters));
                }
                Ok(_) => {}
                Err(e) => warn!("{} [UID: {}] failed to read traffic: {}", prefix, account.uid, e),
            }
        }

        if !samples.is_empty() {
            match self.call("traffic report", self.api.report_traffic(&samples)).await {
                Ok(()) => {
                    for (account_tag, counters) in &acknowledged {
                        if let Err(e) = self.engine.reset_traffic(account_tag, *counters).await {
                            warn!("{} Failed to reset traffic of {}: {}", prefix, account_tag, e);
                        }
                    }
                    let upload = samples.iter().map(|s| s.upload).sum();
                    let download = samples.iter().map(|s| s.download).sum();
                    debug!("{} Reported traffic of {} account(s)", prefix, samples.len());
                    state.last_traffic_report = Some(Utc::now());
                    self.emit_event(ControllerEvent::TrafficReported {
                        accounts: samples.len(),
                        upload,
                        download,
                    });
                }
                Err(e) => {
                    warn!("{} Failed to report traffic: {}", prefix, e);
                    self.emit_event(ControllerEvent::TrafficReportFailed {
                        accounts: samples.len(),
                        error: e.to_string(),
                    });
                }
            }
        }

        match self.engine.online_ips(&node_tag).await {
            Ok(online) if !online.is_empty() => {
                match self.call("online report", self.api.report_online_ips(&online)).await {
                    Ok(()) => {
                        debug!("{} Reported {} online address(es)", prefix, online.len());
                        self.emit_event(ControllerEvent::OnlineIpsReported {
                            count: online.len(),
                        });
                    }
                    Err(e) => warn!("{} Failed to report online addresses: {}", prefix, e),
                }
            }
            Ok(_) => {}
            Err(e) => warn!("{} Failed to read online addresses: {}", prefix, e),
        }

        match self.engine.detections(&node_tag).await {
            Ok(hits) if !hits.is_empty() => {
                for hit in &hits {
                    info!("{} [UID: {}] hit detection rule {}", prefix, hit.uid, hit.rule_id);
                }
                self.emit_event(ControllerEvent::DetectionsObserved { hits });
            }
            Ok(_) => {}
            Err(e) => warn!("{} Failed to read detection hits: {}", prefix, e),
        }

        Ok(())
    }

    /// Renew the node's certificate when it is managed by ACME
    pub async fn renew_certificate(&self) -> Result<()> {
        let (node, prefix) = {
            let state = self.state.lock().await;
            (state.node.clone(), state.prefix.clone())
        };
        let Some(node) = node else {
            return Ok(());
        };
        if !node.uses_tls() || !node.cert_mode.is_managed() {
            debug!("{} Certificate mode {:?} is not renewed here", prefix, node.cert_mode);
            return Ok(());
        }
        let Some(certificates) = self.certificates.as_ref() else {
            debug!("{} No certificate manager configured", prefix);
            return Ok(());
        };

        let renewal = certificates.renew(node.cert_mode, &node.cert_domain);
        match self.call("certificate renewal", renewal).await {
            Ok(RenewOutcome::Renewed) => {
                info!("{} Renewed certificate for {}", prefix, node.cert_domain);
                self.emit_event(ControllerEvent::CertificateRenewed {
                    domain: node.cert_domain.clone(),
                });
                Ok(())
            }
            Ok(RenewOutcome::NotDue) => {
                debug!("{} Certificate for {} is not due", prefix, node.cert_domain);
                Ok(())
            }
            Err(e) => {
                error!("{} Failed to renew certificate: {}", prefix, e);
                Err(e)
            }
        }
    }

    /// Stop the periodic jobs
    ///
    /// In-flight jobs get `grace` to finish. Runtime objects stay installed
    /// in the engine.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        let scheduler = self.scheduler.lock().await.take();
        let result = match scheduler {
            Some(mut scheduler) => scheduler.stop(grace).await,
            None => Ok(()),
        };

        let mut state = self.state.lock().await;
        self.phase.send_replace(Phase::Terminated);
        info!("{} Stopped", state.prefix);
        self.emit_event(ControllerEvent::Stopped {
            reason: "stop requested".to_string(),
        });
        result
    }

    /// Stop with the configured grace period
    pub async fn shutdown(&self) -> Result<()> {
        self.stop(self.config.shutdown_grace()).await
    }

    /// Start, then run until `signal` resolves
    pub async fn run_until<F>(self: &Arc<Self>, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        info!("Shutdown signal received");
        self.shutdown().await
    }

    /// Start, then run until SIGINT
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
    }

    /// Current phase; readable while a job holds the controller
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver notified on every phase change
    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Tag of the installed node, if any
    pub async fn current_tag(&self) -> Option<Tag> {
        live_tag(&*self.state.lock().await)
    }

    pub async fn relay_tag(&self) -> Option<Tag> {
        self.state.lock().await.relay.active_tag().cloned()
    }

    /// Settled accounts, sorted by UID
    pub async fn provisioned_accounts(&self) -> Vec<AccountRecord> {
        self.state.lock().await.accounts.clone()
    }

    pub async fn status(&self) -> ControllerStatus {
        let state = self.state.lock().await;
        ControllerStatus {
            phase: self.phase(),
            node_tag: live_tag(&state),
            relay_tag: state.relay.active_tag().cloned(),
            accounts: state.accounts.len(),
            relay_routes: state.relay.route_count(),
            rules: state.rules.len(),
            started_at: state.started_at,
            last_node_sync: state.last_node_sync,
            last_traffic_report: state.last_traffic_report,
        }
    }

    /// Rebuild the node in the fixed order: relay down, old node down,
    /// new node up with its accounts, relay up
    async fn retag(&self, state: &mut ControllerState, node: &NodeDescriptor) -> Result<()> {
        let old_prefix = state.prefix.clone();

        if let Some(relay_tag) = state.relay.teardown().await {
            self.emit_event(ControllerEvent::RelayTornDown { relay_tag });
        }

        let old_tag = match state.installed.take() {
            Some(mut old) => {
                if let Err(e) = self.remove_node(&old_prefix, &mut old, &state.accounts).await {
                    state.installed = Some(old);
                    return Err(e);
                }
                state.accounts.clear();
                Some(old.tag)
            }
            None => None,
        };

        state.prefix = log_prefix(&self.client, node);
        let prefix = state.prefix.clone();
        let desired = state.desired.clone();
        let (layout, settled) = self.provision_node(&prefix, node, &desired).await?;
        info!(
            "{} Node rebuilt as {} with {} account(s)",
            prefix,
            layout.tag,
            settled.len()
        );

        if !state.rules.is_empty()
            && let Err(e) = self.engine.bind_rules(&layout.tag, &state.rules).await
        {
            warn!("{} Failed to rebind detection rules: {}", prefix, e);
        }

        let new_tag = layout.tag.clone();
        state.installed = Some(layout);
        state.accounts = settled;
        self.emit_event(ControllerEvent::NodeRetagged {
            old_tag,
            new_tag: new_tag.clone(),
        });

        if node.relay {
            self.refresh_relay(state, node, &new_tag).await;
        }
        Ok(())
    }

    /// Apply the account diff to an unchanged node
    async fn reconcile_accounts(&self, state: &mut ControllerState, node: &NodeDescriptor) -> Result<()> {
        let Some(node_tag) = live_tag(state) else {
            return Ok(());
        };
        let prefix = state.prefix.clone();
        let changes = diff(&state.accounts, &state.desired);

        if !changes.is_empty() {
            state.relay.remove_routes(&changes.removed).await;

            if !changes.removed.is_empty() {
                let tags: Vec<Tag> = changes
                    .removed
                    .iter()
                    .map(|account| tag::account_tag(&node_tag, account))
                    .collect();
                self.engine.remove_accounts(&node_tag, &tags).await?;
            }
            let mut accounts: Vec<AccountRecord> = state
                .accounts
                .iter()
                .filter(|account| !changes.removed.contains(account))
                .cloned()
                .collect();

            let settled = self.add_accounts(&prefix, &node_tag, node, &changes.added).await;
            if !settled.is_empty() {
                let limits: Vec<AccountLimit> = settled
                    .iter()
                    .map(|account| AccountLimit::for_account(&node_tag, account))
                    .collect();
                if let Err(e) = self.engine.update_limiter(&node_tag, &limits).await {
                    warn!("{} Failed to update limiter: {}", prefix, e);
                }
            }

            info!(
                "{} {} account(s) added, {} removed",
                prefix,
                settled.len(),
                changes.removed.len()
            );
            self.emit_event(ControllerEvent::AccountsReconciled {
                added: settled.len(),
                removed: changes.removed.len(),
            });

            accounts.extend(settled);
            accounts.sort();
            state.accounts = accounts;
        }

        if node.relay && (!state.relay.is_active() || !changes.is_empty()) {
            self.refresh_relay(state, node, &node_tag).await;
        }
        Ok(())
    }

    /// Fetch the relay target and bring routes in line with it
    ///
    /// A fetch failure leaves the relay as is; the next tick retries.
    async fn refresh_relay(&self, state: &mut ControllerState, node: &NodeDescriptor, node_tag: &Tag) {
        let relay = match self
            .call("relay node descriptor", self.api.relay_node_descriptor())
            .await
        {
            Ok(relay) => relay,
            Err(e) => {
                warn!("{} Failed to fetch relay node: {}", state.prefix, e);
                return;
            }
        };

        if state.relay.is_active_for(node, &relay) {
            let added = state.relay.add_routes(node_tag, &state.accounts).await;
            if added > 0 {
                debug!("{} Added {} relay route(s)", state.prefix, added);
            }
            return;
        }

        if let Some(relay_tag) = state.relay.active_tag().cloned() {
            self.emit_event(ControllerEvent::RelayTornDown { relay_tag });
        }
        let routes = state.relay.provision(node, node_tag, relay, &state.accounts).await;
        if let Some(relay_tag) = state.relay.active_tag().cloned() {
            self.emit_event(ControllerEvent::RelayProvisioned { relay_tag, routes });
        }
    }

    /// Install layout, accounts and limiter for `node`
    ///
    /// On failure everything installed here is removed again.
    async fn provision_node(
        &self,
        prefix: &str,
        node: &NodeDescriptor,
        records: &[AccountRecord],
    ) -> Result<(NodeLayout, Vec<AccountRecord>)> {
        let mut layout = NodeLayout::plan(node)?;
        layout.install(self.engine.as_ref()).await?;

        let settled = self.add_accounts(prefix, &layout.tag, node, records).await;
        let limits: Vec<AccountLimit> = settled
            .iter()
            .map(|account| AccountLimit::for_account(&layout.tag, account))
            .collect();
        if let Err(e) = self
            .engine
            .set_inbound_limiter(&layout.tag, node.speed_limit, &limits)
            .await
        {
            warn!("{} Failed to install limiter, rolling back: {}", prefix, e);
            let tags: Vec<Tag> = limits.into_iter().map(|limit| limit.account_tag).collect();
            if let Err(e) = self.engine.remove_accounts(&layout.tag, &tags).await {
                warn!("{} Rollback: failed to remove accounts: {}", prefix, e);
            }
            if let Err(e) = layout.remove(self.engine.as_ref()).await {
                warn!("{} Rollback: failed to remove node: {}", prefix, e);
            }
            return Err(e);
        }

        Ok((layout, settled))
    }

    /// Remove the node's rules, accounts, listeners and limiter
    ///
    /// Only listener removal is fatal; the rest is best effort. A layout
    /// left half removed by an earlier failure only has its remaining
    /// listeners and limiter removed.
    async fn remove_node(&self, prefix: &str, layout: &mut NodeLayout, accounts: &[AccountRecord]) -> Result<()> {
        if layout.is_intact() {
            if let Err(e) = self.engine.unbind_rules(&layout.tag).await {
                warn!("{} Failed to unbind detection rules: {}", prefix, e);
            }
            let tags: Vec<Tag> = accounts
                .iter()
                .map(|account| tag::account_tag(&layout.tag, account))
                .collect();
            if !tags.is_empty()
                && let Err(e) = self.engine.remove_accounts(&layout.tag, &tags).await
            {
                warn!("{} Failed to remove accounts: {}", prefix, e);
            }
        }
        layout.remove(self.engine.as_ref()).await?;
        if let Err(e) = self.engine.remove_limiter(&layout.tag).await {
            warn!("{} Failed to remove limiter: {}", prefix, e);
        }
        info!("{} Removed node {}", prefix, layout.tag);
        Ok(())
    }

    /// Attach accounts to `node_tag` and return those that settled
    ///
    /// The batch add goes first; if the engine rejects it, whatever part of
    /// the batch did land is detached and accounts are added one by one,
    /// leaving individual failures out.
    async fn add_accounts(
        &self,
        prefix: &str,
        node_tag: &Tag,
        node: &NodeDescriptor,
        records: &[AccountRecord],
    ) -> Vec<AccountRecord> {
        let built = AccountBuilder::new(node_tag).build(
            records,
            node.node_type,
            &BuildParams::from_node(node),
        );

        let mut failed = HashSet::new();
        if !built.is_empty()
            && let Err(e) = self.engine.add_accounts(node_tag, &built).await
        {
            warn!(
                "{} Batch add of {} account(s) failed, adding one by one: {}",
                prefix,
                built.len(),
                e
            );
            let tags: Vec<Tag> = built.iter().map(|account| account.tag.clone()).collect();
            if let Err(e) = self.engine.remove_accounts(node_tag, &tags).await {
                warn!("{} Failed to detach partial batch: {}", prefix, e);
            }
            for account in &built {
                if let Err(e) = self
                    .engine
                    .add_accounts(node_tag, std::slice::from_ref(account))
                    .await
                {
                    warn!("{} [UID: {}] failed to add account: {}", prefix, account.uid, e);
                    failed.insert(account.tag.clone());
                }
            }
        }

        let mut settled: Vec<AccountRecord> = records
            .iter()
            .filter(|record| !failed.contains(&tag::account_tag(node_tag, record)))
            .cloned()
            .collect();
        settled.sort();
        settled
    }

    fn schedule<F, Fut>(self: &Arc<Self>, scheduler: &mut TaskScheduler, name: &'static str, interval: Duration, run: F)
    where
        F: Fn(Arc<Controller>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let controller = Arc::downgrade(self);
        scheduler.add_job(name, interval, move || {
            let controller = controller.upgrade();
            let pending = controller.as_ref().map(|c| run(Arc::clone(c)));
            async move {
                let (Some(controller), Some(pending)) = (controller, pending) else {
                    return Ok(());
                };
                let result = pending.await;
                if let Err(e) = &result {
                    controller.emit_event(ControllerEvent::SyncFailed {
                        job: name.to_string(),
                        error: e.to_string(),
                    });
                }
                result
            }
        });
    }

    /// Bound a collaborator call by the request timeout
    async fn call<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        bounded(self.config.request_timeout(), what, fut).await
    }

    fn emit_event(&self, event: ControllerEvent) {
        // Dropped rather than blocking a sync on a slow consumer
        if self.event_tx.try_send(event).is_err() {
            warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
        }
    }
}

/// Tag of the installed node, unless its removal has begun
fn live_tag(state: &ControllerState) -> Option<Tag> {
    state
        .installed
        .as_ref()
        .filter(|layout| layout.is_intact())
        .map(|layout| layout.tag.clone())
}

fn log_prefix(client: &ClientInfo, node: &NodeDescriptor) -> String {
    format!("[{}] {}(NodeID={})", client.api_host, node.node_type, node.node_id)
}
