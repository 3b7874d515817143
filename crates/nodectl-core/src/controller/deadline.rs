//! Per-call deadlines for collaborators
//!
//! Every remote API and traffic engine call made by the controller is
//! bounded by the configured request timeout. An elapsed call surfaces as
//! [`Error::Timeout`] and is handled like any other transient failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::Error;
use crate::account::AccountDescriptor;
use crate::model::{DetectResult, DetectRule, OnlineIp, TrafficCounters};
use crate::tag::Tag;
use crate::traits::{AccountLimit, InboundConfig, OutboundConfig, TrafficEngine};

/// Run `fut` with a deadline, mapping expiry to [`Error::Timeout`]
pub(crate) async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("{} after {:?}", what, timeout))),
    }
}

/// Traffic engine whose every call is bounded by a deadline
pub(crate) struct DeadlineEngine {
    inner: Arc<dyn TrafficEngine>,
    timeout: Duration,
}

impl DeadlineEngine {
    pub(crate) fn new(inner: Arc<dyn TrafficEngine>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl TrafficEngine for DeadlineEngine {
    async fn add_inbound(&self, config: InboundConfig) -> Result<(), Error> {
        bounded(self.timeout, "add_inbound", self.inner.add_inbound(config)).await
    }

    async fn remove_inbound(&self, tag: &Tag) -> Result<(), Error> {
        bounded(self.timeout, "remove_inbound", self.inner.remove_inbound(tag)).await
    }

    async fn add_outbound(&self, config: OutboundConfig) -> Result<(), Error> {
        bounded(self.timeout, "add_outbound", self.inner.add_outbound(config)).await
    }

    async fn remove_outbound(&self, tag: &Tag) -> Result<(), Error> {
        bounded(self.timeout, "remove_outbound", self.inner.remove_outbound(tag)).await
    }

    async fn add_accounts(&self, tag: &Tag, accounts: &[AccountDescriptor]) -> Result<(), Error> {
        bounded(self.timeout, "add_accounts", self.inner.add_accounts(tag, accounts)).await
    }

    async fn remove_accounts(&self, tag: &Tag, account_tags: &[Tag]) -> Result<(), Error> {
        bounded(
            self.timeout,
            "remove_accounts",
            self.inner.remove_accounts(tag, account_tags),
        )
        .await
    }

    async fn traffic(&self, account_tag: &Tag) -> Result<TrafficCounters, Error> {
        bounded(self.timeout, "traffic", self.inner.traffic(account_tag)).await
    }

    async fn reset_traffic(&self, account_tag: &Tag, acknowledged: TrafficCounters) -> Result<(), Error> {
        bounded(
            self.timeout,
            "reset_traffic",
            self.inner.reset_traffic(account_tag, acknowledged),
        )
        .await
    }

    async fn online_ips(&self, tag: &Tag) -> Result<Vec<OnlineIp>, Error> {
        bounded(self.timeout, "online_ips", self.inner.online_ips(tag)).await
    }

    async fn detections(&self, tag: &Tag) -> Result<Vec<DetectResult>, Error> {
        bounded(self.timeout, "detections", self.inner.detections(tag)).await
    }

    async fn set_inbound_limiter(
        &self,
        tag: &Tag,
        global_limit: u64,
        accounts: &[AccountLimit],
    ) -> Result<(), Error> {
        bounded(
            self.timeout,
            "set_inbound_limiter",
            self.inner.set_inbound_limiter(tag, global_limit, accounts),
        )
        .await
    }

    async fn update_limiter(&self, tag: &Tag, accounts: &[AccountLimit]) -> Result<(), Error> {
        bounded(self.timeout, "update_limiter", self.inner.update_limiter(tag, accounts)).await
    }

    async fn remove_limiter(&self, tag: &Tag) -> Result<(), Error> {
        bounded(self.timeout, "remove_limiter", self.inner.remove_limiter(tag)).await
    }

    async fn bind_route(&self, outbound_tag: &Tag, account_tags: &[Tag]) -> Result<(), Error> {
        bounded(
            self.timeout,
            "bind_route",
            self.inner.bind_route(outbound_tag, account_tags),
        )
        .await
    }

    async fn unbind_route(&self, account_tags: &[Tag]) -> Result<(), Error> {
        bounded(self.timeout, "unbind_route", self.inner.unbind_route(account_tags)).await
    }

    async fn bind_rules(&self, tag: &Tag, rules: &[DetectRule]) -> Result<(), Error> {
        bounded(self.timeout, "bind_rules", self.inner.bind_rules(tag, rules)).await
    }

    async fn unbind_rules(&self, tag: &Tag) -> Result<(), Error> {
        bounded(self.timeout, "unbind_rules", self.inner.unbind_rules(tag)).await
    }

    fn engine_name(&self) -> &'static str {
        self.inner.engine_name()
    }
}
