use crate::model::DetectResult;
use crate::tag::Tag;

/// Events emitted by the [`Controller`](super::Controller)
///
/// Delivered over a bounded channel; when the receiver falls behind,
/// events are dropped with a warning rather than stalling a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Initial provisioning finished and periodic jobs are scheduled
    Started { node_tag: Tag, accounts: usize },

    /// The node was rebuilt under a new descriptor
    NodeRetagged { old_tag: Option<Tag>, new_tag: Tag },

    /// An account diff was applied
    AccountsReconciled { added: usize, removed: usize },

    /// Relay routes were installed for a relay target
    RelayProvisioned { relay_tag: Tag, routes: usize },

    /// The previous relay target was removed
    RelayTornDown { relay_tag: Tag },

    /// A new detection rule set was bound
    RulesUpdated { rules: usize },

    /// Upstream acknowledged a traffic report
    TrafficReported {
        accounts: usize,
        upload: u64,
        download: u64,
    },

    /// Upstream rejected a traffic report; counters were kept
    TrafficReportFailed { accounts: usize, error: String },

    OnlineIpsReported { count: usize },

    /// Detection rule hits drained from the engine
    DetectionsObserved { hits: Vec<DetectResult> },

    CertificateRenewed { domain: String },

    /// A periodic job failed; it runs again at its next interval
    SyncFailed { job: String, error: String },

    Stopped { reason: String },
}
