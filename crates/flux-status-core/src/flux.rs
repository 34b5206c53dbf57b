use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── Sync event wire format ────────────────────────────────────────────────

/// An event as posted by the Flux daemon to the events endpoint. Only
/// `type = "sync"` events are meaningful to this service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "startedAt", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "endedAt", default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: SyncMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncMetadata {
    #[serde(default)]
    pub commits: Vec<Commit>,
    #[serde(default)]
    pub errors: Vec<ResourceError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub revision: String,
    #[serde(default)]
    pub message: String,
}

/// A per-resource error carried in a failed sync's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceError {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Path", default)]
    pub path: String,
    #[serde(rename = "Error", default)]
    pub error: String,
}

// ── Workload listing ──────────────────────────────────────────────────────

/// Why the agent does (or does not) own a workload, decoded from the
/// listing's `ReadOnly` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    /// Managed by the agent; counts toward the baseline and may hold
    /// the poll open.
    #[default]
    OwnedByAgent,
    /// Cluster-native object the agent sees but does not manage.
    NotInRepo,
    /// Known to the agent but currently absent from the cluster.
    Missing,
}

impl Ownership {
    fn from_marker(s: &str) -> Self {
        if s == "NotInRepo" {
            Self::NotInRepo
        } else if s.eq_ignore_ascii_case("missing") {
            Self::Missing
        } else {
            Self::OwnedByAgent
        }
    }

    fn as_marker(self) -> &'static str {
        match self {
            Self::OwnedByAgent => "ReadOnlyMode",
            Self::NotInRepo => "NotInRepo",
            Self::Missing => "Missing",
        }
    }
}

impl Serialize for Ownership {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_marker())
    }
}

impl<'de> Deserialize<'de> for Ownership {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let marker = String::deserialize(deserializer)?;
        Ok(Self::from_marker(&marker))
    }
}

/// One workload as reported by the agent's service listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadStatus {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "ReadOnly", default)]
    pub ownership: Ownership,
    #[serde(rename = "Rollout", default)]
    pub rollout: Rollout,
}

/// Rollout counters reported per workload. Carried for wire fidelity;
/// health classification only looks at the status string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollout {
    #[serde(rename = "Desired", default)]
    pub desired: i64,
    #[serde(rename = "Updated", default)]
    pub updated: i64,
    #[serde(rename = "Ready", default)]
    pub ready: i64,
    #[serde(rename = "Available", default)]
    pub available: i64,
    #[serde(rename = "Outdated", default)]
    pub outdated: i64,
}

// ── Classification ────────────────────────────────────────────────────────
//
// The only place the health and baseline rules live.

/// A workload is healthy once the agent reports it deployed or ready.
fn is_healthy(workload: &WorkloadStatus) -> bool {
    matches!(workload.status.as_str(), "deployed" | "ready")
}

/// Ids of the workloads still holding the poll open. `NotInRepo`
/// workloads are unmanaged and never pending; `Missing` workloads are
/// excluded here and surface through the baseline check instead.
pub fn pending_workloads(workloads: &[WorkloadStatus]) -> Vec<String> {
    workloads
        .iter()
        .filter(|w| w.ownership == Ownership::OwnedByAgent && !is_healthy(w))
        .map(|w| w.id.clone())
        .collect()
}

/// The baseline captured at sync time: every workload the agent owns,
/// whether or not it is healthy yet.
pub fn baseline_ids(workloads: &[WorkloadStatus]) -> HashSet<String> {
    workloads
        .iter()
        .filter(|w| w.ownership != Ownership::NotInRepo)
        .map(|w| w.id.clone())
        .collect()
}

/// True when every baseline workload still appears in the current
/// listing. A workload the agent reports as `Missing` no longer counts
/// as present; a shrunken baseline (rollback, manual deletion, agent
/// reprocessing) makes the tick inconclusive.
pub fn baseline_present(baseline: &HashSet<String>, workloads: &[WorkloadStatus]) -> bool {
    let current: HashSet<&str> = workloads
        .iter()
        .filter(|w| w.ownership != Ownership::Missing)
        .map(|w| w.id.as_str())
        .collect();
    baseline.iter().all(|id| current.contains(id.as_str()))
}

// ── Workload client ───────────────────────────────────────────────────────

/// Read access to the agent's current workload inventory.
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    async fn list_workloads(&self) -> Result<Vec<WorkloadStatus>>;
}

/// Workload client backed by the Flux daemon's HTTP API.
pub struct FluxClient {
    base: String,
    http: reqwest::Client,
}

impl FluxClient {
    /// `addr` is the daemon's host:port, e.g. `localhost:3030`.
    pub fn new(addr: &str) -> Self {
        Self {
            base: format!("http://{addr}/api/flux/v6"),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl WorkloadClient for FluxClient {
    async fn list_workloads(&self) -> Result<Vec<WorkloadStatus>> {
        let url = format!("{}/services", self.base);
        let workloads = self
            .http
            .get(&url)
            .send()
            .await
            .context("request workload listing")?
            .error_for_status()?
            .json()
            .await
            .context("decode workload listing")?;
        Ok(workloads)
    }
}

/// Scripted workload client for tests: each call pops the next listing
/// from the queue, and the final entry repeats forever.
pub struct MockWorkloads {
    listings: Mutex<VecDeque<Listing>>,
}

enum Listing {
    Workloads(Vec<WorkloadStatus>),
    Error(String),
}

impl MockWorkloads {
    pub fn new(workloads: Vec<WorkloadStatus>) -> Self {
        Self {
            listings: Mutex::new(VecDeque::from([Listing::Workloads(workloads)])),
        }
    }

    /// A client whose every listing fails, until `set` replaces it.
    pub fn failing(message: &str) -> Self {
        Self {
            listings: Mutex::new(VecDeque::from([Listing::Error(message.to_string())])),
        }
    }

    /// Queue a listing to be served after the ones already queued.
    pub fn push(&self, workloads: Vec<WorkloadStatus>) {
        if let Ok(mut listings) = self.listings.lock() {
            listings.push_back(Listing::Workloads(workloads));
        }
    }

    /// Queue a transport failure.
    pub fn push_error(&self, message: &str) {
        if let Ok(mut listings) = self.listings.lock() {
            listings.push_back(Listing::Error(message.to_string()));
        }
    }

    /// Drop everything queued and serve `workloads` from now on.
    pub fn set(&self, workloads: Vec<WorkloadStatus>) {
        if let Ok(mut listings) = self.listings.lock() {
            listings.clear();
            listings.push_back(Listing::Workloads(workloads));
        }
    }
}

#[async_trait]
impl WorkloadClient for MockWorkloads {
    async fn list_workloads(&self) -> Result<Vec<WorkloadStatus>> {
        let mut listings = match self.listings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let popped = if listings.len() > 1 { listings.pop_front() } else { None };
        match popped.as_ref().or_else(|| listings.front()) {
            Some(Listing::Workloads(w)) => Ok(w.clone()),
            Some(Listing::Error(e)) => bail!("{e}"),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(id: &str, status: &str, marker: &str) -> WorkloadStatus {
        WorkloadStatus {
            id: id.to_string(),
            status: status.to_string(),
            ownership: Ownership::from_marker(marker),
            rollout: Rollout::default(),
        }
    }

    #[test]
    fn ready_deployment_is_not_pending() {
        let ww = vec![workload("namespace:deployment/resource-name", "ready", "ReadOnlyMode")];
        assert!(pending_workloads(&ww).is_empty());
    }

    #[test]
    fn updating_deployment_is_pending() {
        let ww = vec![workload("namespace:deployment/resource-name", "updating", "ReadOnlyMode")];
        assert_eq!(pending_workloads(&ww), vec!["namespace:deployment/resource-name"]);
    }

    #[test]
    fn deployed_helmrelease_is_not_pending() {
        let ww = vec![workload("namespace:helmrelease/resource-name", "deployed", "ReadOnlyMode")];
        assert!(pending_workloads(&ww).is_empty());
    }

    #[test]
    fn failed_helmrelease_is_pending() {
        let ww = vec![workload("namespace:helmrelease/resource-name", "failed", "ReadOnlyMode")];
        assert_eq!(pending_workloads(&ww), vec!["namespace:helmrelease/resource-name"]);
    }

    #[test]
    fn mixed_ready_workloads_are_not_pending() {
        let ww = vec![
            workload("namespace:helmrelease/resource-name", "deployed", "ReadOnlyMode"),
            workload("namespace:deployment/resource-name", "ready", "ReadOnlyMode"),
        ];
        assert!(pending_workloads(&ww).is_empty());
    }

    #[test]
    fn unmanaged_workload_never_holds_the_poll_open() {
        let ww = vec![workload("kube-system:deployment/coredns", "updating", "NotInRepo")];
        assert!(pending_workloads(&ww).is_empty());
    }

    #[test]
    fn missing_workload_is_not_pending() {
        let ww = vec![workload("ns:deployment/gone", "updating", "Missing")];
        assert!(pending_workloads(&ww).is_empty());
    }

    #[test]
    fn baseline_excludes_unmanaged_workloads() {
        let ww = vec![
            workload("ns:deployment/app", "updating", "ReadOnlyMode"),
            workload("kube-system:deployment/coredns", "ready", "NotInRepo"),
        ];
        let baseline = baseline_ids(&ww);
        assert!(baseline.contains("ns:deployment/app"));
        assert!(!baseline.contains("kube-system:deployment/coredns"));
    }

    #[test]
    fn baseline_check_notices_a_disappeared_workload() {
        let baseline: HashSet<String> =
            ["ns:deployment/a", "ns:deployment/b"].iter().map(|s| s.to_string()).collect();
        let current = vec![workload("ns:deployment/a", "ready", "ReadOnlyMode")];
        assert!(!baseline_present(&baseline, &current));

        let restored = vec![
            workload("ns:deployment/a", "ready", "ReadOnlyMode"),
            workload("ns:deployment/b", "ready", "ReadOnlyMode"),
        ];
        assert!(baseline_present(&baseline, &restored));
    }

    #[test]
    fn missing_workload_does_not_count_as_present() {
        let baseline: HashSet<String> =
            ["ns:deployment/a", "ns:deployment/b"].iter().map(|s| s.to_string()).collect();
        let current = vec![
            workload("ns:deployment/a", "ready", "ReadOnlyMode"),
            workload("ns:deployment/b", "updating", "Missing"),
        ];
        assert!(!baseline_present(&baseline, &current));
    }

    #[test]
    fn workload_listing_decodes_agent_fields() {
        let body = r#"[{
            "ID": "ns:deployment/app",
            "Status": "ready",
            "ReadOnly": "ReadOnlyMode",
            "Rollout": {"Desired": 2, "Updated": 2, "Ready": 2, "Available": 2, "Outdated": 0}
        }]"#;
        let ww: Vec<WorkloadStatus> = serde_json::from_str(body).unwrap();
        assert_eq!(ww[0].id, "ns:deployment/app");
        assert_eq!(ww[0].ownership, Ownership::OwnedByAgent);
        assert_eq!(ww[0].rollout.ready, 2);
    }

    #[test]
    fn sync_event_decodes_error_metadata() {
        let body = r#"{
            "id": 7,
            "type": "sync",
            "metadata": {
                "commits": [{"revision": "abc123"}],
                "errors": [{"ID": "ns:deployment/app", "Path": "app.yaml", "Error": "boom"}]
            }
        }"#;
        let event: SyncEvent = serde_json::from_str(body).unwrap();
        assert_eq!(event.event_type, "sync");
        assert_eq!(event.metadata.commits[0].revision, "abc123");
        assert_eq!(event.metadata.errors[0].id, "ns:deployment/app");
    }
}
