use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{EventPhase, EventState, StatusEvent};
use crate::flux::{baseline_ids, baseline_present, pending_workloads, WorkloadClient, WorkloadStatus};
use crate::notifier::Notifier;

/// Bound on publishing a terminal state. The `Canceled` notification in
/// particular runs on a fresh scope so it is not lost to the very
/// cancellation it reports.
const TERMINAL_PUBLISH_GRACE: Duration = Duration::from_secs(5);

enum Terminal {
    Succeeded,
    Failed,
}

/// Poll state for a single commit. Captures the agent-owned workload
/// inventory at sync time as an immutable baseline, then waits for
/// every baseline workload to become healthy.
pub struct PollJob {
    commit_id: String,
    notifier: Arc<dyn Notifier>,
    workloads: Arc<dyn WorkloadClient>,
    interval: Duration,
    /// Zero disables the deadline; the job then ends only by success
    /// or cancellation.
    timeout: Duration,
}

impl PollJob {
    pub fn new(
        commit_id: String,
        notifier: Arc<dyn Notifier>,
        workloads: Arc<dyn WorkloadClient>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self { commit_id, notifier, workloads, interval, timeout }
    }

    /// Drive the job to a terminal state, publishing exactly one
    /// terminal workload status unless the notifier itself fails.
    ///
    /// Cancellation wins every tie: it aborts an in-flight listing or
    /// publish and resolves the job to `Canceled`.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let terminal = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            watched = self.watch() => Some(watched?),
        };

        let (state, message) = match terminal {
            Some(Terminal::Succeeded) => (EventState::Succeeded, "All workloads are ready"),
            Some(Terminal::Failed) => {
                warn!("workload polling timed out for commit {}", self.commit_id);
                (EventState::Failed, "Workload polling timed out")
            }
            None => {
                info!("workload polling stopped for commit {}", self.commit_id);
                (EventState::Canceled, "Workload polling stopped")
            }
        };

        time::timeout(TERMINAL_PUBLISH_GRACE, self.publish(state, message))
            .await
            .map_err(|_| anyhow!("publishing terminal workload status timed out (commit {})", self.commit_id))?
    }

    /// Everything up to the terminal decision. Runs entirely under the
    /// job's cancellation scope: dropping this future mid-listing or
    /// mid-publish is how a superseding commit aborts it.
    async fn watch(&self) -> Result<Terminal> {
        let start = Instant::now();

        // The baseline must exist before the provider learns about the
        // poll; a listing failure here aborts without leaving the
        // commit advertising Pending forever.
        let snapshot = self
            .workloads
            .list_workloads()
            .await
            .with_context(|| format!("capture workload baseline for commit {}", self.commit_id))?;
        let baseline = baseline_ids(&snapshot);

        info!(
            "started polling commit {} ({} baseline workloads)",
            self.commit_id,
            baseline.len()
        );
        self.publish(EventState::Pending, "Waiting for workloads to be ready").await?;

        // First tick one interval after the snapshot, not at t=0.
        let mut tick = time::interval_at(start + self.interval, self.interval);
        let deadline = async {
            if self.timeout.is_zero() {
                std::future::pending::<()>().await;
            } else {
                time::sleep_until(start + self.timeout).await;
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = &mut deadline => return Ok(Terminal::Failed),
                _ = tick.tick() => {
                    match self.workloads.list_workloads().await {
                        Ok(current) => {
                            if let Some(terminal) = self.evaluate(&baseline, &current) {
                                return Ok(terminal);
                            }
                        }
                        // Transient: retried at the next tick.
                        Err(e) => warn!(
                            "listing workloads failed for commit {}: {e:#}",
                            self.commit_id
                        ),
                    }
                }
            }
        }
    }

    /// One tick's verdict: `Succeeded` once nothing is pending and the
    /// whole baseline is still present, otherwise keep ticking.
    fn evaluate(&self, baseline: &HashSet<String>, current: &[WorkloadStatus]) -> Option<Terminal> {
        let pending = pending_workloads(current);
        if !pending.is_empty() {
            info!(
                "waiting for {} workload(s) to be ready for commit {}: {}",
                pending.len(),
                self.commit_id,
                pending.join(", ")
            );
            return None;
        }
        if !baseline_present(baseline, current) {
            // Shrunken baseline: rollback, manual deletion, or agent
            // reprocessing. The tick is inconclusive.
            debug!("baseline workloads missing from listing for commit {}", self.commit_id);
            return None;
        }
        info!("all workloads are ready for commit {}", self.commit_id);
        Some(Terminal::Succeeded)
    }

    async fn publish(&self, state: EventState, message: &str) -> Result<()> {
        self.notifier
            .send(StatusEvent {
                phase: EventPhase::Workload,
                state,
                commit_id: self.commit_id.clone(),
                message: message.to_string(),
            })
            .await
            .with_context(|| format!("publish workload status for commit {}", self.commit_id))
    }
}
