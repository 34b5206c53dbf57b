//! Workload polling: a supervisor that owns at most one active poll
//! job at a time, and the per-commit job state machine.

mod job;

pub use job::PollJob;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::flux::WorkloadClient;
use crate::notifier::Notifier;

/// Supervises workload polls: consumes commit ids from the ingress
/// handoff channel, cancels the poll a newer commit supersedes before
/// launching its replacement, and drains outstanding jobs on shutdown.
pub struct Poller {
    notifier: Arc<dyn Notifier>,
    workloads: Arc<dyn WorkloadClient>,
    commits: mpsc::Receiver<String>,
    interval: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
    jobs: TaskTracker,
}

/// Handle for stopping a running [`Poller`] from another task.
#[derive(Clone)]
pub struct PollerHandle {
    shutdown: CancellationToken,
    jobs: TaskTracker,
}

impl Poller {
    /// `interval_secs` is clamped to at least one second; a
    /// `timeout_secs` of zero disables the per-commit deadline.
    pub fn new(
        notifier: Arc<dyn Notifier>,
        workloads: Arc<dyn WorkloadClient>,
        commits: mpsc::Receiver<String>,
        interval_secs: u64,
        timeout_secs: u64,
    ) -> (Self, PollerHandle) {
        let shutdown = CancellationToken::new();
        let jobs = TaskTracker::new();
        let handle = PollerHandle { shutdown: shutdown.clone(), jobs: jobs.clone() };
        let poller = Self {
            notifier,
            workloads,
            commits,
            interval: Duration::from_secs(interval_secs.max(1)),
            timeout: Duration::from_secs(timeout_secs),
            shutdown,
            jobs,
        };
        (poller, handle)
    }

    /// Consume commit ids until shutdown is requested or every sender
    /// is gone. A new commit always wins: the previous job's scope is
    /// canceled before the new job is launched.
    pub async fn run(mut self) {
        // Placeholder scope until the first commit arrives.
        let mut current = CancellationToken::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.commits.recv() => {
                    let Some(commit_id) = received else { break };
                    current.cancel();
                    // Child of the shutdown token, so stopping the
                    // supervisor also cancels the active job.
                    current = self.shutdown.child_token();
                    self.spawn_job(commit_id, current.clone());
                }
            }
        }

        current.cancel();
        self.jobs.close();
        info!("poller stopped consuming commits");
    }

    fn spawn_job(&self, commit_id: String, scope: CancellationToken) {
        let job = PollJob::new(
            commit_id.clone(),
            Arc::clone(&self.notifier),
            Arc::clone(&self.workloads),
            self.interval,
            self.timeout,
        );
        self.jobs.spawn(async move {
            if let Err(e) = job.run(scope).await {
                error!("poll job for commit {commit_id} failed: {e:#}");
            }
        });
    }
}

impl PollerHandle {
    /// Request shutdown and wait for every outstanding job to publish
    /// its terminal event, bounded by `grace`.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        self.shutdown.cancel();
        time::timeout(grace, self.jobs.wait())
            .await
            .map_err(|_| anyhow!("poll jobs did not drain within {grace:?}"))
    }
}
