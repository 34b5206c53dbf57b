use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::event::{EventPhase, Status, StatusEvent};

/// Capability for publishing commit statuses to a source-control host.
///
/// Implementations must be safe to share across tasks; the provider is
/// the serialization point. Repeated `send` of the same (commit, phase)
/// replaces the prior state at the provider.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish a status for a commit. Blocks on the network; callers
    /// that need cancellation race the future against their token.
    async fn send(&self, event: StatusEvent) -> Result<()>;

    /// Read back the status stored for a commit and phase.
    async fn get(&self, commit_id: &str, phase: EventPhase) -> Result<Status>;

    /// Provider name, for logging.
    fn name(&self) -> &str;
}

/// Notifier that records every published event on a channel instead of
/// talking to a provider.
pub struct MockNotifier {
    events: mpsc::Sender<StatusEvent>,
}

impl MockNotifier {
    /// Returns the notifier and the receiving end of its event stream.
    pub fn new() -> (Self, mpsc::Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel(100);
        (Self { events: tx }, rx)
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send(&self, event: StatusEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("mock event receiver dropped"))
    }

    async fn get(&self, commit_id: &str, _phase: EventPhase) -> Result<Status> {
        bail!("mock notifier stores no statuses (commit {commit_id})")
    }

    fn name(&self) -> &str {
        "Mock"
    }
}
