use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Prefix shared by every provider-visible status key.
pub const STATUS_ID: &str = "flux-status";

/// The two status phases published per commit: `Sync` when the agent
/// reports a reconciliation pass, `Workload` when the poller resolves
/// the health of the deployed resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPhase {
    Sync,
    Workload,
}

impl EventPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Workload => "workload",
        }
    }
}

impl fmt::Display for EventPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventPhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Self::Sync),
            "workload" => Ok(Self::Workload),
            other => bail!("unknown status phase {other:?}, expected sync or workload"),
        }
    }
}

/// Commit-status state. Per (commit, phase) a status passes through at
/// most one `Pending` and exactly one terminal state; republishing the
/// same state replaces it idempotently at the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

impl EventState {
    /// Terminal states end a poll; `Pending` is the only non-terminal.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A single status update for one commit and phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub phase: EventPhase,
    pub state: EventState,
    pub commit_id: String,
    /// Human-readable only, never parsed.
    pub message: String,
}

/// A status read back from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub state: EventState,
}

/// Provider-visible key identifying one pipeline instance and phase,
/// e.g. `flux-status/default/workload`.
pub fn status_key(instance: &str, phase: EventPhase) -> String {
    format!("{STATUS_ID}/{instance}/{phase}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_key_format() {
        assert_eq!(status_key("default", EventPhase::Sync), "flux-status/default/sync");
        assert_eq!(status_key("prod", EventPhase::Workload), "flux-status/prod/workload");
    }

    #[test]
    fn phase_parses_from_cli_action() {
        assert_eq!("sync".parse::<EventPhase>().unwrap(), EventPhase::Sync);
        assert_eq!("workload".parse::<EventPhase>().unwrap(), EventPhase::Workload);
        assert!("deploy".parse::<EventPhase>().is_err());
    }

    #[test]
    fn pending_is_the_only_non_terminal() {
        assert!(!EventState::Pending.is_terminal());
        assert!(EventState::Succeeded.is_terminal());
        assert!(EventState::Failed.is_terminal());
        assert!(EventState::Canceled.is_terminal());
    }

    #[test]
    fn states_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&EventState::Succeeded).unwrap(), "\"succeeded\"");
        assert_eq!(serde_json::to_string(&EventPhase::Workload).unwrap(), "\"workload\"");
    }
}
