//! Commit-status publishers for the supported source-control hosts.

pub mod azure_devops;
pub mod github;
pub mod gitlab;

use std::sync::Arc;

use anyhow::{bail, Result};
use flux_status_core::Notifier;

use crate::azure_devops::AzureDevops;
use crate::github::GitHub;
use crate::gitlab::Gitlab;

/// Resolve the first provider that accepts the repository URL and
/// token set. The attempt order is part of the contract: GitHub, then
/// GitLab, then Azure DevOps; an empty token disqualifies a provider.
pub fn create_notifier(
    instance: &str,
    git_url: &str,
    azdo_pat: &str,
    gitlab_token: &str,
    github_token: &str,
) -> Result<Arc<dyn Notifier>> {
    if let Ok(github) = GitHub::new(instance, git_url, github_token) {
        return Ok(Arc::new(github));
    }
    if let Ok(gitlab) = Gitlab::new(instance, git_url, gitlab_token) {
        return Ok(Arc::new(gitlab));
    }
    if let Ok(azdo) = AzureDevops::new(instance, git_url, azdo_pat) {
        return Ok(Arc::new(azdo));
    }
    bail!("no provider accepts git url {git_url:?} with the supplied tokens")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_tokens_is_a_misconfiguration() {
        assert!(create_notifier("default", "https://github.com/group/name.git", "", "", "").is_err());
    }

    #[test]
    fn github_token_selects_github() {
        let notifier =
            create_notifier("default", "https://github.com/group/name.git", "", "", "token").unwrap();
        assert_eq!(notifier.name(), "GitHub");
    }

    #[test]
    fn github_wins_when_several_tokens_are_set() {
        let notifier =
            create_notifier("default", "https://github.com/group/name.git", "pat", "glpat", "token")
                .unwrap();
        assert_eq!(notifier.name(), "GitHub");
    }

    #[test]
    fn gitlab_token_selects_gitlab() {
        let notifier =
            create_notifier("default", "https://gitlab.com/namespace/name.git", "", "glpat", "")
                .unwrap();
        assert_eq!(notifier.name(), "GitLab namespace/name");
    }

    #[test]
    fn azdo_pat_selects_azure_devops() {
        let notifier =
            create_notifier("default", "https://dev.azure.com/org/proj/_git/repo", "pat", "", "")
                .unwrap();
        assert_eq!(notifier.name(), "Azure DevOps");
    }
}
