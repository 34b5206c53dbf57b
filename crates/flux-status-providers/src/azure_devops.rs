use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use flux_status_core::{EventPhase, EventState, Notifier, Status, StatusEvent, STATUS_ID};

pub struct AzureDevops {
    instance: String,
    org_url: String,
    project: String,
    repository: String,
    pat: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CreateStatus<'a> {
    state: &'a str,
    description: &'a str,
    context: StatusContext,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusContext {
    genre: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct GitStatus {
    state: String,
    context: StatusContext,
}

#[derive(Debug, Deserialize)]
struct StatusList {
    value: Vec<GitStatus>,
}

impl AzureDevops {
    pub fn new(instance: &str, git_url: &str, pat: &str) -> Result<Self> {
        if pat.is_empty() {
            bail!("azure devops pat can't be empty");
        }
        let config = parse_azdo_url(git_url)?;
        Ok(Self {
            instance: instance.to_string(),
            org_url: config.org_url,
            project: config.project,
            repository: config.repository,
            pat: pat.to_string(),
            http: reqwest::Client::new(),
        })
    }

    fn statuses_url(&self, commit_id: &str) -> String {
        format!(
            "{}/{}/_apis/git/repositories/{}/commits/{commit_id}/statuses?api-version=6.0",
            self.org_url, self.project, self.repository
        )
    }

    fn context_name(&self, phase: EventPhase) -> String {
        format!("{}/{phase}", self.instance)
    }
}

#[async_trait]
impl Notifier for AzureDevops {
    async fn send(&self, event: StatusEvent) -> Result<()> {
        let body = CreateStatus {
            state: to_azdo_state(event.state),
            description: &event.message,
            context: StatusContext {
                genre: STATUS_ID.to_string(),
                name: self.context_name(event.phase),
            },
        };
        self.http
            .post(self.statuses_url(&event.commit_id))
            .basic_auth("", Some(&self.pat))
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .context("create azure devops commit status")?;
        Ok(())
    }

    async fn get(&self, commit_id: &str, phase: EventPhase) -> Result<Status> {
        let statuses: StatusList = self
            .http
            .get(self.statuses_url(commit_id))
            .basic_auth("", Some(&self.pat))
            .send()
            .await?
            .error_for_status()
            .context("list azure devops commit statuses")?
            .json()
            .await?;

        let wanted = self.context_name(phase);
        let status = statuses
            .value
            .into_iter()
            .find(|s| s.context.genre == STATUS_ID && s.context.name == wanted)
            .ok_or_else(|| anyhow!("no {STATUS_ID}/{wanted} status on commit {commit_id}"))?;
        Ok(Status {
            name: format!("{}/{}", status.context.genre, status.context.name),
            state: from_azdo_state(&status.state),
        })
    }

    fn name(&self) -> &str {
        "Azure DevOps"
    }
}

// Azure DevOps has no canceled state; a canceled poll is written as
// `error` so the terminal event is never dropped.
fn to_azdo_state(state: EventState) -> &'static str {
    match state {
        EventState::Pending => "pending",
        EventState::Succeeded => "succeeded",
        EventState::Failed | EventState::Canceled => "error",
    }
}

fn from_azdo_state(state: &str) -> EventState {
    match state {
        "pending" => EventState::Pending,
        "succeeded" => EventState::Succeeded,
        _ => EventState::Failed,
    }
}

struct AzdoConfig {
    org_url: String,
    project: String,
    repository: String,
}

/// Accepts both remote forms Azure DevOps hands out:
/// `https://user@dev.azure.com/org/project/_git/repo` and
/// `ssh://ssh.dev.azure.com/v3/org/project/repo`.
fn parse_azdo_url(git_url: &str) -> Result<AzdoConfig> {
    let url = Url::parse(git_url).context("parse azure devops repository url")?;
    let segments: Vec<&str> = url
        .path_segments()
        .ok_or_else(|| anyhow!("azure devops url {git_url:?} has no path"))?
        .collect();

    match url.scheme() {
        "http" | "https" => {
            let &[org, project, _git, repository] = segments.as_slice() else {
                bail!("azure devops url {git_url:?} does not look like org/project/_git/repo");
            };
            let host = url.host_str().ok_or_else(|| anyhow!("azure devops url {git_url:?} has no host"))?;
            let user = url.username();
            let authority = if user.is_empty() {
                host.to_string()
            } else {
                format!("{user}@{host}")
            };
            Ok(AzdoConfig {
                org_url: format!("{}://{authority}/{org}", url.scheme()),
                project: project.to_string(),
                repository: repository.to_string(),
            })
        }
        "ssh" => {
            let &[_version, org, project, repository] = segments.as_slice() else {
                bail!("azure devops url {git_url:?} does not look like v3/org/project/repo");
            };
            let host = url.host_str().ok_or_else(|| anyhow!("azure devops url {git_url:?} has no host"))?;
            let host = host.strip_prefix("ssh.").unwrap_or(host);
            Ok(AzdoConfig {
                org_url: format!("https://{host}/{org}"),
                project: project.to_string(),
                repository: repository.to_string(),
            })
        }
        other => bail!("unsupported azure devops url scheme {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_https_url() {
        let c = parse_azdo_url("https://foobar@dev.azure.com/org/proj/_git/repo").unwrap();
        assert_eq!(c.org_url, "https://foobar@dev.azure.com/org");
        assert_eq!(c.project, "proj");
        assert_eq!(c.repository, "repo");
    }

    #[test]
    fn parse_ssh_url() {
        let c = parse_azdo_url("ssh://ssh.dev.azure.com/v3/org/proj/repo").unwrap();
        assert_eq!(c.org_url, "https://dev.azure.com/org");
        assert_eq!(c.project, "proj");
        assert_eq!(c.repository, "repo");
    }

    #[test]
    fn parse_unknown_scheme_fails() {
        assert!(parse_azdo_url("git://dev.azure.com/org/proj/repo").is_err());
    }

    #[test]
    fn state_round_trip() {
        for state in [EventState::Pending, EventState::Succeeded, EventState::Failed] {
            assert_eq!(from_azdo_state(to_azdo_state(state)), state);
        }
    }

    #[test]
    fn canceled_folds_to_failed_on_read() {
        assert_eq!(
            from_azdo_state(to_azdo_state(EventState::Canceled)),
            EventState::Failed
        );
    }

    #[test]
    fn empty_pat_is_rejected() {
        assert!(AzureDevops::new("default", "https://dev.azure.com/org/proj/_git/repo", "").is_err());
    }
}
