use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use flux_status_core::{status_key, EventPhase, EventState, Notifier, Status, StatusEvent};

const API: &str = "https://api.github.com";

pub struct GitHub {
    instance: String,
    owner: String,
    repository: String,
    token: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CreateStatus<'a> {
    state: &'a str,
    description: &'a str,
    context: String,
}

#[derive(Debug, Deserialize)]
struct RepoStatus {
    state: String,
    context: String,
}

impl GitHub {
    pub fn new(instance: &str, git_url: &str, token: &str) -> Result<Self> {
        if token.is_empty() {
            bail!("github token can't be empty");
        }
        let (owner, repository) = parse_github_url(git_url)?;
        Ok(Self {
            instance: instance.to_string(),
            owner,
            repository,
            token: token.to_string(),
            http: reqwest::Client::builder()
                .user_agent("flux-status")
                .build()
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl Notifier for GitHub {
    async fn send(&self, event: StatusEvent) -> Result<()> {
        let url = format!(
            "{API}/repos/{}/{}/statuses/{}",
            self.owner, self.repository, event.commit_id
        );
        let body = CreateStatus {
            state: to_github_state(event.state),
            description: &event.message,
            context: status_key(&self.instance, event.phase),
        };
        self.http
            .post(&url)
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .context("create github commit status")?;
        Ok(())
    }

    async fn get(&self, commit_id: &str, phase: EventPhase) -> Result<Status> {
        let url = format!(
            "{API}/repos/{}/{}/commits/{commit_id}/statuses",
            self.owner, self.repository
        );
        let statuses: Vec<RepoStatus> = self
            .http
            .get(&url)
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await?
            .error_for_status()
            .context("list github commit statuses")?
            .json()
            .await?;

        let wanted = status_key(&self.instance, phase);
        let status = statuses
            .into_iter()
            .find(|s| s.context == wanted)
            .ok_or_else(|| anyhow!("no {wanted} status on commit {commit_id}"))?;
        Ok(Status {
            name: status.context,
            state: from_github_state(&status.state)?,
        })
    }

    fn name(&self) -> &str {
        "GitHub"
    }
}

fn to_github_state(state: EventState) -> &'static str {
    match state {
        EventState::Pending => "pending",
        EventState::Succeeded => "success",
        EventState::Failed => "failure",
        EventState::Canceled => "error",
    }
}

// Reads fold `error` into `Failed`; a written `Canceled` does not
// survive a round trip.
fn from_github_state(state: &str) -> Result<EventState> {
    match state {
        "pending" => Ok(EventState::Pending),
        "success" => Ok(EventState::Succeeded),
        "failure" | "error" => Ok(EventState::Failed),
        other => bail!("unknown github commit state {other:?}"),
    }
}

fn parse_github_url(git_url: &str) -> Result<(String, String)> {
    let url = Url::parse(git_url).context("parse github repository url")?;
    let mut segments = url
        .path_segments()
        .ok_or_else(|| anyhow!("github url {git_url:?} has no path"))?;
    let owner = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("github url {git_url:?} is missing the owner"))?;
    let repository = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("github url {git_url:?} is missing the repository"))?;
    Ok((owner.to_string(), repository.trim_end_matches(".git").to_string()))
}
