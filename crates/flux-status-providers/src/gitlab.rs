use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use flux_status_core::{status_key, EventPhase, EventState, Notifier, Status, StatusEvent};

const API: &str = "https://gitlab.com/api/v4";

pub struct Gitlab {
    instance: String,
    /// `namespace/name`, as GitLab addresses projects.
    project: String,
    display_name: String,
    token: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct SetStatus<'a> {
    state: &'a str,
    name: String,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
struct CommitStatus {
    name: String,
    status: String,
}

impl Gitlab {
    pub fn new(instance: &str, git_url: &str, token: &str) -> Result<Self> {
        if token.is_empty() {
            bail!("gitlab token can't be empty");
        }
        let project = parse_gitlab_url(git_url)?;
        Ok(Self {
            instance: instance.to_string(),
            display_name: format!("GitLab {project}"),
            project,
            token: token.to_string(),
            http: reqwest::Client::new(),
        })
    }

    fn project_url(&self, tail: &str) -> String {
        format!("{API}/projects/{}/{tail}", urlencoding::encode(&self.project))
    }
}

#[async_trait]
impl Notifier for Gitlab {
    async fn send(&self, event: StatusEvent) -> Result<()> {
        let url = self.project_url(&format!("statuses/{}", event.commit_id));
        let body = SetStatus {
            state: to_gitlab_state(event.state),
            name: status_key(&self.instance, event.phase),
            description: &event.message,
        };
        self.http
            .post(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .context("set gitlab commit status")?;
        Ok(())
    }

    async fn get(&self, commit_id: &str, phase: EventPhase) -> Result<Status> {
        let url = self.project_url(&format!("repository/commits/{commit_id}/statuses?all=true"));
        let statuses: Vec<CommitStatus> = self
            .http
            .get(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await?
            .error_for_status()
            .context("list gitlab commit statuses")?
            .json()
            .await?;

        let wanted = status_key(&self.instance, phase);
        let status = statuses
            .into_iter()
            .find(|s| s.name == wanted)
            .ok_or_else(|| anyhow!("no {wanted} status on commit {commit_id}"))?;
        Ok(Status {
            state: from_gitlab_state(&status.status),
            name: status.name,
        })
    }

    fn name(&self) -> &str {
        &self.display_name
    }
}

fn to_gitlab_state(state: EventState) -> &'static str {
    match state {
        EventState::Pending => "running",
        EventState::Succeeded => "success",
        EventState::Failed => "failed",
        EventState::Canceled => "canceled",
    }
}

fn from_gitlab_state(state: &str) -> EventState {
    match state {
        "pending" | "created" | "running" | "manual" => EventState::Pending,
        "success" => EventState::Succeeded,
        "canceled" | "skipped" => EventState::Canceled,
        _ => EventState::Failed,
    }
}

fn parse_gitlab_url(git_url: &str) -> Result<String> {
    let url = Url::parse(git_url).context("parse gitlab repository url")?;
    let mut segments = url
        .path_segments()
        .ok_or_else(|| anyhow!("gitlab url {git_url:?} has no path"))?;
    let namespace = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("gitlab url {git_url:?} is missing the namespace"))?;
    let name = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("gitlab url {git_url:?} is missing the project name"))?;
    Ok(format!("{namespace}/{}", name.trim_end_matches(".git")))
}
