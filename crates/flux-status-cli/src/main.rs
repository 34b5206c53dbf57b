use anyhow::{Context, Result};
use clap::Parser;
use flux_status_core::EventPhase;

/// Reads back the commit status written by a flux-status daemon.
#[derive(Debug, Parser)]
#[command(name = "flux-status-cli")]
struct Args {
    /// Id of the commit to get status for.
    #[arg(long)]
    commit_id: String,
    /// Id to differentiate between multiple flux-status updating the
    /// same repository.
    #[arg(long, default_value = "default")]
    instance: String,
    /// Status phase to read: sync or workload.
    #[arg(long)]
    action: EventPhase,
    /// URL for the git repository, should be the same as Flux uses.
    #[arg(long, default_value = "")]
    git_url: String,
    /// Token to authenticate with Azure DevOps.
    #[arg(long, default_value = "")]
    azdo_pat: String,
    /// Token to authenticate with GitLab.
    #[arg(long, default_value = "")]
    gitlab_token: String,
    /// Token to authenticate with GitHub.
    #[arg(long, default_value = "")]
    github_token: String,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run(Args::parse()).await {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let notifier = flux_status_providers::create_notifier(
        &args.instance,
        &args.git_url,
        &args.azdo_pat,
        &args.gitlab_token,
        &args.github_token,
    )
    .context("resolve a commit-status provider")?;

    let status = notifier
        .get(&args.commit_id, args.action)
        .await
        .with_context(|| format!("get {} status for commit {}", args.action, args.commit_id))?;

    println!("{}", serde_json::to_string(&status)?);
    Ok(())
}
