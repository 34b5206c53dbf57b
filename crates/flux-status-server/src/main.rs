mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use flux_status_core::flux::FluxClient;
use flux_status_core::poller::{Poller, PollerHandle};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Grace period for draining outstanding poll jobs on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Publishes Flux sync and workload status to the commit-status API of
/// the backing git provider.
#[derive(Debug, Parser)]
#[command(name = "flux-status")]
struct Args {
    /// Address to serve the events API on.
    #[arg(long, default_value = ":3000")]
    listen: String,
    /// Address to communicate with the Flux API through.
    #[arg(long, default_value = "localhost:3030")]
    flux: String,
    /// Id to differentiate between multiple flux-status updating the
    /// same repository.
    #[arg(long, default_value = "default")]
    instance: String,
    /// Enables polling of workloads after sync.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    poll_workloads: bool,
    /// Duration in seconds between each workload poll.
    #[arg(long = "poll-intervall", default_value_t = 5)]
    poll_interval: u64,
    /// Duration in seconds before a poll is failed; 0 disables the
    /// deadline.
    #[arg(long, default_value_t = 360)]
    poll_timeout: u64,
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
    /// Enables debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);
    info!("starting flux-status");

    let notifier = flux_status_providers::create_notifier(
        &args.instance,
        &args.git_url,
        &args.azdo_pat,
        &args.gitlab_token,
        &args.github_token,
    )
    .context("resolve a commit-status provider")?;
    info!("using notifier {}", notifier.name());

    let (poller, commits) = if args.poll_workloads {
        let (tx, rx) = mpsc::channel(1);
        let workloads = Arc::new(FluxClient::new(&args.flux));
        let (poller, handle) = Poller::new(
            Arc::clone(&notifier),
            workloads,
            rx,
            args.poll_interval,
            args.poll_timeout,
        );
        tokio::spawn(poller.run());
        (Some(handle), Some(tx))
    } else {
        info!("workload polling is disabled");
        (None, None)
    };

    let app = routes::router(routes::AppState { notifier, commits });

    let addr = normalize_listen(&args.listen);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve events api")?;

    info!("stopping flux-status");
    if let Some(poller) = poller {
        stop_poller(poller).await?;
    }
    info!("stopped flux-status successfully");
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "flux_status=debug,flux_status_core=debug,flux_status_providers=debug,tower_http=debug"
    } else {
        "flux_status=info,flux_status_core=info,flux_status_providers=info,tower_http=warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// A bare `:port` listen address binds every interface.
fn normalize_listen(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    }
}

async fn stop_poller(poller: PollerHandle) -> Result<()> {
    poller
        .stop(SHUTDOWN_GRACE)
        .await
        .context("drain outstanding poll jobs")
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!("installing SIGTERM handler failed: {e}");
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_listen_address_binds_all_interfaces() {
        assert_eq!(normalize_listen(":3000"), "0.0.0.0:3000");
        assert_eq!(normalize_listen("127.0.0.1:8080"), "127.0.0.1:8080");
    }

    #[test]
    fn default_flags_match_the_daemon_contract() {
        let args = Args::parse_from(["flux-status"]);
        assert_eq!(args.listen, ":3000");
        assert_eq!(args.flux, "localhost:3030");
        assert_eq!(args.instance, "default");
        assert!(args.poll_workloads);
        assert_eq!(args.poll_interval, 5);
        assert_eq!(args.poll_timeout, 360);
        assert!(!args.debug);
    }

    #[test]
    fn poll_workloads_can_be_disabled() {
        let args = Args::parse_from(["flux-status", "--poll-workloads", "false"]);
        assert!(!args.poll_workloads);
    }
}
