use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::Response,
    routing::post,
    Router,
};
use flux_status_core::{
    flux::SyncEvent,
    EventPhase, EventState, Notifier, StatusEvent,
};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub notifier: Arc<dyn Notifier>,
    /// Commit handoff to the poller; `None` when workload polling is
    /// disabled.
    pub commits: Option<mpsc::Sender<String>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v6/events", post(handle_event))
        .fallback(handle_websocket)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Sync events ───────────────────────────────────────────────────────────

async fn handle_event(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let event: SyncEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!("rejecting undecodable sync event: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };
    let status = match convert_event(&event) {
        Ok(status) => status,
        Err(e) => {
            warn!("rejecting sync event: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    let commit_id = status.commit_id.clone();
    let sync_state = status.state;
    if let Err(e) = state.notifier.send(status).await {
        error!("publishing sync status for commit {commit_id} failed: {e:#}");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    info!("published sync status for commit {commit_id}");

    if sync_state != EventState::Failed {
        if let Some(commits) = &state.commits {
            // Capacity-1 handoff: a busy poller backpressures the
            // webhook source instead of dropping the commit.
            if commits.send(commit_id.clone()).await.is_err() {
                warn!("poller is gone, commit {commit_id} will not be polled");
            }
        }
    }

    StatusCode::OK
}

/// Turn the agent's sync event into the sync-phase status for its first
/// commit. Anything other than a sync event carrying a commit is
/// malformed.
fn convert_event(event: &SyncEvent) -> Result<StatusEvent> {
    if event.event_type != "sync" {
        bail!("unexpected event type {:?}", event.event_type);
    }
    let commit = event
        .metadata
        .commits
        .first()
        .ok_or_else(|| anyhow!("sync event carries no commits"))?;
    if commit.revision.is_empty() {
        bail!("sync event commit revision is empty");
    }

    let (state, message) = if event.metadata.errors.is_empty() {
        (EventState::Succeeded, "Succeeded".to_string())
    } else {
        let ids: Vec<&str> = event.metadata.errors.iter().map(|e| e.id.as_str()).collect();
        (EventState::Failed, format!("Errors:{}", ids.join(",")))
    };

    Ok(StatusEvent {
        phase: EventPhase::Sync,
        state,
        commit_id: commit.revision.clone(),
        message,
    })
}

// ── Websocket echo ────────────────────────────────────────────────────────

// The agent probes liveness over a websocket; echoing frames is all it
// needs.
async fn handle_websocket(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(echo)
}

async fn echo(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
        if socket.send(message).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use flux_status_core::{MockNotifier, Status};
    use tower::ServiceExt;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn send(&self, _event: StatusEvent) -> Result<()> {
            bail!("provider unavailable")
        }

        async fn get(&self, _commit_id: &str, _phase: EventPhase) -> Result<Status> {
            bail!("provider unavailable")
        }

        fn name(&self) -> &str {
            "Failing"
        }
    }

    fn sync_event_body(revision: &str) -> String {
        format!(
            r#"{{"id":1,"type":"sync","metadata":{{"commits":[{{"revision":"{revision}"}}],"errors":[]}}}}"#
        )
    }

    fn post_event(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v6/events")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn accepted_sync_publishes_and_enqueues() {
        let (notifier, mut published) = MockNotifier::new();
        let (tx, mut commits) = mpsc::channel(1);
        let app = router(AppState { notifier: Arc::new(notifier), commits: Some(tx) });

        let response = app.oneshot(post_event(sync_event_body("foobar"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let event = published.try_recv().unwrap();
        assert_eq!(event.phase, EventPhase::Sync);
        assert_eq!(event.state, EventState::Succeeded);
        assert_eq!(event.commit_id, "foobar");
        assert_eq!(commits.try_recv().unwrap(), "foobar");
    }

    #[tokio::test]
    async fn failed_sync_publishes_but_does_not_enqueue() {
        let (notifier, mut published) = MockNotifier::new();
        let (tx, mut commits) = mpsc::channel(1);
        let app = router(AppState { notifier: Arc::new(notifier), commits: Some(tx) });

        let body = r#"{"id":1,"type":"sync","metadata":{
            "commits":[{"revision":"foobar"}],
            "errors":[{"ID":"ns:deployment/a","Path":"a.yaml","Error":"apply failed"},
                      {"ID":"ns:deployment/b","Path":"b.yaml","Error":"apply failed"}]}}"#;
        let response = app.oneshot(post_event(body.to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let event = published.try_recv().unwrap();
        assert_eq!(event.state, EventState::Failed);
        assert_eq!(event.message, "Errors:ns:deployment/a,ns:deployment/b");
        assert!(commits.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_sync_event_is_rejected_without_side_effects() {
        let (notifier, mut published) = MockNotifier::new();
        let (tx, mut commits) = mpsc::channel(1);
        let app = router(AppState { notifier: Arc::new(notifier), commits: Some(tx) });

        let body = r#"{"id":1,"type":"commit","metadata":{"commits":[{"revision":"foobar"}]}}"#;
        let response = app.oneshot(post_event(body.to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(published.try_recv().is_err());
        assert!(commits.try_recv().is_err());
    }

    #[tokio::test]
    async fn sync_event_without_commits_is_rejected() {
        let (notifier, mut published) = MockNotifier::new();
        let app = router(AppState { notifier: Arc::new(notifier), commits: None });

        let body = r#"{"id":1,"type":"sync","metadata":{"commits":[]}}"#;
        let response = app.oneshot(post_event(body.to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(published.try_recv().is_err());
    }

    #[tokio::test]
    async fn undecodable_body_is_rejected() {
        let (notifier, _published) = MockNotifier::new();
        let app = router(AppState { notifier: Arc::new(notifier), commits: None });

        let response = app.oneshot(post_event("not json".to_string())).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn publisher_failure_is_a_server_error_without_enqueue() {
        let (tx, mut commits) = mpsc::channel(1);
        let app = router(AppState { notifier: Arc::new(FailingNotifier), commits: Some(tx) });

        let response = app.oneshot(post_event(sync_event_body("foobar"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(commits.try_recv().is_err());
    }

    #[tokio::test]
    async fn disabled_poller_still_publishes_sync_status() {
        let (notifier, mut published) = MockNotifier::new();
        let app = router(AppState { notifier: Arc::new(notifier), commits: None });

        let response = app.oneshot(post_event(sync_event_body("foobar"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(published.try_recv().unwrap().commit_id, "foobar");
    }
}
