//! HTTP surface: the external entry point for triggering and observing
//! healing runs, plus the Credential Broker's admin endpoints.
//!
//! Follows the familiar `ServerState`/`build_router`/`run_server` shape
//! used by this codebase's other service entry points; routes and
//! payloads mirror `run_agent` and `ws` semantics.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::credential::{AuthMethod, CredentialBroker};
use crate::events::BroadcastEventSink;
use crate::orchestrator::{Orchestrator, RunRequest};
use crate::results::ResultsDocument;
use crate::types::RunStatus;

/// In-memory record of one run's lifecycle, queried by the poll
/// endpoints. The source of truth for a finished run is its persisted
/// `results.json`; this registry exists so the poll endpoints can
/// report `running` before that file exists.
struct RunRecord {
    repository_url: String,
    team_name: String,
    leader_name: String,
    branch_name: String,
    status: String,
    results: Option<ResultsDocument>,
}

/// Shared state across every handler.
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    credential: Arc<CredentialBroker>,
    events: Arc<BroadcastEventSink>,
    runs: RwLock<HashMap<String, RunRecord>>,
}

impl AppState {
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>, credential: Arc<CredentialBroker>, events: Arc<BroadcastEventSink>) -> Self {
        Self { orchestrator, credential, events, runs: RwLock::new(HashMap::new()) }
    }
}

/// Build the HTTP router.
#[must_use]
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/run-agent", post(run_agent_handler))
        .route("/run-agent/{run_id}", get(run_status_handler))
        .route("/run-agent/{run_id}/results.json", get(run_results_handler))
        .route("/runs", get(list_runs_handler))
        .route("/ws/{run_id}", get(ws_handler))
        .route("/admin/auth/status", get(auth_status_handler))
        .route("/admin/auth/check/{owner}/{repo}", get(auth_check_handler))
        .route("/admin/auth/install", get(install_redirect_handler))
        .route("/admin/auth/callback", get(install_callback_handler))
        .route("/admin/auth/installations", get(list_installations_handler))
        .route("/admin/auth/installations/{id}/repos", get(list_installation_repos_handler))
        .route("/admin/auth/installations/{id}/token-test", get(token_test_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
///
/// # Errors
///
/// Returns an error if the server fails to bind `addr`.
pub async fn run_server(state: Arc<AppState>, addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "healer HTTP surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy", version: env!("CARGO_PKG_VERSION") })
}

#[derive(Debug, Deserialize)]
struct RunAgentRequest {
    repository_url: String,
    team_name: String,
    leader_name: String,
}

#[derive(Debug, Serialize)]
struct RunAgentResponse {
    run_id: String,
    status: &'static str,
    branch_name: String,
    ws_url: String,
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    detail: String,
}

/// `https://github.com/owner/repo[.git]` only; the trailing `.git` is
/// stripped so the clone URL, the branch namer, and the credential
/// broker all see the same canonical form.
fn normalize_repository_url(raw: &str) -> Result<String, &'static str> {
    let trimmed = raw.trim();
    if !trimmed.starts_with("https://github.com/") {
        return Err("Only GitHub HTTPS URLs are accepted");
    }
    Ok(trimmed.strip_suffix(".git").unwrap_or(trimmed).to_string())
}

/// Accept a healing request, register it as `running`, and drive the
/// Orchestrator in the background. Responds immediately with the
/// generated `run_id` — clients poll `/run-agent/{id}` or connect to
/// `ws_url` for real-time progress.
async fn run_agent_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunAgentRequest>,
) -> impl IntoResponse {
    let repository_url = match normalize_repository_url(&request.repository_url) {
        Ok(url) => url,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(ErrorResponse { detail: message.to_string() })).into_response();
        }
    };
    if request.team_name.trim().is_empty() || request.leader_name.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { detail: "team_name and leader_name are required".to_string() }),
        )
            .into_response();
    }

    let run_id = Uuid::new_v4().to_string();
    let branch_name = crate::orchestrator::make_branch_name(&request.team_name, &request.leader_name);
    info!(run_id = %run_id, repository_url = %repository_url, branch = %branch_name, "run-agent request accepted");

    state.runs.write().await.insert(
        run_id.clone(),
        RunRecord {
            repository_url: repository_url.clone(),
            team_name: request.team_name.clone(),
            leader_name: request.leader_name.clone(),
            branch_name: branch_name.clone(),
            status: "running".to_string(),
            results: None,
        },
    );

    let background_state = state.clone();
    let background_run_id = run_id.clone();
    let run_request = RunRequest {
        run_id: run_id.clone(),
        repository_url,
        team_name: request.team_name,
        leader_name: request.leader_name,
    };

    tokio::spawn(async move {
        let doc = background_state.orchestrator.run(run_request).await;
        let status = if doc.final_status == RunStatus::Passed { "passed" } else { "failed" };
        if let Some(record) = background_state.runs.write().await.get_mut(&background_run_id) {
            record.status = status.to_string();
            record.results = Some(doc);
        }
        background_state.events.forget(&background_run_id).await;
    });

    (
        StatusCode::ACCEPTED,
        Json(RunAgentResponse {
            run_id: run_id.clone(),
            status: "started",
            branch_name,
            ws_url: format!("/ws/{run_id}"),
            message: "Pipeline started \u{2014} connect to ws_url for real-time updates",
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct RunStatusResponse {
    run_id: String,
    repository_url: String,
    team_name: String,
    leader_name: String,
    branch_name: String,
    status: String,
}

async fn run_status_handler(State(state): State<Arc<AppState>>, Path(run_id): Path<String>) -> impl IntoResponse {
    let runs = state.runs.read().await;
    match runs.get(&run_id) {
        Some(record) => (
            StatusCode::OK,
            Json(RunStatusResponse {
                run_id,
                repository_url: record.repository_url.clone(),
                team_name: record.team_name.clone(),
                leader_name: record.leader_name.clone(),
                branch_name: record.branch_name.clone(),
                status: record.status.clone(),
            }),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, Json(ErrorResponse { detail: "Run not found".to_string() })).into_response(),
    }
}

async fn run_results_handler(State(state): State<Arc<AppState>>, Path(run_id): Path<String>) -> impl IntoResponse {
    let runs = state.runs.read().await;
    match runs.get(&run_id) {
        Some(RunRecord { results: Some(doc), .. }) => {
            (StatusCode::OK, Json(serde_json::to_value(doc).unwrap_or(serde_json::Value::Null))).into_response()
        }
        Some(_) => (StatusCode::ACCEPTED, Json(ErrorResponse { detail: "Run still in progress".to_string() })).into_response(),
        None => (StatusCode::NOT_FOUND, Json(ErrorResponse { detail: "Run not found".to_string() })).into_response(),
    }
}

#[derive(Debug, Serialize)]
struct RunListEntry {
    run_id: String,
    status: String,
    repository_url: String,
    team_name: String,
    branch_name: String,
}

async fn list_runs_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let runs = state.runs.read().await;
    let entries: Vec<RunListEntry> = runs
        .iter()
        .map(|(run_id, record)| RunListEntry {
            run_id: run_id.clone(),
            status: record.status.clone(),
            repository_url: record.repository_url.clone(),
            team_name: record.team_name.clone(),
            branch_name: record.branch_name.clone(),
        })
        .collect();
    Json(entries)
}

/// Upgrade to a WebSocket and relay every envelope the Event Sink
/// broadcasts for `run_id` until the client disconnects or the run's
/// channel is forgotten.
async fn ws_handler(State(state): State<Arc<AppState>>, Path(run_id): Path<String>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay_events(socket, state, run_id))
}

async fn relay_events(mut socket: WebSocket, state: Arc<AppState>, run_id: String) {
    let mut receiver = state.events.subscribe(&run_id).await;
    loop {
        tokio::select! {
            envelope = receiver.recv() => {
                match envelope {
                    Ok(envelope) => {
                        let Ok(payload) = serde_json::to_string(&envelope) else { continue };
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(run_id, skipped, "websocket subscriber lagged, dropping buffered envelopes");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                if incoming.is_none() {
                    break;
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct AuthStatusResponse {
    auth_method: &'static str,
    github_app_configured: bool,
    pat_available: bool,
}

async fn auth_status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(AuthStatusResponse {
        auth_method: state.credential.auth_method(),
        github_app_configured: state.credential.is_app_configured(),
        pat_available: state.credential.has_fallback(),
    })
}

#[derive(Debug, Serialize)]
struct AuthCheckResponse {
    repo: String,
    owner: String,
    repo_name: String,
    app_configured: bool,
    pat_available: bool,
    app_installed: bool,
    installation_id: Option<u64>,
    auth_method: &'static str,
    auth_ready: bool,
}

async fn auth_check_handler(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
) -> impl IntoResponse {
    let installation_id = if state.credential.is_app_configured() {
        match state.credential.find_installation(&owner, &repo).await {
            Ok(id) => id,
            Err(e) => {
                error!(owner, repo, error = %e, "installation lookup failed");
                None
            }
        }
    } else {
        None
    };

    let app_installed = installation_id.is_some();
    let pat_available = state.credential.has_fallback();
    let (auth_method, auth_ready) = if app_installed {
        ("github_app", true)
    } else if pat_available {
        ("pat", true)
    } else {
        ("none", false)
    };

    Json(AuthCheckResponse {
        repo: format!("{owner}/{repo}"),
        owner,
        repo_name: repo,
        app_configured: state.credential.is_app_configured(),
        pat_available,
        app_installed,
        installation_id,
        auth_method,
        auth_ready,
    })
}

#[derive(Debug, Deserialize)]
struct InstallQuery {
    state: Option<String>,
}

async fn install_redirect_handler(State(state): State<Arc<AppState>>, Query(query): Query<InstallQuery>) -> impl IntoResponse {
    match state.credential.installation_url(query.state.as_deref()) {
        Some(url) => Redirect::to(&url).into_response(),
        None => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { detail: "GitHub App is not configured".to_string() }))
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct InstallCallbackQuery {
    installation_id: u64,
    setup_action: Option<String>,
    #[allow(dead_code)]
    state: Option<String>,
}

#[derive(Debug, Serialize)]
struct InstallCallbackResponse {
    status: &'static str,
    installation_id: u64,
    account: String,
    setup_action: String,
}

async fn install_callback_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InstallCallbackQuery>,
) -> impl IntoResponse {
    match state.credential.handle_installation_callback(query.installation_id).await {
        Ok(installation) => (
            StatusCode::OK,
            Json(InstallCallbackResponse {
                status: "installed",
                installation_id: installation.id,
                account: installation.account_login.unwrap_or_default(),
                setup_action: query.setup_action.unwrap_or_default(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!(installation_id = query.installation_id, error = %e, "installation callback failed");
            (StatusCode::BAD_GATEWAY, Json(ErrorResponse { detail: e.to_string() })).into_response()
        }
    }
}

async fn list_installations_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.credential.list_installations().await {
        Ok(installations) => (StatusCode::OK, Json(installations)).into_response(),
        Err(e) => {
            error!(error = %e, "failed to list installations");
            (StatusCode::BAD_GATEWAY, Json(ErrorResponse { detail: e.to_string() })).into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct InstallationReposResponse {
    installation_id: u64,
    total: usize,
    repositories: Vec<crate::credential::InstallationRepo>,
}

async fn list_installation_repos_handler(
    State(state): State<Arc<AppState>>,
    Path(installation_id): Path<u64>,
) -> impl IntoResponse {
    match state.credential.list_installation_repos(installation_id).await {
        Ok(repositories) => (
            StatusCode::OK,
            Json(InstallationReposResponse { installation_id, total: repositories.len(), repositories }),
        )
            .into_response(),
        Err(e) => {
            error!(installation_id, error = %e, "failed to list installation repos");
            (StatusCode::BAD_GATEWAY, Json(ErrorResponse { detail: e.to_string() })).into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct TokenTestResponse {
    installation_id: u64,
    resolved: bool,
    expires_hint: &'static str,
}

/// Mints a token for `installation_id` and reports success only — the
/// token itself is never returned.
async fn token_test_handler(State(state): State<Arc<AppState>>, Path(installation_id): Path<u64>) -> impl IntoResponse {
    match state.credential.mint_installation_token(installation_id).await {
        Ok(_token) => (
            StatusCode::OK,
            Json(TokenTestResponse { installation_id, resolved: true, expires_hint: "cached with a 5 minute safety margin" }),
        )
            .into_response(),
        Err(e) => {
            error!(installation_id, error = %e, "token mint failed");
            (StatusCode::BAD_GATEWAY, Json(ErrorResponse { detail: e.to_string() })).into_response()
        }
    }
}

/// Resolves a token for `owner/repo` without ever returning it, used by
/// integration tests and `healer auth check`.
pub async fn resolve_for_test(credential: &CredentialBroker, owner: &str, repo: &str) -> Option<AuthMethod> {
    credential.resolve_token(owner, repo).await.ok().map(|(_, method)| method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::BroadcastEventSink;
    use crate::reasoner::ReasonerClient;
    use async_trait::async_trait;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        config: Config,
    }

    struct NoopReasoner;

    #[async_trait]
    impl ReasonerClient for NoopReasoner {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, crate::errors::ReasonerError> {
            Ok("UNFIXABLE".to_string())
        }
    }

    fn test_state() -> Arc<AppState> {
        let config = Harness::parse_from(["healer"]).config;
        let credential = Arc::new(CredentialBroker::new(config.clone()));
        let events = Arc::new(BroadcastEventSink::new());
        let orchestrator = Arc::new(Orchestrator::new(config, credential.clone(), events.clone(), Arc::new(NoopReasoner)));
        Arc::new(AppState::new(orchestrator, credential, events))
    }

    #[test]
    fn normalize_accepts_https_github_and_strips_dot_git() {
        assert_eq!(
            normalize_repository_url("https://github.com/acme/widgets.git").unwrap(),
            "https://github.com/acme/widgets"
        );
        assert_eq!(normalize_repository_url("https://github.com/acme/widgets").unwrap(), "https://github.com/acme/widgets");
    }

    #[test]
    fn normalize_rejects_non_github_urls() {
        assert!(normalize_repository_url("https://gitlab.com/acme/widgets").is_err());
        assert!(normalize_repository_url("git@github.com:acme/widgets.git").is_err());
    }

    #[tokio::test]
    async fn unknown_run_id_reports_not_found() {
        let state = test_state();
        let response = run_status_handler(State(state), Path("does-not-exist".to_string())).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn auth_status_reports_none_without_configuration() {
        let state = test_state();
        let response = auth_status_handler(State(state)).await.into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["auth_method"], "none");
    }

    #[tokio::test]
    async fn run_agent_rejects_non_github_url() {
        let state = test_state();
        let response = run_agent_handler(
            State(state),
            Json(RunAgentRequest {
                repository_url: "https://gitlab.com/acme/widgets".to_string(),
                team_name: "acme".to_string(),
                leader_name: "alice".to_string(),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
