//! HTTP router: REST handlers over the core plus the WebSocket routes.

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::error::{ProcessError, TerminalError};
use crate::state::AppState;
use crate::ws;

const DEFAULT_STORED_LIMIT: usize = 100;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/v1/version", get(version))
        .route("/api/v1/metrics/all", get(metrics_all))
        .route("/api/v1/metrics/history", get(metrics_history))
        .route("/api/v1/metrics/cpu", get(metrics_cpu))
        .route("/api/v1/metrics/memory", get(metrics_memory))
        .route("/api/v1/metrics/disk", get(metrics_disk))
        .route("/api/v1/metrics/network", get(metrics_network))
        .route("/api/v1/metrics/stored", get(metrics_stored))
        .route("/api/v1/system/info", get(system_info))
        .route("/api/v1/processes", get(processes_list))
        .route("/api/v1/processes/search", get(processes_search))
        .route("/api/v1/processes/:pid", get(process_get))
        .route("/api/v1/processes/:pid/tree", get(process_tree))
        .route("/api/v1/processes/:pid/kill", post(process_kill))
        .route("/api/v1/terminal/shells", get(terminal_shells))
        .route("/api/v1/terminal/sessions", get(terminal_sessions))
        .route("/api/v1/terminal/sessions/:id", delete(close_terminal_session))
        .route("/api/v1/config", get(get_config))
        .route("/api/v1/config/reload", post(reload_config))
        .route("/ws/metrics", get(ws::metrics_ws))
        .route("/ws/terminal", get(ws::terminal_ws))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

/// Accepts `Authorization: Bearer <token>` or `?token=<token>` when a token is configured.
async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.auth_token() else {
        return next.run(req).await;
    };
    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let query = Query::<HashMap<String, String>>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(q)| q.get("token").cloned());

    let ok = bearer == Some(expected.as_str()) || query.as_deref() == Some(expected.as_str());
    if !ok {
        warn!(path = %req.uri().path(), "rejected unauthenticated request");
        return error(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    next.run(req).await
}

fn error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(json!({ "error": msg.into() }))).into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn version(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

// ---------- Metrics ----------

async fn metrics_all(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.history.latest())
}

async fn metrics_history(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.history.snapshot())
}

async fn metrics_cpu(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.history.latest().cpu)
}

async fn metrics_memory(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.history.latest().memory)
}

async fn metrics_disk(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.history.latest().disks)
}

async fn metrics_network(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.history.latest().network)
}

async fn system_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.history.latest().system)
}

#[derive(Debug, Deserialize)]
struct StoredQuery {
    limit: Option<usize>,
}

async fn metrics_stored(State(state): State<AppState>, Query(q): Query<StoredQuery>) -> Response {
    let Some(store) = state.store.clone() else {
        return error(StatusCode::NOT_FOUND, "metrics storage is disabled");
    };
    let limit = q.limit.unwrap_or(DEFAULT_STORED_LIMIT);
    match tokio::task::spawn_blocking(move || store.recent(limit)).await {
        Ok(Ok(entries)) => Json(entries).into_response(),
        Ok(Err(e)) => error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ---------- Processes ----------

fn parse_pid(raw: &str) -> Result<u32, ProcessError> {
    raw.parse().map_err(|_| ProcessError::InvalidPid(raw.to_string()))
}

async fn processes_list(State(state): State<AppState>) -> Response {
    let processes = state.processes.clone();
    match tokio::task::spawn_blocking(move || processes.list()).await {
        Ok(list) => Json(list).into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
}

async fn processes_search(State(state): State<AppState>, Query(q): Query<SearchQuery>) -> Response {
    let Some(query) = q.q.filter(|q| !q.is_empty()) else {
        return error(StatusCode::BAD_REQUEST, "query parameter required");
    };
    let processes = state.processes.clone();
    match tokio::task::spawn_blocking(move || processes.search(&query)).await {
        Ok(list) => Json(list).into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn process_get(State(state): State<AppState>, Path(pid): Path<String>) -> Response {
    let pid = match parse_pid(&pid) {
        Ok(pid) => pid,
        Err(e) => return e.into_response(),
    };
    let processes = state.processes.clone();
    match tokio::task::spawn_blocking(move || processes.get(pid)).await {
        Ok(Ok(info)) => Json(info).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn process_tree(State(state): State<AppState>, Path(pid): Path<String>) -> Response {
    let pid = match parse_pid(&pid) {
        Ok(pid) => pid,
        Err(e) => return e.into_response(),
    };
    let processes = state.processes.clone();
    match tokio::task::spawn_blocking(move || processes.tree(pid)).await {
        Ok(Ok(tree)) => Json(tree).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct KillQuery {
    #[serde(default)]
    force: bool,
}

async fn process_kill(
    State(state): State<AppState>,
    Path(pid): Path<String>,
    Query(q): Query<KillQuery>,
) -> Response {
    let pid = match parse_pid(&pid) {
        Ok(pid) => pid,
        Err(e) => return e.into_response(),
    };
    let processes = state.processes.clone();
    match tokio::task::spawn_blocking(move || processes.kill(pid, q.force)).await {
        Ok(Ok(())) => Json(json!({ "message": "process terminated" })).into_response(),
        Ok(Err(e)) => {
            warn!(pid, "kill failed: {e}");
            e.into_response()
        }
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ---------- Terminal ----------

async fn terminal_shells(State(state): State<AppState>) -> impl IntoResponse {
    let shells: Vec<String> = state
        .terminals
        .available_shells()
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let default_shell = state.terminals.default_shell().map(|p| p.display().to_string());
    Json(json!({ "shells": shells, "default_shell": default_shell }))
}

async fn terminal_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.terminals.list_sessions())
}

async fn close_terminal_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let terminals = state.terminals.clone();
    let sid = id.clone();
    match tokio::task::spawn_blocking(move || terminals.close_session(&sid)).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => TerminalError::SessionNotFound(id).into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ---------- Config ----------

async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config().redacted())
}

async fn reload_config(State(state): State<AppState>) -> Response {
    let manager = state.config.clone();
    match tokio::task::spawn_blocking(move || manager.reload()).await {
        Ok(Ok(cfg)) => {
            info!("configuration reloaded");
            Json(cfg.redacted()).into_response()
        }
        Ok(Err(e)) => {
            warn!("configuration reload failed: {e:#}");
            error(StatusCode::UNPROCESSABLE_ENTITY, format!("{e:#}"))
        }
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
