//! Axum read API over the snapshot store, plus the static dashboard assets.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use statwatch_storage::SnapshotStore;
use statwatch_sync::ShutdownSignal;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "statwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub store: SnapshotStore,
    pub web_root: PathBuf,
}

impl AppState {
    pub fn new(store: SnapshotStore, web_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            web_root: web_root.into(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    owner: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/profiles", get(profiles_handler))
        .route("/api/history", get(history_handler))
        .fallback(static_handler)
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` fires, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn profiles_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest_per_account().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let Some(owner) = query.owner.filter(|o| !o.is_empty()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state.store.history_for(&owner).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn static_handler(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    let Some(relative) = static_relative_path(uri.path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mut path = state.web_root.join(relative);
    if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
        path.push("index.html");
    }
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type_for(&path))], bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Map a request path onto the web root; `None` for anything that tries to leave it.
fn static_relative_path(request_path: &str) -> Option<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Some(PathBuf::from("index.html"));
    }
    let candidate = Path::new(trimmed);
    candidate
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then(|| candidate.to_path_buf())
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Server error: {}", err),
    )
        .into_response()
}
