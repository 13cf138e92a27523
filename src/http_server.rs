//! Read-only stats API using Axum.

use crate::error::DecoyResult;
use crate::session::SessionInfo;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Serialize, PartialEq, Eq)]
struct StatsResponse {
    live_sessions: usize,
    active_sandboxes: usize,
    sessions_started: u64,
    sessions_removed: u64,
    wasted_secs: u64,
    uploads: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the stats API on `port` until the task is aborted.
pub async fn run_server(port: u16, state: AppState) -> DecoyResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting stats API on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let snapshot = state.registry.stats().snapshot();
    Json(StatsResponse {
        live_sessions: state.registry.len().await,
        active_sandboxes: state.sandboxes().active_count().await,
        sessions_started: snapshot.sessions_started,
        sessions_removed: snapshot.sessions_removed,
        wasted_secs: snapshot.wasted_secs,
        uploads: snapshot.uploads,
    })
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list().await)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, StatusCode> {
    let session = state.registry.get(&id).await.ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(session.info_at(Instant::now())))
}
