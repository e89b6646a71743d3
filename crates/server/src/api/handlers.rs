use axum::{extract::State, http::header, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use hotfolder_core::SchedulerStatus;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::metrics::encode_metrics;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub scheduler: SchedulerStatus,
    /// Watched hot folder roots.
    pub roots: Vec<PathBuf>,
    pub watched_directories: usize,
    pub platforms: Vec<String>,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let platforms = state
        .config()
        .platforms
        .iter()
        .map(|platform| platform.name.clone())
        .collect();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at(),
        scheduler: state.scheduler().status(),
        roots: state.watches().roots().await,
        watched_directories: state.watches().watched_directories().await,
        platforms,
    })
}

pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        encode_metrics(),
    )
}
