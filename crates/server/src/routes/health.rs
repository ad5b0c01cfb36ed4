// crates/server/src/routes/health.rs
//! `GET /health` - liveness plus a summary of what the hub is carrying.
//!
//! `?remote=true` also pings the remote worker. That costs a request, so
//! it stays opt-in.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub jobs: JobCounts,
    pub remote_worker: RemoteWorker,
}

#[derive(Debug, Default, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    /// Jobs the hub has not retired yet.
    pub tracked: usize,
    /// Jobs whose body is still executing.
    pub running: usize,
    /// Open progress streams and other subscribers.
    pub listeners: usize,
    pub temp_dirs: usize,
}

#[derive(Debug, Default, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct RemoteWorker {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Only present when the check was asked for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reachable: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub remote: bool,
}

impl JobCounts {
    fn sample(state: &AppState) -> Self {
        Self {
            tracked: state.hub.job_count(),
            running: state.runner.active_jobs().len(),
            listeners: state.hub.listener_count(),
            temp_dirs: state.temp.len(),
        }
    }
}

pub async fn health_check(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HealthQuery>,
) -> Json<HealthResponse> {
    let mut remote_worker = RemoteWorker::default();
    if let Some(relay) = &state.relay {
        remote_worker.enabled = true;
        remote_worker.base_url = Some(relay.base_url().to_string());
        if query.remote {
            remote_worker.reachable = Some(relay.is_available().await);
        }
    }

    // A configured but unreachable worker still leaves local conversion up.
    let status = match remote_worker.reachable {
        Some(false) => "degraded",
        _ => "ok",
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
        jobs: JobCounts::sample(&state),
        remote_worker,
    })
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health_check))
}
