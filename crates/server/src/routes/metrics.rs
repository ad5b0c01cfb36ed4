// crates/server/src/routes/metrics.rs
//! `GET /metrics` in Prometheus text format. Mounted at the root, not under
//! `/api`, where scrapers expect it.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

use crate::metrics::{record_sizes, render_metrics, Sizes};
use crate::state::AppState;

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/metrics", get(scrape))
}

fn sample(state: &AppState) -> Sizes {
    Sizes {
        jobs: state.hub.job_count(),
        listeners: state.hub.listener_count(),
        running: state.runner.active_jobs().len(),
        temp_dirs: state.temp.len(),
    }
}

/// Gauges are refreshed from live state on every scrape. Before the
/// recorder is installed this answers 503.
pub async fn scrape(State(state): State<Arc<AppState>>) -> Response {
    record_sizes(sample(&state));
    let Some(body) = render_metrics() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response();
    };
    ([(header::CONTENT_TYPE, PROMETHEUS_TEXT)], body).into_response()
}
