//! API route handlers for the charart server.

pub mod health;
pub mod jobs;
pub mod metrics;
pub mod progress;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Create the combined router: API routes under `/api`, metrics at the root.
///
/// Routes:
/// - GET  /api/health - Health check
/// - GET  /api/progress/{id} - SSE stream of a job's progress
/// - GET  /api/progress/{id}/status - Latest snapshot for polling clients
/// - POST /api/progress/close/{id} - Close a job's stream
/// - POST /api/convert - Start a local frame conversion
/// - POST /api/delegate - Delegate an upload to the remote worker
/// - GET  /metrics - Prometheus metrics
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", health::router())
        .nest("/api", progress::router())
        .nest("/api", jobs::router())
        .merge(metrics::router())
        .with_state(state)
}
