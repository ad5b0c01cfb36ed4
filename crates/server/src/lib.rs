// crates/server/src/lib.rs
//! Charart server library.
//!
//! Axum front end for the progress hub: job submission, SSE progress
//! streams, explicit close, health and Prometheus metrics.

pub mod error;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod temp;

pub use error::*;
pub use metrics::{init_metrics, render_metrics};
pub use routes::api_routes;
pub use state::AppState;
pub use temp::TempDirRegistry;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the Axum application with all routes and middleware.
///
/// This sets up:
/// - API routes (health, progress, jobs) and `/metrics`
/// - CORS allowing any origin, so browser clients can open event streams
/// - Request tracing
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api_routes(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
