// crates/server/src/routes/progress.rs
//! Progress streaming endpoints.
//!
//! - `GET  /progress/{id}`        - SSE stream of one job's events
//! - `GET  /progress/{id}/status` - latest snapshot (polling fallback)
//! - `POST /progress/close/{id}`  - close a job, `?closeReason=` optional

use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use charart_core::{EventSink, StreamingConsumer};
use charart_types::{CloseReason, ProgressSnapshot, WireEvent};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/progress/{id}", get(progress_stream))
        .route("/progress/{id}/status", get(progress_status))
        .route("/progress/close/{id}", post(close_progress))
}

/// Events buffered between the consumer task and the response body.
const SSE_BUFFER: usize = 16;

/// GET /api/progress/{id} - SSE stream of progress, results and the close.
///
/// The first event is always the job's current snapshot (a zero "waiting"
/// snapshot for unknown jobs). The stream ends after the `close` event.
/// A consumer task writes into the response body through [`SseSink`]; when
/// the client goes away the next write fails and the consumer classifies it.
pub async fn progress_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let consumer = StreamingConsumer::attach(Arc::clone(&state.hub), id.clone(), &state.config.consumer).await;
    let (tx, rx) = mpsc::channel(SSE_BUFFER);

    tokio::spawn(async move {
        let exit = consumer.run(&mut SseSink { tx }).await;
        tracing::debug!(job_id = %id, ?exit, "progress stream finished");
    });

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    });

    // The consumer sends its own heartbeats; this only guards idle proxies
    // if the heartbeat interval is configured very long.
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.config.consumer.heartbeat_interval * 2)
            .text("keep-alive"),
    )
}

/// Writes wire events into an SSE response body.
///
/// A dropped body (client disconnected) surfaces as `BrokenPipe`; an event
/// that cannot be encoded surfaces as `InvalidData`.
pub struct SseSink {
    tx: mpsc::Sender<Result<Event, Infallible>>,
}

#[async_trait]
impl EventSink for SseSink {
    async fn send(&mut self, wire: &WireEvent) -> io::Result<()> {
        let event = to_sse(wire)?;
        self.tx
            .send(Ok(event))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))
    }
}

fn to_sse(wire: &WireEvent) -> io::Result<Event> {
    let data = wire
        .data()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Event::default().event(wire.name()).data(data))
}

/// GET /api/progress/{id}/status - latest snapshot as JSON.
pub async fn progress_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<ProgressSnapshot> {
    Json(state.hub.query(&id).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseQuery {
    pub close_reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct CloseResponse {
    pub success: bool,
    pub message: String,
}

/// POST /api/progress/close/{id}?closeReason=TASK_COMPLETED
///
/// Unknown or missing reasons count as `TASK_COMPLETED`. Closing a job twice
/// is harmless; the second call just reports that nothing changed.
pub async fn close_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<CloseQuery>,
) -> Json<CloseResponse> {
    let reason = CloseReason::parse_lenient(query.close_reason.as_deref());
    let message = if state.hub.close(&id, reason).await {
        format!("progress stream for {id} closed: {reason}")
    } else {
        format!("progress stream for {id} was already closed")
    };
    Json(CloseResponse {
        success: true,
        message,
    })
}
