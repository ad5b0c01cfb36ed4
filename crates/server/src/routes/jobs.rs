// crates/server/src/routes/jobs.rs
//! Work submission endpoints.
//!
//! - `POST /convert`  - run the local frame pipeline over posted frames
//! - `POST /delegate` - hand an uploaded file to the remote worker
//!
//! Both return `202 {jobId}` immediately; progress arrives on
//! `/api/progress/{jobId}`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use charart_core::pipeline::ramp::{GrayFrame, RampFrames, TextFileEncoder};
use charart_core::FramePipeline;
use charart_relay::{DelegateOptions, RelayClient, RelayError, WorkUnit};
use charart_types::Artifact;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const OUTPUT_FILE: &str = "frames.txt";
const DEFAULT_UPLOAD_NAME: &str = "upload.webp";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/convert", post(convert))
        .route("/delegate", post(delegate))
}

#[derive(Debug, Deserialize)]
pub struct FramePayload {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertRequest {
    #[serde(default)]
    pub job_id: Option<String>,
    /// Characters from darkest to lightest. Defaults to the built-in ramp.
    #[serde(default)]
    pub ramp: Option<String>,
    pub frames: Vec<FramePayload>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: String,
}

/// Reject empty ids so they fall back to a generated one.
fn requested_id(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn validate_frames(frames: &[FramePayload]) -> Result<(), ApiError> {
    if frames.is_empty() {
        return Err(ApiError::BadRequest("at least one frame is required".into()));
    }
    for (i, f) in frames.iter().enumerate() {
        if f.width == 0 || f.height == 0 {
            return Err(ApiError::BadRequest(format!("frame {i} has zero size")));
        }
        let Some(expected) = f.width.checked_mul(f.height) else {
            return Err(ApiError::BadRequest(format!("frame {i} dimensions overflow")));
        };
        if f.pixels.len() != expected {
            return Err(ApiError::BadRequest(format!(
                "frame {i}: expected {expected} pixels, got {}",
                f.pixels.len()
            )));
        }
    }
    Ok(())
}

/// POST /api/convert - convert grayscale frames to character art.
pub async fn convert(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConvertRequest>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    validate_frames(&req.frames)?;

    let job_id = requested_id(req.job_id).unwrap_or_else(charart_core::ProgressHub::new_job_id);
    let dir = state.temp.create(&job_id)?;

    let frames: Vec<GrayFrame> = req
        .frames
        .into_iter()
        .map(|f| GrayFrame::new(f.width, f.height, f.pixels))
        .collect();
    let work = match req.ramp {
        Some(ramp) => RampFrames::with_ramp(frames, &ramp),
        None => RampFrames::new(frames),
    };
    let pipeline = FramePipeline::new(Arc::clone(&state.hub), &state.config.pipeline);

    let handle = state
        .runner
        .start_job(Some(job_id), "ramp conversion", move |ctx, _cancel| async move {
            pipeline
                .run(&ctx.job_id, work, TextFileEncoder::new(dir.join(OUTPUT_FILE)))
                .await
        });

    tracing::info!(job_id = %handle.id, "conversion accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: handle.id.clone(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateQuery {
    pub filename: Option<String>,
    pub job_id: Option<String>,
}

/// POST /api/delegate?filename=clip.webp - delegate the raw body to the
/// remote worker. The remote result is published on the local job.
pub async fn delegate(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DelegateQuery>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let Some(relay) = state.relay.clone() else {
        return Err(ApiError::Unavailable("no remote worker configured".into()));
    };
    if body.is_empty() {
        return Err(ApiError::BadRequest("request body is empty".into()));
    }

    let unit = WorkUnit::new(
        body,
        query.filename.unwrap_or_else(|| DEFAULT_UPLOAD_NAME.to_string()),
    );
    let job_id = requested_id(query.job_id).unwrap_or_else(charart_core::ProgressHub::new_job_id);
    let dir = state.temp.create(&job_id)?;

    let handle = state.runner.start_job(
        Some(job_id),
        "remote conversion",
        move |ctx, cancel_rx| async move { run_delegation(&relay, &ctx.job_id, unit, dir, cancel_rx).await },
    );

    tracing::info!(job_id = %handle.id, "delegation accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: handle.id.clone(),
        }),
    ))
}

/// Delegate `unit` and fetch the result into `dir`.
///
/// A cancel sent through the job handle cancels the relay, which tells the
/// remote worker to stop. A dropped handle is not a cancel.
async fn run_delegation(
    relay: &RelayClient,
    job_id: &str,
    unit: WorkUnit,
    dir: PathBuf,
    cancel_rx: oneshot::Receiver<()>,
) -> Result<Artifact, RelayError> {
    let cancel = CancellationToken::new();
    // The runner publishes the artifact itself once it has been fetched.
    let work = async {
        let remote = relay
            .delegate_with_cancel(job_id, unit, DelegateOptions::default(), cancel.clone())
            .await?;
        let result = remote.result().await?;
        relay.fetch_artifact(job_id, &result, &dir).await
    };
    tokio::pin!(work);

    let requested = async {
        if cancel_rx.await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        outcome = &mut work => return outcome,
        () = requested => {}
    }

    tracing::info!(job_id, "delegation cancel requested");
    cancel.cancel();
    work.await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: usize, height: usize, n: usize) -> FramePayload {
        FramePayload {
            width,
            height,
            pixels: vec![0; n],
        }
    }

    #[test]
    fn test_validate_frames() {
        assert!(validate_frames(&[frame(2, 2, 4)]).is_ok());
        assert!(matches!(validate_frames(&[]), Err(ApiError::BadRequest(_))));
        assert!(matches!(
            validate_frames(&[frame(2, 2, 4), frame(2, 2, 3)]),
            Err(ApiError::BadRequest(msg)) if msg.starts_with("frame 1")
        ));
        assert!(matches!(validate_frames(&[frame(0, 2, 0)]), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_oversized_dimensions_are_rejected() {
        let result = validate_frames(&[frame(usize::MAX, 2, 4)]);
        assert!(matches!(
            result,
            Err(ApiError::BadRequest(msg)) if msg.contains("overflow")
        ));
    }

    #[test]
    fn test_requested_id() {
        assert_eq!(requested_id(Some(" j1 ".into())), Some("j1".to_string()));
        assert_eq!(requested_id(Some("  ".into())), None);
        assert_eq!(requested_id(None), None);
    }

    mod delegation {
        use super::*;
        use charart_core::{ProgressHub, RelayConfig};
        use std::time::Duration;
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        async fn mount_create(server: &MockServer) {
            Mock::given(method("POST"))
                .and(path("/api/progress/create"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "task_id": "r-1" })))
                .mount(server)
                .await;
        }

        fn client(server: &MockServer) -> RelayClient {
            let config = RelayConfig {
                base_url: Some(server.uri()),
                retry_delay: Duration::from_millis(10),
                stabilize_delay: Duration::from_millis(10),
                connect_timeout: Duration::from_secs(30),
                ..RelayConfig::default()
            };
            RelayClient::new(Arc::new(ProgressHub::default()), config).unwrap()
        }

        #[tokio::test]
        async fn test_cancel_request_stops_relay_and_tells_remote() {
            let server = MockServer::start().await;
            mount_create(&server).await;
            Mock::given(method("GET"))
                .and(path("/api/progress/r-1"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_raw(String::new(), "text/event-stream")
                        .set_delay(Duration::from_secs(10)),
                )
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/api/progress/close/r-1"))
                .and(query_param("closeReason", "ERROR_OCCURRED"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
            let relay = client(&server);
            let dir = tempfile::tempdir().unwrap();

            let (cancel_tx, cancel_rx) = oneshot::channel();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let _ = cancel_tx.send(());
            });
            let outcome = tokio::time::timeout(
                Duration::from_secs(3),
                run_delegation(&relay, "d-1", WorkUnit::new(vec![1u8], "a.webp"), dir.path().to_path_buf(), cancel_rx),
            )
            .await
            .expect("cancel did not reach the relay");

            assert!(matches!(outcome, Err(RelayError::Cancelled)), "{outcome:?}");
        }

        #[tokio::test]
        async fn test_dropped_handle_does_not_cancel() {
            let server = MockServer::start().await;
            mount_create(&server).await;
            Mock::given(method("GET"))
                .and(path("/api/progress/r-1"))
                .respond_with(ResponseTemplate::new(200).set_body_raw(
                    "event: webp_result\ndata: {\"task_id\":\"r-1\",\"webp\":\"/out/a.webp\"}\n\n",
                    "text/event-stream",
                ))
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/api/process-webp"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "task_id": "r-1" })))
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/api/progress/close/r-1"))
                .and(query_param("closeReason", "TASK_COMPLETED"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/api/get-image/out/a.webp"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RIFF".to_vec()))
                .mount(&server)
                .await;
            let relay = client(&server);
            let dir = tempfile::tempdir().unwrap();

            let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
            drop(cancel_tx);
            let artifact = run_delegation(&relay, "d-2", WorkUnit::new(vec![1u8], "a.webp"), dir.path().to_path_buf(), cancel_rx)
                .await
                .unwrap();

            assert_eq!(std::fs::read(&artifact.locator).unwrap(), b"RIFF");
        }
    }

    #[test]
    fn test_convert_request_shape() {
        let req: ConvertRequest = serde_json::from_str(
            r#"{"jobId":"j1","frames":[{"width":1,"height":1,"pixels":[255]}]}"#,
        )
        .unwrap();
        assert_eq!(req.job_id.as_deref(), Some("j1"));
        assert!(req.ramp.is_none());
        assert_eq!(req.frames[0].pixels, vec![255]);
    }
}
