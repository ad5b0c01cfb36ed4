//! End-to-end tests for the HTTP surface, driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use charart_core::AppConfig;
use charart_server::{app, AppState};
use charart_types::{CloseReason, ProgressFields};
use pretty_assertions::assert_eq;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_state(temp: &tempfile::TempDir) -> Arc<AppState> {
    let mut config = AppConfig::default();
    config.server.temp_dir = Some(temp.path().to_path_buf());
    config.consumer.heartbeat_interval = Duration::from_millis(200);
    AppState::new(config)
}

async fn request(app: Router, method: Method, uri: &str, body: Option<(&str, Vec<u8>)>) -> (StatusCode, String) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some((content_type, bytes)) => {
            builder = builder.header(header::CONTENT_TYPE, content_type);
            Body::from(bytes)
        }
        None => Body::empty(),
    };
    let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn wait_closed(state: &AppState, job_id: &str) -> CloseReason {
    for _ in 0..250 {
        if let Some(reason) = state.hub.closed_reason(job_id).await {
            return reason;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never closed");
}

#[tokio::test]
async fn health_reports_jobs_and_relay() {
    let temp = tempfile::tempdir().unwrap();
    let state = test_state(&temp);
    state.hub.update("h1", ProgressFields::new(10.0, "working")).await;

    let (status, body) = request(app(state), Method::GET, "/api/health", None).await;

    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["jobs"]["tracked"], 1);
    assert_eq!(json["jobs"]["running"], 0);
    assert_eq!(json["remoteWorker"]["enabled"], false);
}

#[tokio::test]
async fn status_returns_latest_snapshot() {
    let temp = tempfile::tempdir().unwrap();
    let state = test_state(&temp);
    state
        .hub
        .update("s1", ProgressFields::new(42.0, "rendering").stage("render").units(2, 5))
        .await;

    let (status, body) = request(app(state), Method::GET, "/api/progress/s1/status", None).await;

    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["percentage"], 42.0);
    assert_eq!(json["stage"], "render");
    assert_eq!(json["currentUnit"], 2);
    assert_eq!(json["totalUnits"], 5);
}

#[tokio::test]
async fn close_endpoint_closes_once() {
    let temp = tempfile::tempdir().unwrap();
    let state = test_state(&temp);
    state.hub.update("c1", ProgressFields::new(50.0, "half")).await;

    let (status, body) = request(
        app(Arc::clone(&state)),
        Method::POST,
        "/api/progress/close/c1?closeReason=TASK_COMPLETED",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["success"], true);
    assert!(json["message"].as_str().unwrap().contains("TASK_COMPLETED"));
    assert_eq!(state.hub.closed_reason("c1").await, Some(CloseReason::Completed));

    let (status, body) = request(
        app(Arc::clone(&state)),
        Method::POST,
        "/api/progress/close/c1?closeReason=ERROR_OCCURRED",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("already closed"));
    assert_eq!(state.hub.closed_reason("c1").await, Some(CloseReason::Completed));
}

#[tokio::test]
async fn unknown_close_reason_means_completed() {
    let temp = tempfile::tempdir().unwrap();
    let state = test_state(&temp);
    state.hub.update("c2", ProgressFields::new(5.0, "x")).await;

    let (status, _) = request(
        app(Arc::clone(&state)),
        Method::POST,
        "/api/progress/close/c2?closeReason=whatever",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.hub.closed_reason("c2").await, Some(CloseReason::Completed));
}

#[tokio::test]
async fn stream_of_closed_job_replays_and_ends() {
    let temp = tempfile::tempdir().unwrap();
    let state = test_state(&temp);
    state.hub.update("e1", ProgressFields::new(80.0, "almost")).await;
    state.hub.close("e1", CloseReason::Completed).await;

    let response = app(state)
        .oneshot(
            Request::builder()
                .uri("/api/progress/e1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
    assert!(content_type.to_str().unwrap().starts_with("text/event-stream"));

    let bytes = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("stream should end after close")
    .unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();

    assert!(body.contains("event: progress"));
    assert!(body.contains("event: close"));
    assert!(body.contains("TASK_COMPLETED"));
    assert!(body.find("event: progress") < body.find("event: close"));
}

#[tokio::test]
async fn convert_runs_pipeline_to_completion() {
    let temp = tempfile::tempdir().unwrap();
    let state = test_state(&temp);

    let payload = serde_json::json!({
        "jobId": "conv-1",
        "ramp": "#. ",
        "frames": [
            {"width": 2, "height": 1, "pixels": [0, 255]},
            {"width": 2, "height": 1, "pixels": [255, 0]}
        ]
    });
    let (status, body) = request(
        app(Arc::clone(&state)),
        Method::POST,
        "/api/convert",
        Some(("application/json", serde_json::to_vec(&payload).unwrap())),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["jobId"], "conv-1");

    assert_eq!(wait_closed(&state, "conv-1").await, CloseReason::Completed);
    let result = state.hub.latest_result("conv-1").await.expect("result published");
    let output = std::fs::read_to_string(&result.artifact_locator).unwrap();
    assert!(!output.is_empty());

    let history = state.hub.history("conv-1").await;
    assert!(history.windows(2).all(|w| w[0].percentage <= w[1].percentage));
    assert_eq!(history.last().unwrap().percentage, 100.0);
}

#[tokio::test]
async fn convert_without_frames_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let state = test_state(&temp);

    let (status, body) = request(
        app(state),
        Method::POST,
        "/api/convert",
        Some(("application/json", br#"{"frames":[]}"#.to_vec())),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("at least one frame"));
}

#[tokio::test]
async fn delegate_without_remote_is_unavailable() {
    let temp = tempfile::tempdir().unwrap();
    let state = test_state(&temp);

    let (status, body) = request(
        app(state),
        Method::POST,
        "/api/delegate?filename=clip.webp",
        Some(("application/octet-stream", b"RIFF....WEBP".to_vec())),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["error"], "Remote worker unavailable");
}

/// Remote worker that accepts one job and reports `/out/anim.webp`.
async fn remote_worker() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/progress/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "task_id": "r-1" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/progress/r-1"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "event: webp_result\ndata: {\"task_id\":\"r-1\",\"webp\":\"/out/anim.webp\"}\n\n",
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
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/get-image/out/anim.webp"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RIFFWEBP".to_vec()))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn delegate_saves_remote_artifact_locally() {
    let remote = remote_worker().await;
    let temp = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.server.temp_dir = Some(temp.path().to_path_buf());
    config.relay.base_url = Some(remote.uri());
    config.relay.retry_delay = Duration::from_millis(10);
    config.relay.stabilize_delay = Duration::from_millis(10);
    let state = AppState::new(config);

    let (status, _) = request(
        app(Arc::clone(&state)),
        Method::POST,
        "/api/delegate?filename=clip.webp&jobId=del-1",
        Some(("application/octet-stream", b"RIFF....WEBP".to_vec())),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    assert_eq!(wait_closed(&state, "del-1").await, CloseReason::Completed);
    let result = state.hub.latest_result("del-1").await.expect("result published");
    let local = std::path::Path::new(&result.artifact_locator);
    assert!(local.starts_with(temp.path()));
    assert_eq!(std::fs::read(local).unwrap(), b"RIFFWEBP");
}
