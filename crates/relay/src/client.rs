// crates/relay/src/client.rs
//! Client for the remote worker service.
//!
//! A delegation creates a second job id on the remote side, opens that
//! job's event stream, waits for it to connect, and only then submits the
//! work. Everything the stream reports is translated and written into the
//! hub under the caller's original job id.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use charart_core::{ProgressHub, RelayConfig};
use charart_types::{Artifact, CloseReason, JobId, ProgressFields};
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::retry::{with_retry, RetryPolicy};
use crate::sse::SseDecoder;
use crate::translate::{Binding, RemoteEvent, RemoteOutput, RemoteResult, Step, FRAME_LIST_TYPE};

/// One file to hand to the remote worker.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub bytes: Bytes,
    pub filename: String,
    pub mime: String,
}

impl WorkUnit {
    pub fn new(bytes: impl Into<Bytes>, filename: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            filename: filename.into(),
            mime: "image/webp".into(),
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = mime.into();
        self
    }
}

/// Local file name used when a remote locator has no usable last segment.
const FALLBACK_ARTIFACT_NAME: &str = "result.webp";
const FRAME_MANIFEST_NAME: &str = "frames.json";
/// Progress range covered by downloading an encoded animation.
const ENCODED_FETCH_SPAN: (f64, f64) = (98.0, 100.0);
/// Progress range covered by downloading extracted frames.
const FRAMES_FETCH_SPAN: (f64, f64) = (38.0, 40.0);

/// Written next to the fetched frames; names are relative to its directory.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FrameManifest {
    frame_count: usize,
    delays: Vec<u32>,
    frames: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelegateOptions {
    /// Also publish the remote result into the hub under the original id.
    /// Off by default: most callers post-process the result first.
    pub publish_result: bool,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    task_id: String,
}

/// Acknowledgement for a submitted work unit.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitAck {
    pub task_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    hub: Arc<ProgressHub>,
    config: RelayConfig,
    base_url: String,
}

impl RelayClient {
    /// Fails with [`RelayError::NotConfigured`] when no base URL is set.
    pub fn new(hub: Arc<ProgressHub>, config: RelayConfig) -> Result<Self, RelayError> {
        let base_url = config
            .base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or(RelayError::NotConfigured)?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            hub,
            config,
            base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config)
    }

    /// Single health check, no retries.
    pub async fn is_available(&self) -> bool {
        let checked = self
            .http
            .get(self.url("/api/health"))
            .timeout(self.config.request_timeout)
            .send()
            .await;
        match checked {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "remote worker health check failed");
                false
            }
        }
    }

    pub async fn create_remote_job(&self) -> Result<JobId, RelayError> {
        with_retry("create remote job", self.retry_policy(), || async move {
            let resp = self
                .http
                .post(self.url("/api/progress/create"))
                .timeout(self.config.request_timeout)
                .send()
                .await?;
            let created: CreateResponse = expect_success(resp, "create remote job").await?.json().await?;
            Ok::<_, RelayError>(created.task_id)
        })
        .await
    }

    /// Ask the remote worker to close its stream for `remote_id`.
    pub async fn send_close(&self, remote_id: &str, reason: CloseReason) -> Result<(), RelayError> {
        with_retry("close remote stream", self.retry_policy(), || async move {
            let resp = self
                .http
                .post(self.url(&format!("/api/progress/close/{remote_id}")))
                .query(&[("closeReason", reason.as_str())])
                .timeout(self.config.request_timeout)
                .send()
                .await?;
            expect_success(resp, "close remote stream").await?;
            Ok::<_, RelayError>(())
        })
        .await
    }

    /// Hand `unit` to the remote worker and mirror its progress into the
    /// hub under `original_id`.
    ///
    /// Returns once the work has been submitted. Failures before that point
    /// close the original job with an error and are returned here; later
    /// failures arrive through [`RelayHandle::result`].
    pub async fn delegate(
        &self,
        original_id: &str,
        unit: WorkUnit,
        options: DelegateOptions,
    ) -> Result<RelayHandle, RelayError> {
        self.delegate_with_cancel(original_id, unit, options, CancellationToken::new())
            .await
    }

    /// Like [`delegate`](Self::delegate), but `cancel` stops the delegation
    /// at any point, including before the work has been submitted. A
    /// cancelled delegation tells the remote worker to stop and resolves as
    /// [`RelayError::Cancelled`] without closing the original job.
    pub async fn delegate_with_cancel(
        &self,
        original_id: &str,
        unit: WorkUnit,
        options: DelegateOptions,
        cancel: CancellationToken,
    ) -> Result<RelayHandle, RelayError> {
        let remote_id = match self.create_remote_job().await {
            Ok(id) => id,
            Err(e) => {
                self.fail_original(original_id, &e).await;
                return Err(e);
            }
        };
        info!(original_id, remote_id = %remote_id, "delegating to remote worker");

        // `stop` ends the listener for local reasons too; only `cancel`
        // means the caller asked, and only then does the listener tell the
        // remote worker.
        let stop = cancel.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        let listener = StreamListener {
            client: self.clone(),
            original_id: original_id.to_string(),
            remote_id: remote_id.clone(),
            options,
            stop: stop.clone(),
            requested: cancel.clone(),
        };
        let task = tokio::spawn(listener.run(ready_tx, result_tx));

        match tokio::time::timeout(self.config.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            // The listener already closed the original job.
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(RelayError::Cancelled),
            Err(_) => {
                stop.cancel();
                let err = RelayError::ConnectTimeout {
                    remote_id: remote_id.clone(),
                    after: self.config.connect_timeout,
                };
                self.fail_original(original_id, &err).await;
                self.notify_remote(&remote_id, CloseReason::Error).await;
                return Err(err);
            }
        }

        let submitted = tokio::select! {
            biased;
            // The listener sees the same cancel and notifies the remote.
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            submitted = async {
                tokio::time::sleep(self.config.stabilize_delay).await;
                self.submit(&remote_id, &unit).await
            } => submitted,
        };

        match submitted {
            Ok(ack) => {
                debug!(remote_id = %ack.task_id, status = %ack.status, message = %ack.message, "work submitted");
            }
            Err(e) => {
                stop.cancel();
                self.fail_original(original_id, &e).await;
                self.notify_remote(&remote_id, CloseReason::Error).await;
                return Err(e);
            }
        }

        Ok(RelayHandle {
            original_id: original_id.to_string(),
            remote_id,
            result: result_rx,
            cancel,
            task,
        })
    }

    /// Download what a remote result points at into `dest_dir`.
    ///
    /// An encoded animation moves the original job from 98 to 100 percent.
    /// Frames are fetched one by one between 38 and 40 percent and listed,
    /// with their delays, in a manifest that becomes the artifact. Failures
    /// are only returned; the caller decides how the job closes.
    pub async fn fetch_artifact(
        &self,
        original_id: &str,
        result: &RemoteResult,
        dest_dir: &Path,
    ) -> Result<Artifact, RelayError> {
        let artifact = match &result.output {
            RemoteOutput::Encoded(path) => self.fetch_encoded(original_id, path, dest_dir).await?,
            RemoteOutput::Frames { paths, delays } => {
                self.fetch_frames(original_id, paths, delays, dest_dir).await?
            }
        };
        Ok(match &result.message {
            Some(message) => artifact.with_message(message.clone()),
            None => artifact,
        })
    }

    async fn fetch_encoded(&self, original_id: &str, remote_path: &str, dest_dir: &Path) -> Result<Artifact, RelayError> {
        let (start, end) = ENCODED_FETCH_SPAN;
        self.hub
            .update(
                original_id,
                ProgressFields::new(start, "fetching result").stage("fetch").units(0, 1),
            )
            .await;

        let dest = dest_dir.join(artifact_file_name(remote_path.trim_start_matches('/')));
        let size = self.download(remote_path, &dest).await?;
        info!(original_id, path = %dest.display(), size, "remote artifact saved");

        self.hub
            .update(
                original_id,
                ProgressFields::new(end, "result fetched").stage("fetch").units(1, 1),
            )
            .await;
        Ok(Artifact::new(dest.to_string_lossy(), "image/webp"))
    }

    async fn fetch_frames(
        &self,
        original_id: &str,
        paths: &[String],
        delays: &[u32],
        dest_dir: &Path,
    ) -> Result<Artifact, RelayError> {
        let (start, end) = FRAMES_FETCH_SPAN;
        let total = paths.len();
        self.hub
            .update(
                original_id,
                ProgressFields::new(start, "fetching frames")
                    .stage("fetch")
                    .units(0, total as u64),
            )
            .await;

        let mut local = Vec::with_capacity(total);
        for (index, remote_path) in paths.iter().enumerate() {
            let name = frame_file_name(index, remote_path);
            self.download(remote_path, &dest_dir.join(&name)).await?;
            local.push(name);

            let done = index + 1;
            let percentage = start + done as f64 / total as f64 * (end - start);
            self.hub
                .update(
                    original_id,
                    ProgressFields::new(percentage, format!("fetched frame {done}/{total}"))
                        .stage("fetch")
                        .units(done as u64, total as u64),
                )
                .await;
        }

        let manifest = FrameManifest {
            frame_count: total,
            delays: delays.to_vec(),
            frames: local,
        };
        let dest = dest_dir.join(FRAME_MANIFEST_NAME);
        tokio::fs::write(&dest, serde_json::to_vec_pretty(&manifest)?).await?;
        info!(original_id, path = %dest.display(), frames = total, "remote frames saved");
        Ok(Artifact::new(dest.to_string_lossy(), FRAME_LIST_TYPE))
    }

    /// GET one worker-side file with retry and write it to `dest`.
    async fn download(&self, remote_path: &str, dest: &Path) -> Result<usize, RelayError> {
        let remote_path = remote_path.trim_start_matches('/');
        let bytes = with_retry("fetch artifact", self.retry_policy(), || async move {
            let resp = self
                .http
                .get(self.url(&format!("/api/get-image/{remote_path}")))
                .timeout(self.config.request_timeout)
                .send()
                .await?;
            Ok::<_, RelayError>(expect_success(resp, "fetch artifact").await?.bytes().await?)
        })
        .await?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len())
    }

    async fn submit(&self, remote_id: &str, unit: &WorkUnit) -> Result<SubmitAck, RelayError> {
        with_retry("submit work", self.retry_policy(), || async move {
            let part = Part::bytes(unit.bytes.to_vec())
                .file_name(unit.filename.clone())
                .mime_str(&unit.mime)?;
            let form = Form::new()
                .part("image", part)
                .text("task_id", remote_id.to_string());
            let resp = self
                .http
                .post(self.url("/api/process-webp"))
                .multipart(form)
                .timeout(self.config.request_timeout)
                .send()
                .await?;
            let ack: SubmitAck = expect_success(resp, "submit work").await?.json().await?;
            Ok::<_, RelayError>(ack)
        })
        .await
    }

    async fn open_stream(&self, remote_id: &str) -> Result<reqwest::Response, RelayError> {
        with_retry("open event stream", self.retry_policy(), || async move {
            // No request timeout here: it would cut the stream body off.
            let resp = self
                .http
                .get(self.url(&format!("/api/progress/{remote_id}")))
                .header(ACCEPT, "text/event-stream")
                .send()
                .await?;
            Ok::<_, RelayError>(expect_success(resp, "open event stream").await?)
        })
        .await
    }

    async fn fail_original(&self, original_id: &str, err: &RelayError) {
        error!(original_id, origin = err.origin().as_str(), error = %err, "delegation failed");
        self.hub.close(original_id, CloseReason::Error).await;
    }

    /// Best effort: the remote side times the stream out on its own.
    pub async fn notify_remote(&self, remote_id: &str, reason: CloseReason) {
        if let Err(e) = self.send_close(remote_id, reason).await {
            warn!(remote_id, %reason, error = %e, "could not notify remote worker of close");
        }
    }
}

/// Last segment of a remote path. Never lets the remote pick a directory.
fn artifact_file_name(remote_path: &str) -> &str {
    Path::new(remote_path)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(FALLBACK_ARTIFACT_NAME)
}

/// Frames are renamed by position so that equal remote names cannot collide.
fn frame_file_name(index: usize, remote_path: &str) -> String {
    let ext = Path::new(remote_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("png");
    format!("frame_{index:04}.{ext}")
}

async fn expect_success(resp: reqwest::Response, call: &'static str) -> Result<reqwest::Response, RelayError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RelayError::Protocol {
        call,
        detail: format!("HTTP {status}: {body}"),
    })
}

/// A submitted delegation.
pub struct RelayHandle {
    original_id: JobId,
    remote_id: JobId,
    result: oneshot::Receiver<Result<RemoteResult, RelayError>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn original_id(&self) -> &str {
        &self.original_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Drop the event stream and tell the remote worker to stop. The handle
    /// resolves as cancelled; the original job is left for the caller to
    /// close.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the remote result.
    pub async fn result(self) -> Result<RemoteResult, RelayError> {
        self.result.await.unwrap_or(Err(RelayError::Cancelled))
    }
}

struct StreamListener {
    client: RelayClient,
    original_id: JobId,
    remote_id: JobId,
    options: DelegateOptions,
    stop: CancellationToken,
    requested: CancellationToken,
}

impl StreamListener {
    async fn run(
        self,
        ready: oneshot::Sender<Result<(), RelayError>>,
        result: oneshot::Sender<Result<RemoteResult, RelayError>>,
    ) {
        let opened = tokio::select! {
            biased;
            _ = self.stop.cancelled() => {
                self.cancelled().await;
                let _ = result.send(Err(RelayError::Cancelled));
                return;
            }
            opened = self.client.open_stream(&self.remote_id) => opened,
        };
        let response = match opened {
            Ok(response) => {
                debug!(remote_id = %self.remote_id, "event stream connected");
                let _ = ready.send(Ok(()));
                response
            }
            Err(e) => {
                self.client.fail_original(&self.original_id, &e).await;
                let _ = ready.send(Err(e));
                return;
            }
        };
        let outcome = self.pump(response).await;
        let _ = result.send(outcome);
    }

    async fn pump(&self, response: reqwest::Response) -> Result<RemoteResult, RelayError> {
        let mut binding = Binding::new(self.client.config.heartbeat_threshold);
        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    self.cancelled().await;
                    return Err(RelayError::Cancelled);
                }
                chunk = body.next() => chunk,
            };
            let frames = match chunk {
                Some(Ok(bytes)) => decoder.feed(&bytes),
                Some(Err(e)) => {
                    warn!(remote_id = %self.remote_id, error = %e, "event stream read failed");
                    break;
                }
                None => break,
            };
            for frame in frames {
                let event = match RemoteEvent::parse(&frame) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(remote_id = %self.remote_id, event = %frame.event, error = %e, "unparseable remote event skipped");
                        continue;
                    }
                };
                if let Some(outcome) = self.apply(binding.on_event(event)).await {
                    return outcome;
                }
            }
        }

        match self.apply(binding.on_transport_end()).await {
            Some(outcome) => outcome,
            None => Err(RelayError::StreamEnded {
                remote_id: self.remote_id.clone(),
            }),
        }
    }

    async fn cancelled(&self) {
        if self.requested.is_cancelled() {
            info!(original_id = %self.original_id, remote_id = %self.remote_id, "delegation cancelled");
            self.client.notify_remote(&self.remote_id, CloseReason::Error).await;
        }
    }

    /// Perform one translated step. `Some` once the delegation is over.
    async fn apply(&self, step: Step) -> Option<Result<RemoteResult, RelayError>> {
        let hub = &self.client.hub;
        let original = self.original_id.as_str();
        let remote_reason = step.remote_close_reason();

        let outcome = match step {
            Step::Continue => return None,
            Step::Progress(fields) => {
                hub.update(original, fields).await;
                return None;
            }
            Step::Resolved(result) => {
                info!(original_id = original, remote_id = %self.remote_id, locator = result.locator(), "remote result received");
                if self.options.publish_result {
                    hub.publish_result(original, result.to_artifact()).await;
                }
                Ok(result)
            }
            Step::Failed(message) => {
                let err = RelayError::Remote {
                    remote_id: self.remote_id.clone(),
                    message,
                };
                self.client.fail_original(original, &err).await;
                Err(err)
            }
            Step::HeartbeatTimeout { misses } => {
                let err = RelayError::HeartbeatTimeout {
                    remote_id: self.remote_id.clone(),
                    misses,
                };
                warn!(original_id = original, origin = err.origin().as_str(), error = %err, "remote worker went quiet");
                hub.close(original, CloseReason::HeartbeatTimeout).await;
                Err(err)
            }
            Step::Ended => {
                let err = RelayError::StreamEnded {
                    remote_id: self.remote_id.clone(),
                };
                self.client.fail_original(original, &err).await;
                Err(err)
            }
        };

        if let Some(reason) = remote_reason {
            self.client.notify_remote(&self.remote_id, reason).await;
        }
        Some(outcome)
    }
}
