// crates/core/src/runner.rs
//! Background job runner.
//!
//! Spawns conversion jobs against the hub and guarantees each one ends with
//! exactly one close: `Completed` after the result is published, `Error`
//! after a failure snapshot.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use charart_types::{Artifact, CloseReason, JobId, ProgressFields};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::hub::ProgressHub;

/// Handle to a running job, used for cancellation.
pub struct JobHandle {
    pub id: JobId,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId, cancel_tx: oneshot::Sender<()>) -> Self {
        Self {
            id,
            cancel_tx: Some(cancel_tx),
        }
    }

    /// Cancel the job. Returns true if the cancellation signal was sent.
    pub fn cancel(mut self) -> bool {
        if let Some(tx) = self.cancel_tx.take() {
            tx.send(()).is_ok()
        } else {
            false
        }
    }
}

/// What a job body gets to report with.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub hub: Arc<ProgressHub>,
}

impl JobContext {
    pub async fn report(&self, fields: ProgressFields) -> bool {
        self.hub.update(&self.job_id, fields).await
    }
}

/// Central runner that owns every job it started until the job closes.
pub struct JobRunner {
    hub: Arc<ProgressHub>,
    running: Arc<RwLock<HashMap<JobId, Instant>>>,
}

impl JobRunner {
    pub fn new(hub: Arc<ProgressHub>) -> Self {
        Self {
            hub,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    /// Start a background job.
    ///
    /// `job_id` defaults to a fresh hub id. The runner writes the job's first
    /// snapshot before `f` starts. `f` receives a [`JobContext`] and a
    /// cancellation receiver.
    pub fn start_job<F, Fut, E>(&self, job_id: Option<JobId>, label: impl Into<String>, f: F) -> JobHandle
    where
        F: FnOnce(JobContext, oneshot::Receiver<()>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Artifact, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let id = job_id.unwrap_or_else(ProgressHub::new_job_id);
        let label = label.into();

        match self.running.write() {
            Ok(mut running) => {
                running.insert(id.clone(), Instant::now());
            }
            Err(e) => error!("RwLock poisoned writing running jobs: {e}"),
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let ctx = JobContext {
            job_id: id.clone(),
            hub: Arc::clone(&self.hub),
        };
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            let hub = Arc::clone(&ctx.hub);
            let job_id = ctx.job_id.clone();
            hub.update(
                &job_id,
                ProgressFields::new(0.0, format!("{label} queued")).stage("queued"),
            )
            .await;

            // The body runs in its own task so a panic surfaces as a
            // JoinError here instead of taking the close down with it.
            let body = tokio::spawn(async move { f(ctx, cancel_rx).await });
            let outcome = match body.await {
                Ok(Ok(artifact)) => Ok(artifact),
                Ok(Err(e)) => Err(e.to_string()),
                Err(join) if join.is_panic() => Err(format!("{label} panicked")),
                Err(join) => Err(join.to_string()),
            };

            match outcome {
                Ok(artifact) => {
                    info!(job_id = %job_id, job = %label, "job finished");
                    hub.publish_result(&job_id, artifact).await;
                    hub.close(&job_id, CloseReason::Completed).await;
                }
                Err(message) => {
                    error!(job_id = %job_id, job = %label, error = %message, "job failed");
                    hub.update(
                        &job_id,
                        ProgressFields::new(100.0, message)
                            .stage("failed")
                            .done(true),
                    )
                    .await;
                    hub.close(&job_id, CloseReason::Error).await;
                }
            }

            match running.write() {
                Ok(mut running) => {
                    running.remove(&job_id);
                }
                Err(e) => error!("RwLock poisoned writing running jobs: {e}"),
            }
        });

        JobHandle::new(id, cancel_tx)
    }

    pub fn is_running(&self, id: &str) -> bool {
        match self.running.read() {
            Ok(running) => running.contains_key(id),
            Err(e) => {
                error!("RwLock poisoned reading running jobs: {e}");
                false
            }
        }
    }

    /// Ids of jobs that have not finished yet.
    pub fn active_jobs(&self) -> Vec<JobId> {
        match self.running.read() {
            Ok(running) => running.keys().cloned().collect(),
            Err(e) => {
                error!("RwLock poisoned reading running jobs: {e}");
                Vec::new()
            }
        }
    }
}
