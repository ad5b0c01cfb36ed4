// crates/core/src/pipeline/mod.rs
//! Parallel frame pipeline.
//!
//! Fans a multi-frame job out to a bounded set of blocking workers
//! (decode, text generation, render per frame), folds their stage
//! completions into one job percentage, then encodes the collected frames
//! sequentially on a single worker.
//!
//! Snapshots carry the number of whichever frame just finished a stage, so
//! under concurrency the frame counter can move backwards even though the
//! percentage never does.

mod accumulator;
mod policy;
pub mod ramp;
mod units;

use std::sync::Arc;

use charart_types::{Artifact, CloseReason, ProgressFields};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{PipelineConfig, MIN_INTERVAL};
use crate::error::{FrameError, PipelineError};
use crate::hub::ProgressHub;
pub use accumulator::StageAccumulator;
pub use policy::{available_parallelism, ProgressSpan, WorkerPolicy};
pub use units::{Stage, UnitReporter, STAGES_PER_FRAME};
use units::WorkerReport;

/// Per-frame work. Implementations run on blocking threads.
pub trait FrameWork: Send + Sync + 'static {
    type Frame: Send + 'static;
    type Text: Send + 'static;
    type Rendered: Send + 'static;

    fn frame_count(&self) -> usize;

    fn decode(&self, index: usize) -> Result<Self::Frame, FrameError>;

    fn to_text(&self, frame: &Self::Frame, units: &mut UnitReporter) -> Result<Self::Text, FrameError>;

    fn render(&self, text: &Self::Text, units: &mut UnitReporter) -> Result<Self::Rendered, FrameError>;
}

/// Final container encoder. Runs once, on one thread, after every frame is in.
pub trait FrameEncoder<R>: Send + 'static {
    fn encode(self, frames: Vec<R>) -> Result<Artifact, FrameError>;
}

pub struct FramePipeline {
    hub: Arc<ProgressHub>,
    config: PipelineConfig,
    policy: WorkerPolicy,
    span: ProgressSpan,
    parallelism: usize,
}

impl FramePipeline {
    pub fn new(hub: Arc<ProgressHub>, config: &PipelineConfig) -> Self {
        Self {
            hub,
            policy: WorkerPolicy::from(config),
            config: config.clone(),
            span: ProgressSpan::default(),
            parallelism: available_parallelism(),
        }
    }

    pub fn with_span(mut self, span: ProgressSpan) -> Self {
        self.span = span;
        self
    }

    pub fn with_policy(mut self, policy: WorkerPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the detected core count (tests, constrained containers).
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn worker_count(&self, frame_count: usize) -> usize {
        self.policy.worker_count(frame_count, self.parallelism)
    }

    /// Run every frame of `work`, then `encoder`, reporting into the hub
    /// under `job_id`. On failure the job has been advanced to the failing
    /// phase's target and closed with an error before this returns.
    pub async fn run<W, E>(&self, job_id: &str, work: W, encoder: E) -> Result<Artifact, PipelineError>
    where
        W: FrameWork,
        E: FrameEncoder<W::Rendered>,
    {
        let frames = match self.run_frames(job_id, Arc::new(work)).await {
            Ok(frames) => frames,
            Err(e) => {
                self.fail(job_id, self.span.end, &e).await;
                return Err(e);
            }
        };
        match self.encode(job_id, frames, encoder).await {
            Ok(artifact) => Ok(artifact),
            Err(e) => {
                self.fail(job_id, self.span.encode_end, &e).await;
                Err(e)
            }
        }
    }

    async fn run_frames<W: FrameWork>(
        &self,
        job_id: &str,
        work: Arc<W>,
    ) -> Result<Vec<W::Rendered>, PipelineError> {
        let frame_count = work.frame_count();
        if frame_count == 0 {
            return Err(PipelineError::NoFrames);
        }
        let workers = self.worker_count(frame_count);
        let acc = Arc::new(StageAccumulator::new(
            self.span.start,
            self.span.end,
            frame_count,
            STAGES_PER_FRAME,
        ));
        info!(job_id, frames = frame_count, workers, "starting frame pipeline");
        self.hub
            .update(
                job_id,
                ProgressFields::new(
                    self.span.start,
                    format!("processing {frame_count} frames with {workers} workers"),
                )
                .stage("frames")
                .units(0, frame_count as u64),
            )
            .await;

        let semaphore = Arc::new(Semaphore::new(workers));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        for index in 0..frame_count {
            let work = Arc::clone(&work);
            let acc = Arc::clone(&acc);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let tx = tx.clone();
            let timeout = self.config.frame_timeout.max(MIN_INTERVAL);
            let interval = self.config.unit_report_interval;

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Join(e.to_string()))?;
                if cancel.is_cancelled() {
                    return Err(PipelineError::frame(index, FrameError::Cancelled));
                }
                let blocking = tokio::task::spawn_blocking(move || {
                    process_frame(&*work, index, &acc, tx, cancel, interval)
                });
                match tokio::time::timeout(timeout, blocking).await {
                    Ok(Ok(Ok(rendered))) => Ok((index, rendered)),
                    Ok(Ok(Err(e))) => Err(PipelineError::frame(index, e)),
                    Ok(Err(join)) => Err(PipelineError::Join(join.to_string())),
                    Err(_) => Err(PipelineError::Timeout {
                        index,
                        after: timeout,
                    }),
                }
            });
        }
        drop(tx);

        let mut slots: Vec<Option<W::Rendered>> = (0..frame_count).map(|_| None).collect();
        loop {
            tokio::select! {
                biased;
                Some(report) = rx.recv() => {
                    self.forward(job_id, &acc, frame_count, report).await;
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok((index, rendered)))) => {
                        slots[index] = Some(rendered);
                    }
                    Some(Ok(Err(e))) => {
                        cancel.cancel();
                        tasks.abort_all();
                        return Err(e);
                    }
                    Some(Err(join)) => {
                        cancel.cancel();
                        tasks.abort_all();
                        return Err(PipelineError::Join(join.to_string()));
                    }
                },
            }
        }
        while let Ok(report) = rx.try_recv() {
            self.forward(job_id, &acc, frame_count, report).await;
        }

        debug!(job_id, completed = acc.completed(), "all frames done");
        slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| slot.ok_or_else(|| PipelineError::Join(format!("frame {i} produced no output"))))
            .collect()
    }

    async fn forward(&self, job_id: &str, acc: &StageAccumulator, frame_count: usize, report: WorkerReport) {
        match report {
            WorkerReport::StageDone { frame, stage } => {
                let message = format!("frame {}/{} {} done", frame + 1, frame_count, stage.name());
                self.hub
                    .update_with(job_id, || {
                        ProgressFields::new(acc.percentage(), message)
                            .stage(stage.name())
                            .units(frame as u64 + 1, frame_count as u64)
                    })
                    .await;
            }
            WorkerReport::Units {
                frame,
                stage,
                current,
                total,
            } => {
                let message = format!("frame {} {}: {current}/{total}", frame + 1, stage.name());
                self.hub
                    .update_with(job_id, || {
                        ProgressFields::new(acc.percentage(), message)
                            .stage(stage.name())
                            .units(current, total)
                    })
                    .await;
            }
        }
    }

    async fn encode<R, E>(&self, job_id: &str, frames: Vec<R>, encoder: E) -> Result<Artifact, PipelineError>
    where
        R: Send + 'static,
        E: FrameEncoder<R>,
    {
        let start = self.span.end;
        let target = self.span.encode_end;
        let steps = self.config.encode_poll_steps.max(1);
        let step = (target - start) / f64::from(steps);

        self.hub
            .update(job_id, ProgressFields::new(start, "encoding").stage("encode"))
            .await;

        let mut handle = tokio::task::spawn_blocking(move || encoder.encode(frames));
        let mut ticker = tokio::time::interval(self.config.progress_update_interval.max(MIN_INTERVAL));
        ticker.tick().await;

        let mut taken = 0u32;
        let outcome = loop {
            tokio::select! {
                res = &mut handle => break res,
                _ = ticker.tick() => {
                    if taken + 1 < steps {
                        taken += 1;
                        let pct = start + step * f64::from(taken);
                        self.hub
                            .update(
                                job_id,
                                ProgressFields::new(pct, "encoding")
                                    .stage("encode")
                                    .units(u64::from(taken), u64::from(steps)),
                            )
                            .await;
                    }
                }
            }
        };

        match outcome {
            Ok(Ok(artifact)) => {
                self.hub
                    .update(job_id, ProgressFields::new(target, "encode complete").stage("encode"))
                    .await;
                info!(job_id, locator = %artifact.locator, "frames encoded");
                Ok(artifact)
            }
            Ok(Err(e)) => Err(PipelineError::Encode(e)),
            Err(join) => Err(PipelineError::Join(join.to_string())),
        }
    }

    async fn fail(&self, job_id: &str, target: f64, err: &PipelineError) {
        error!(job_id, error = %err, "frame pipeline failed");
        self.hub
            .update(job_id, ProgressFields::new(target, err.to_string()).stage("failed"))
            .await;
        self.hub.close(job_id, CloseReason::Error).await;
    }
}

fn process_frame<W: FrameWork>(
    work: &W,
    index: usize,
    acc: &StageAccumulator,
    tx: mpsc::UnboundedSender<WorkerReport>,
    cancel: CancellationToken,
    interval: u64,
) -> Result<W::Rendered, FrameError> {
    let finish = |stage: Stage| {
        acc.complete_stage();
        let _ = tx.send(WorkerReport::StageDone { frame: index, stage });
    };
    let mut units = UnitReporter::new(index, Stage::Text, interval, tx.clone(), cancel);

    units.check_cancelled()?;
    let frame = work.decode(index)?;
    finish(Stage::Decode);

    units.check_cancelled()?;
    let text = work.to_text(&frame, &mut units)?;
    finish(Stage::Text);

    units.check_cancelled()?;
    units.next_stage(Stage::Render);
    let rendered = work.render(&text, &mut units)?;
    finish(Stage::Render);

    Ok(rendered)
}
