// crates/core/src/consumer.rs
//! Per-connection bridge from hub pushes to an ordered pull stream.
//!
//! A consumer subscribes before it reads the current state, so nothing that
//! happens between "attach" and "first push" is lost. It then waits on its
//! own queue with the heartbeat interval as timeout: an event is translated
//! to its wire form, silence produces a heartbeat. The consumer never gives
//! up on a quiet job by itself; stalled producers are closed upstream.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use charart_types::{CloseReason, Event, JobId, ProgressSnapshot, WireEvent};
use futures_util::Stream;
use tracing::{debug, error};

use crate::config::{ConsumerConfig, MIN_INTERVAL};
use crate::hub::{ProgressHub, Subscription};

/// Outbound half of one client connection.
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: &WireEvent) -> io::Result<()>;
}

/// How a consumer loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    /// A close event was written.
    Closed(CloseReason),
    /// The peer went away (broken pipe, reset, EOF).
    Disconnected,
    /// The sink failed unexpectedly; the job was closed with an error.
    Failed,
    /// The hub dropped this consumer's queue.
    Detached,
}

pub struct StreamingConsumer {
    hub: Arc<ProgressHub>,
    job_id: JobId,
    subscription: Subscription,
    heartbeat: Duration,
    pending: VecDeque<WireEvent>,
    terminated: bool,
}

impl StreamingConsumer {
    /// Subscribe to `job_id` and queue the current state for immediate
    /// delivery: latest snapshot, then the latest result if any, then the
    /// close notice if the job is already closing.
    pub async fn attach(hub: Arc<ProgressHub>, job_id: impl Into<JobId>, config: &ConsumerConfig) -> Self {
        let job_id = job_id.into();
        let subscription = hub.subscribe(job_id.as_str());

        let snapshot = hub.query(&job_id).await;
        let mut pending = VecDeque::with_capacity(3);
        pending.push_back(WireEvent::Progress(snapshot.clone()));
        if let Some(result) = hub.latest_result(&job_id).await {
            pending.push_back(WireEvent::Result(result));
        }
        if let Some(reason) = hub.closed_reason(&job_id).await {
            let terminal = if snapshot.done {
                snapshot
            } else {
                ProgressSnapshot::terminal(job_id.as_str(), reason)
            };
            pending.push_back(WireEvent::from(Event::Closed(terminal, reason)));
        }

        debug!(job_id = %job_id, listener_id = subscription.id(), "consumer attached");
        Self {
            hub,
            job_id,
            subscription,
            heartbeat: config.heartbeat_interval.max(MIN_INTERVAL),
            pending,
            terminated: false,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Next event to write, or `None` once the consumer has terminated.
    pub async fn next_event(&mut self) -> Option<WireEvent> {
        if self.terminated {
            return None;
        }
        if let Some(event) = self.pending.pop_front() {
            return Some(self.observe(event));
        }

        match tokio::time::timeout(self.heartbeat, self.subscription.recv()).await {
            Ok(Some(event)) => Some(self.observe(WireEvent::from(event))),
            Ok(None) => {
                debug!(job_id = %self.job_id, "consumer queue closed by hub");
                self.terminate();
                None
            }
            Err(_) if !self.subscription.is_active() => {
                debug!(job_id = %self.job_id, "consumer unsubscribed externally");
                self.terminate();
                None
            }
            Err(_) => Some(WireEvent::Heartbeat),
        }
    }

    /// Drive the consumer into `sink` until it terminates.
    pub async fn run<S: EventSink + ?Sized>(mut self, sink: &mut S) -> ConsumerExit {
        while let Some(event) = self.next_event().await {
            if let Err(e) = sink.send(&event).await {
                self.terminate();
                return self.handle_sink_error(e).await;
            }
            if let WireEvent::Close(payload) = &event {
                return ConsumerExit::Closed(payload.close_reason);
            }
        }
        ConsumerExit::Detached
    }

    /// Stream adapter for transports that pull (e.g. an SSE body).
    pub fn into_stream(mut self) -> impl Stream<Item = WireEvent> + Send {
        async_stream::stream! {
            while let Some(event) = self.next_event().await {
                yield event;
            }
        }
    }

    /// Classify a write failure. Expected disconnects end quietly; anything
    /// else is logged loudly and closes the job with an error.
    pub async fn handle_sink_error(&self, err: io::Error) -> ConsumerExit {
        if is_expected_disconnect(&err) {
            debug!(job_id = %self.job_id, error = %err, "client disconnected");
            return ConsumerExit::Disconnected;
        }
        error!(job_id = %self.job_id, error = %err, "failed writing to client");
        self.hub.close(&self.job_id, CloseReason::Error).await;
        ConsumerExit::Failed
    }

    fn observe(&mut self, event: WireEvent) -> WireEvent {
        if event.is_terminal() {
            self.terminate();
        }
        event
    }

    fn terminate(&mut self) {
        if !self.terminated {
            self.terminated = true;
            self.pending.clear();
            self.hub.unsubscribe(self.subscription.id());
        }
    }
}

impl Drop for StreamingConsumer {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Peer-side disconnects that are part of normal client behavior.
pub fn is_expected_disconnect(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    if matches!(
        err.kind(),
        BrokenPipe | ConnectionReset | ConnectionAborted | NotConnected | UnexpectedEof
    ) {
        return true;
    }
    let msg = err.to_string().to_ascii_lowercase();
    ["broken pipe", "connection reset", "connection closed", "stream closed", "socket closed"]
        .iter()
        .any(|needle| msg.contains(needle))
}
