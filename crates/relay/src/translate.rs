// crates/relay/src/translate.rs
//! Remote event vocabulary and the per-delegation state machine that turns
//! it into hub actions.

use charart_types::{Artifact, CloseReason, ProgressFields};
use serde::Deserialize;

use crate::sse::SseFrame;

pub const HEARTBEAT: &str = "heartbeat";
pub const PROGRESS: &str = "webp";
pub const RESULT: &str = "webp_result";
pub const ERROR: &str = "webp_error";
pub const CLOSE: &str = "close";

/// Progress as the remote worker reports it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteProgress {
    pub progress: f64,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "status")]
    pub stage: Option<String>,
    #[serde(default, alias = "current_step")]
    pub current_frame: Option<u64>,
    #[serde(default, alias = "total_steps")]
    pub total_frames: Option<u64>,
}

impl RemoteProgress {
    pub fn to_fields(&self) -> ProgressFields {
        ProgressFields::new(self.progress, self.message.clone())
            .stage(self.stage.as_deref().unwrap_or("remote"))
            .units(self.current_frame.unwrap_or(0), self.total_frames.unwrap_or(0))
    }
}

/// Content type of a published frame list that has not been fetched.
pub const FRAME_LIST_TYPE: &str = "application/json";

/// Terminal success payload as it arrives on the wire. The worker either
/// hands back one encoded file (`webp`) or the extracted frames.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResultFrame {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub webp: Option<String>,
    #[serde(default)]
    pub frames: Option<Vec<String>>,
    #[serde(default)]
    pub delays: Option<Vec<u32>>,
    #[serde(default, rename = "frameCount")]
    pub frame_count: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// What the worker produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutput {
    /// One encoded animation.
    Encoded(String),
    /// Extracted frames with their display delays in milliseconds.
    Frames { paths: Vec<String>, delays: Vec<u32> },
}

/// A validated remote result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "ResultFrame")]
pub struct RemoteResult {
    pub task_id: String,
    pub output: RemoteOutput,
    pub message: Option<String>,
}

impl TryFrom<ResultFrame> for RemoteResult {
    type Error = String;

    fn try_from(frame: ResultFrame) -> Result<Self, Self::Error> {
        let output = match frame {
            ResultFrame { webp: Some(ref path), .. } if !path.trim().is_empty() => {
                RemoteOutput::Encoded(path.clone())
            }
            ResultFrame {
                frames: Some(ref paths),
                delays: Some(ref delays),
                frame_count: Some(count),
                ..
            } => {
                if count == 0 || paths.is_empty() {
                    return Err("remote worker returned no frames".into());
                }
                if paths.len() as u64 != count || delays.len() != paths.len() {
                    return Err(format!(
                        "incomplete frame result: frameCount={count}, {} frames, {} delays",
                        paths.len(),
                        delays.len()
                    ));
                }
                RemoteOutput::Frames {
                    paths: paths.clone(),
                    delays: delays.clone(),
                }
            }
            _ => return Err("result carries neither an encoded file nor frames".into()),
        };
        Ok(Self {
            task_id: frame.task_id,
            output,
            message: frame.message,
        })
    }
}

impl RemoteResult {
    /// Where the output lives on the worker. For frames this is the first one.
    pub fn locator(&self) -> &str {
        match &self.output {
            RemoteOutput::Encoded(path) => path,
            RemoteOutput::Frames { paths, .. } => &paths[0],
        }
    }

    pub fn frame_count(&self) -> usize {
        match &self.output {
            RemoteOutput::Encoded(_) => 1,
            RemoteOutput::Frames { paths, .. } => paths.len(),
        }
    }

    /// Artifact naming the worker-side output, before anything is fetched.
    pub fn to_artifact(&self) -> Artifact {
        let artifact = match &self.output {
            RemoteOutput::Encoded(path) => Artifact::new(path.as_str(), "image/webp"),
            RemoteOutput::Frames { paths, .. } => Artifact::new(self.task_id.as_str(), FRAME_LIST_TYPE)
                .with_message(format!("{} frames", paths.len())),
        };
        match &self.message {
            Some(message) => artifact.with_message(message.clone()),
            None => artifact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteFailure {
    #[serde(alias = "message")]
    pub error: String,
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteClose {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Heartbeat,
    Progress(RemoteProgress),
    Result(ResultFrame),
    Error(RemoteFailure),
    Close(RemoteClose),
    Other(String),
}

impl RemoteEvent {
    pub fn parse(frame: &SseFrame) -> Result<Self, serde_json::Error> {
        Ok(match frame.event.as_str() {
            HEARTBEAT => RemoteEvent::Heartbeat,
            PROGRESS => RemoteEvent::Progress(serde_json::from_str(&frame.data)?),
            RESULT => RemoteEvent::Result(serde_json::from_str(&frame.data)?),
            ERROR => RemoteEvent::Error(serde_json::from_str(&frame.data)?),
            CLOSE => RemoteEvent::Close(serde_json::from_str(&frame.data)?),
            other => RemoteEvent::Other(other.to_string()),
        })
    }
}

/// What the client should do after one remote event.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Nothing to forward.
    Continue,
    Progress(ProgressFields),
    Resolved(RemoteResult),
    Failed(String),
    HeartbeatTimeout { misses: u32 },
    /// The stream finished without a result or an error.
    Ended,
}

impl Step {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Step::Continue | Step::Progress(_))
    }

    /// Reason to report back to the remote worker for a terminal step.
    pub fn remote_close_reason(&self) -> Option<CloseReason> {
        match self {
            Step::Resolved(_) => Some(CloseReason::Completed),
            Step::Failed(_) => Some(CloseReason::Error),
            Step::HeartbeatTimeout { .. } => Some(CloseReason::HeartbeatTimeout),
            Step::Continue | Step::Progress(_) | Step::Ended => None,
        }
    }
}

/// Per-delegation translation state. Heartbeats count up towards the
/// threshold and are not reset by progress; once a terminal step has been
/// produced every later event is ignored.
#[derive(Debug)]
pub struct Binding {
    threshold: u32,
    misses: u32,
    finished: bool,
}

impl Binding {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            misses: 0,
            finished: false,
        }
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn on_event(&mut self, event: RemoteEvent) -> Step {
        if self.finished {
            return Step::Continue;
        }
        let step = match event {
            RemoteEvent::Heartbeat => {
                self.misses += 1;
                if self.misses >= self.threshold {
                    Step::HeartbeatTimeout { misses: self.misses }
                } else {
                    Step::Continue
                }
            }
            RemoteEvent::Progress(p) => Step::Progress(p.to_fields()),
            RemoteEvent::Result(frame) => match RemoteResult::try_from(frame) {
                Ok(result) => Step::Resolved(result),
                Err(reason) => Step::Failed(reason),
            },
            RemoteEvent::Error(f) => Step::Failed(f.error),
            RemoteEvent::Close(c) => match CloseReason::from_remote(&c.reason) {
                CloseReason::Error => Step::Failed(if c.message.is_empty() {
                    "remote worker closed the stream with an error".to_string()
                } else {
                    c.message
                }),
                CloseReason::HeartbeatTimeout => Step::HeartbeatTimeout { misses: self.misses },
                CloseReason::Completed => Step::Ended,
            },
            RemoteEvent::Other(_) => Step::Continue,
        };
        if step.is_terminal() {
            self.finished = true;
        }
        step
    }

    /// Called when the transport ends or fails.
    pub fn on_transport_end(&mut self) -> Step {
        if self.finished {
            return Step::Continue;
        }
        self.finished = true;
        Step::Ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: event.into(),
            data: data.into(),
        }
    }

    #[test]
    fn test_progress_maps_status_and_steps() {
        let ev = RemoteEvent::parse(&frame(
            "webp",
            r#"{"progress":33.0,"message":"extracting","status":"frames","current_step":2,"total_steps":9}"#,
        ))
        .unwrap();
        let mut binding = Binding::new(12);
        assert_eq!(
            binding.on_event(ev),
            Step::Progress(ProgressFields::new(33.0, "extracting").stage("frames").units(2, 9))
        );
    }

    #[test]
    fn test_progress_accepts_worker_field_names() {
        let ev = RemoteEvent::parse(&frame(
            "webp",
            r#"{"progress":35.5,"message":"m","stage":"extract","current_frame":4,"total_frames":8,"timestamp":1.0,"is_done":false}"#,
        ))
        .unwrap();
        match ev {
            RemoteEvent::Progress(p) => {
                assert_eq!(p.stage.as_deref(), Some("extract"));
                assert_eq!((p.current_frame, p.total_frames), (Some(4), Some(8)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_heartbeats_escalate_at_threshold() {
        let mut binding = Binding::new(3);
        assert_eq!(binding.on_event(RemoteEvent::Heartbeat), Step::Continue);
        // Progress does not reset the counter.
        binding.on_event(RemoteEvent::Progress(RemoteProgress {
            progress: 10.0,
            message: String::new(),
            stage: None,
            current_frame: None,
            total_frames: None,
        }));
        assert_eq!(binding.on_event(RemoteEvent::Heartbeat), Step::Continue);
        assert_eq!(
            binding.on_event(RemoteEvent::Heartbeat),
            Step::HeartbeatTimeout { misses: 3 }
        );
        assert!(binding.is_finished());
        assert_eq!(binding.on_event(RemoteEvent::Heartbeat), Step::Continue);
    }

    #[test]
    fn test_close_reasons() {
        let parse = |reason: &str| {
            RemoteEvent::parse(&frame(
                "close",
                &format!(r#"{{"timestamp":1.0,"message":"bye","reason":"{reason}"}}"#),
            ))
            .unwrap()
        };
        assert_eq!(Binding::new(12).on_event(parse("error")), Step::Failed("bye".into()));
        assert_eq!(
            Binding::new(12).on_event(parse("timeout")),
            Step::HeartbeatTimeout { misses: 0 }
        );
        assert_eq!(Binding::new(12).on_event(parse("completed")), Step::Ended);
    }

    #[test]
    fn test_encoded_result_resolves() {
        let ev = RemoteEvent::parse(&frame(
            "webp_result",
            r#"{"task_id":"r-1","webp":"/tmp/out.webp"}"#,
        ))
        .unwrap();
        let Step::Resolved(result) = Binding::new(12).on_event(ev) else {
            panic!("expected resolved");
        };
        assert_eq!(result.output, RemoteOutput::Encoded("/tmp/out.webp".into()));
        assert_eq!(result.to_artifact().locator, "/tmp/out.webp");
    }

    #[test]
    fn test_frames_result_keeps_every_frame() {
        let ev = RemoteEvent::parse(&frame(
            "webp_result",
            r#"{"task_id":"r-2","frameCount":2,"delays":[40,60],"frames":["/f0.png","/f1.png"]}"#,
        ))
        .unwrap();
        let Step::Resolved(result) = Binding::new(12).on_event(ev) else {
            panic!("expected resolved");
        };
        assert_eq!(
            result.output,
            RemoteOutput::Frames {
                paths: vec!["/f0.png".into(), "/f1.png".into()],
                delays: vec![40, 60],
            }
        );
        assert_eq!(result.frame_count(), 2);
        let artifact = result.to_artifact();
        assert_eq!(artifact.locator, "r-2");
        assert_eq!(artifact.content_type, FRAME_LIST_TYPE);
    }

    #[test]
    fn test_shapeless_or_incomplete_result_fails() {
        let fails = |data: &str| {
            let ev = RemoteEvent::parse(&frame("webp_result", data)).unwrap();
            matches!(Binding::new(12).on_event(ev), Step::Failed(_))
        };
        assert!(fails(r#"{"task_id":"r-3"}"#));
        assert!(fails(r#"{"task_id":"r-3","webp":""}"#));
        assert!(fails(r#"{"task_id":"r-3","frames":["/f0.png"]}"#));
        assert!(fails(r#"{"task_id":"r-3","frameCount":0,"delays":[],"frames":[]}"#));
        assert!(fails(r#"{"task_id":"r-3","frameCount":3,"delays":[40,40],"frames":["/a","/b"]}"#));
    }

    #[test]
    fn test_result_deserializes_through_validation() {
        assert!(serde_json::from_str::<RemoteResult>(r#"{"task_id":"r","webp":"a.webp"}"#).is_ok());
        assert!(serde_json::from_str::<RemoteResult>(r#"{"task_id":"r"}"#).is_err());
    }

    #[test]
    fn test_error_event_and_transport_end() {
        let ev = RemoteEvent::parse(&frame("webp_error", r#"{"error":"not animated","task_id":"r"}"#)).unwrap();
        let mut binding = Binding::new(12);
        assert_eq!(binding.on_event(ev), Step::Failed("not animated".into()));
        assert_eq!(binding.on_transport_end(), Step::Continue);

        assert_eq!(Binding::new(12).on_transport_end(), Step::Ended);
    }

    #[test]
    fn test_unknown_event_is_ignored() {
        let ev = RemoteEvent::parse(&frame("debug", "anything")).unwrap();
        assert_eq!(Binding::new(12).on_event(ev), Step::Continue);
    }
}
