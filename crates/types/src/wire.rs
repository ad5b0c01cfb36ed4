// crates/types/src/wire.rs
//! Named events written to end clients. The names and payload shapes are
//! the client contract; framing (text/event-stream) lives in the server.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::event::{Event, ProgressSnapshot, ResultPayload};
use crate::reason::CloseReason;

pub const PROGRESS: &str = "progress";
pub const RESULT: &str = "result";
pub const CLOSE: &str = "close";
pub const HEARTBEAT: &str = "heartbeat";

/// Payload of the `close` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../bindings/"))]
#[serde(rename_all = "camelCase")]
pub struct ClosePayload {
    pub progress_info: ProgressSnapshot,
    pub close_reason: CloseReason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    Progress(ProgressSnapshot),
    Result(ResultPayload),
    Close(ClosePayload),
    Heartbeat,
}

impl WireEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WireEvent::Progress(_) => PROGRESS,
            WireEvent::Result(_) => RESULT,
            WireEvent::Close(_) => CLOSE,
            WireEvent::Heartbeat => HEARTBEAT,
        }
    }

    /// Event data as written on the wire. Heartbeats carry a bare `ping`.
    pub fn data(&self) -> Result<String, serde_json::Error> {
        match self {
            WireEvent::Progress(s) => serde_json::to_string(s),
            WireEvent::Result(r) => serde_json::to_string(r),
            WireEvent::Close(c) => serde_json::to_string(c),
            WireEvent::Heartbeat => Ok("ping".to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WireEvent::Close(_))
    }
}

impl From<Event> for WireEvent {
    fn from(event: Event) -> Self {
        match event {
            Event::ProgressUpdate(s) => WireEvent::Progress(s),
            Event::ResultReady(r) => WireEvent::Result(r),
            Event::Closed(s, reason) => WireEvent::Close(ClosePayload {
                message: s.message.clone(),
                progress_info: s,
                close_reason: reason,
            }),
        }
    }
}
