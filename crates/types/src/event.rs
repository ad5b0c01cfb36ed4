// crates/types/src/event.rs
//! Progress snapshots, result payloads, and the event union delivered to
//! listeners.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::reason::CloseReason;

/// Opaque job identifier. Caller-supplied or hub-generated.
pub type JobId = String;

/// Stage name used by the synthetic snapshot for unknown jobs.
pub const WAITING_STAGE: &str = "init";
/// Stage name carried by the terminal snapshot of a closed job.
pub const CLOSED_STAGE: &str = "closed";

/// One point on a job's progress timeline. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../bindings/"))]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub percentage: f64,
    pub message: String,
    pub stage: String,
    #[ts(type = "number")]
    pub current_unit: u64,
    #[ts(type = "number")]
    pub total_units: u64,
    pub done: bool,
    #[ts(type = "number")]
    pub timestamp: i64,
}

/// Producer-side fields of a snapshot. The hub stamps the job id and time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressFields {
    pub percentage: f64,
    pub message: String,
    pub stage: String,
    pub current_unit: u64,
    pub total_units: u64,
    pub done: bool,
}

impl ProgressFields {
    pub fn new(percentage: f64, message: impl Into<String>) -> Self {
        Self {
            percentage,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }

    pub fn units(mut self, current: u64, total: u64) -> Self {
        self.current_unit = current;
        self.total_units = total;
        self
    }

    pub fn done(mut self, done: bool) -> Self {
        self.done = done;
        self
    }
}

impl ProgressSnapshot {
    pub fn from_fields(job_id: impl Into<JobId>, fields: ProgressFields) -> Self {
        Self {
            job_id: job_id.into(),
            percentage: fields.percentage.clamp(0.0, 100.0),
            message: fields.message,
            stage: fields.stage,
            current_unit: fields.current_unit,
            total_units: fields.total_units,
            done: fields.done,
            timestamp: crate::now_millis(),
        }
    }

    /// Zero-progress placeholder returned for unknown or retired jobs.
    pub fn waiting(job_id: impl Into<JobId>) -> Self {
        Self::from_fields(
            job_id,
            ProgressFields::new(0.0, "waiting").stage(WAITING_STAGE),
        )
    }

    /// Terminal snapshot appended by a close.
    pub fn terminal(job_id: impl Into<JobId>, reason: CloseReason) -> Self {
        Self::from_fields(
            job_id,
            ProgressFields::new(100.0, reason.close_message())
                .stage(CLOSED_STAGE)
                .done(true),
        )
    }

    pub fn is_waiting(&self) -> bool {
        self.stage == WAITING_STAGE && self.percentage == 0.0 && !self.done
    }
}

/// Where the finished artifact lives and what it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub locator: String,
    pub content_type: String,
    pub message: Option<String>,
}

impl Artifact {
    pub fn new(locator: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            content_type: content_type.into(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Final conversion artifact, kept apart from progress so late consumers
/// can still find it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../bindings/"))]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub job_id: JobId,
    pub artifact_locator: String,
    pub content_type: String,
    #[ts(type = "number")]
    pub timestamp: i64,
    pub status: String,
    pub message: String,
}

impl ResultPayload {
    pub fn success(job_id: impl Into<JobId>, artifact: Artifact) -> Self {
        Self {
            job_id: job_id.into(),
            artifact_locator: artifact.locator,
            content_type: artifact.content_type,
            timestamp: crate::now_millis(),
            status: "success".to_string(),
            message: artifact
                .message
                .unwrap_or_else(|| "conversion complete".to_string()),
        }
    }
}

/// Unit delivered to hub listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ProgressUpdate(ProgressSnapshot),
    ResultReady(ResultPayload),
    Closed(ProgressSnapshot, CloseReason),
}

impl Event {
    pub fn job_id(&self) -> &str {
        match self {
            Event::ProgressUpdate(s) | Event::Closed(s, _) => &s.job_id,
            Event::ResultReady(r) => &r.job_id,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Event::Closed(..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let snap = ProgressSnapshot::from_fields(
            "j1",
            ProgressFields::new(42.5, "rendering").stage("render").units(3, 10),
        );
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["jobId"], "j1");
        assert_eq!(json["currentUnit"], 3);
        assert_eq!(json["totalUnits"], 10);
        assert_eq!(json["done"], false);
    }

    #[test]
    fn test_percentage_is_clamped() {
        let snap = ProgressSnapshot::from_fields("j", ProgressFields::new(140.0, "x"));
        assert_eq!(snap.percentage, 100.0);
        let snap = ProgressSnapshot::from_fields("j", ProgressFields::new(-3.0, "x"));
        assert_eq!(snap.percentage, 0.0);
    }

    #[test]
    fn test_waiting_snapshot() {
        let snap = ProgressSnapshot::waiting("gone");
        assert!(snap.is_waiting());
        assert_eq!(snap.job_id, "gone");
        assert_eq!(snap.message, "waiting");
    }

    #[test]
    fn test_terminal_snapshot_uses_reason_message() {
        let snap = ProgressSnapshot::terminal("j", CloseReason::HeartbeatTimeout);
        assert_eq!(snap.percentage, 100.0);
        assert!(snap.done);
        assert_eq!(snap.message, "heartbeat timeout");
        assert_eq!(snap.stage, CLOSED_STAGE);
    }

    #[test]
    fn test_result_defaults() {
        let r = ResultPayload::success("j", Artifact::new("/tmp/out.gif", "image/gif"));
        assert_eq!(r.status, "success");
        assert_eq!(r.message, "conversion complete");

        let r = ResultPayload::success(
            "j",
            Artifact::new("/tmp/out.txt", "text/plain").with_message("remote done"),
        );
        assert_eq!(r.message, "remote done");
    }

    #[test]
    fn test_event_job_id() {
        let ev = Event::Closed(
            ProgressSnapshot::terminal("j9", CloseReason::Completed),
            CloseReason::Completed,
        );
        assert_eq!(ev.job_id(), "j9");
        assert!(ev.is_closed());
    }
}
