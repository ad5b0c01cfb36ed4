// crates/types/src/reason.rs
//! Why a job's stream was closed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

/// Typed cause attached to a job's terminal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../bindings/"))]
pub enum CloseReason {
    #[serde(rename = "TASK_COMPLETED")]
    Completed,
    #[serde(rename = "HEARTBEAT_TIMEOUT")]
    HeartbeatTimeout,
    #[serde(rename = "ERROR_OCCURRED")]
    Error,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown close reason: {0}")]
pub struct UnknownCloseReason(pub String);

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Completed => "TASK_COMPLETED",
            CloseReason::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            CloseReason::Error => "ERROR_OCCURRED",
        }
    }

    /// Message carried by the terminal snapshot of a closed job.
    pub fn close_message(&self) -> &'static str {
        match self {
            CloseReason::Completed => "task completed",
            CloseReason::HeartbeatTimeout => "heartbeat timeout",
            CloseReason::Error => "error occurred",
        }
    }

    /// Heartbeat timeouts and errors abandon the job's temp resources.
    pub fn triggers_cleanup(&self) -> bool {
        matches!(self, CloseReason::HeartbeatTimeout | CloseReason::Error)
    }

    /// Lenient parse used for query parameters: absent or unknown means
    /// the caller is simply done with the job.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        raw.and_then(|s| s.parse().ok())
            .unwrap_or(CloseReason::Completed)
    }

    /// Map the remote worker's lowercase vocabulary onto local reasons.
    pub fn from_remote(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => CloseReason::Error,
            "timeout" => CloseReason::HeartbeatTimeout,
            _ => CloseReason::Completed,
        }
    }
}

impl FromStr for CloseReason {
    type Err = UnknownCloseReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TASK_COMPLETED" => Ok(CloseReason::Completed),
            "HEARTBEAT_TIMEOUT" => Ok(CloseReason::HeartbeatTimeout),
            "ERROR_OCCURRED" => Ok(CloseReason::Error),
            _ => Err(UnknownCloseReason(s.to_string())),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
