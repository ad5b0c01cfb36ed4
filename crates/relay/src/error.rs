// crates/relay/src/error.rs
use std::time::Duration;

use thiserror::Error;

/// Which side of the delegation a failure came from. Only logs see this;
/// hub consumers get a uniform error close either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Remote => "remote",
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no remote worker configured")]
    NotConfigured,

    #[error("{call} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        call: &'static str,
        attempts: u32,
        last: String,
    },

    #[error("event stream for remote job {remote_id} did not connect within {after:?}")]
    ConnectTimeout { remote_id: String, after: Duration },

    #[error("remote job {remote_id} failed: {message}")]
    Remote { remote_id: String, message: String },

    #[error("remote job {remote_id} missed {misses} heartbeats")]
    HeartbeatTimeout { remote_id: String, misses: u32 },

    #[error("event stream for remote job {remote_id} ended without a terminal event")]
    StreamEnded { remote_id: String },

    #[error("unexpected response from {call}: {detail}")]
    Protocol { call: &'static str, detail: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("saving artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("writing frame manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("delegation cancelled")]
    Cancelled,
}

impl RelayError {
    pub fn origin(&self) -> Origin {
        match self {
            RelayError::Remote { .. }
            | RelayError::HeartbeatTimeout { .. }
            | RelayError::StreamEnded { .. }
            | RelayError::Protocol { .. } => Origin::Remote,
            RelayError::NotConfigured
            | RelayError::RetriesExhausted { .. }
            | RelayError::ConnectTimeout { .. }
            | RelayError::Http(_)
            | RelayError::Io(_)
            | RelayError::Manifest(_)
            | RelayError::Cancelled => Origin::Local,
        }
    }
}
