// crates/core/src/error.rs
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Failure inside one unit of frame work.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("text generation failed: {0}")]
    Text(String),

    #[error("render failed: {0}")]
    Render(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("cancelled")]
    Cancelled,
}

/// Fatal pipeline outcome. The job has already been closed with an error
/// by the time one of these is returned.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("job has no frames")]
    NoFrames,

    #[error("frame {index} failed: {source}")]
    Frame {
        index: usize,
        #[source]
        source: FrameError,
    },

    #[error("frame {index} timed out after {after:?}")]
    Timeout { index: usize, after: Duration },

    #[error("encode failed: {0}")]
    Encode(#[source] FrameError),

    #[error("worker task failed: {0}")]
    Join(String),
}

impl PipelineError {
    pub fn frame(index: usize, source: FrameError) -> Self {
        Self::Frame { index, source }
    }

    /// Frame index the failure is attributed to, if any.
    pub fn frame_index(&self) -> Option<usize> {
        match self {
            Self::Frame { index, .. } | Self::Timeout { index, .. } => Some(*index),
            _ => None,
        }
    }
}
