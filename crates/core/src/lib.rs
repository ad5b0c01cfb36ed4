// crates/core/src/lib.rs
//! Progress hub, streaming consumer, frame pipeline and job runner.

pub mod config;
pub mod consumer;
pub mod error;
pub mod hub;
pub mod pipeline;
pub mod runner;

pub use config::{AppConfig, ConsumerConfig, HubConfig, LoggingConfig, PipelineConfig, RelayConfig, ServerConfig};
pub use consumer::{is_expected_disconnect, ConsumerExit, EventSink, StreamingConsumer};
pub use error::{ConfigError, FrameError, PipelineError};
pub use hub::{CleanupHook, Interest, ListenerId, ProgressHub, Subscription};
pub use pipeline::{FrameEncoder, FramePipeline, FrameWork, ProgressSpan, UnitReporter, WorkerPolicy};
pub use runner::{JobContext, JobHandle, JobRunner};
