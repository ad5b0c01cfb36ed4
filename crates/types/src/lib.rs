// crates/types/src/lib.rs
//! Shared value types for the charart progress hub.
//!
//! Everything here is immutable once built: producers create snapshots and
//! result payloads, the hub appends them, consumers read them.

pub mod event;
pub mod reason;
pub mod wire;

pub use event::{Artifact, Event, JobId, ProgressFields, ProgressSnapshot, ResultPayload};
pub use reason::{CloseReason, UnknownCloseReason};
pub use wire::{ClosePayload, WireEvent};

/// Milliseconds since the Unix epoch, used for every timestamp on the wire.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
