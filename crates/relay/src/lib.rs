// crates/relay/src/lib.rs
//! Delegates work to a remote worker and mirrors its event stream into the
//! local progress hub.

pub mod client;
pub mod error;
pub mod retry;
pub mod sse;
pub mod translate;

pub use client::{DelegateOptions, RelayClient, RelayHandle, SubmitAck, WorkUnit};
pub use error::{Origin, RelayError};
pub use retry::{backoff_delay, with_retry, RetryPolicy};
pub use translate::{Binding, RemoteEvent, RemoteOutput, RemoteResult, ResultFrame, Step, FRAME_LIST_TYPE};
