// crates/core/src/hub/log.rs
//! Per-job append-only logs.

use std::sync::Arc;

use charart_types::{CloseReason, ProgressSnapshot, ResultPayload};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Snapshot and result history of one job. Entries are only ever pushed.
#[derive(Debug, Default)]
pub(crate) struct JobLog {
    pub(crate) snapshots: Vec<ProgressSnapshot>,
    pub(crate) results: Vec<ResultPayload>,
    pub(crate) closed: Option<CloseReason>,
}

impl JobLog {
    pub(crate) fn latest(&self) -> Option<&ProgressSnapshot> {
        self.snapshots.last()
    }

    pub(crate) fn latest_result(&self) -> Option<&ResultPayload> {
        self.results.last()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closed.is_some()
    }
}

/// One job's state. The mutex serializes append-and-deliver so the append
/// order is the delivery order.
#[derive(Debug, Default)]
pub(crate) struct JobEntry {
    pub(crate) log: Mutex<JobLog>,
}

/// A slot in the job map. Retired jobs leave a tombstone behind so that a
/// straggling producer cannot bring them back.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Live(Arc<JobEntry>),
    Retired(Instant),
}

impl Slot {
    pub(crate) fn live(&self) -> Option<&Arc<JobEntry>> {
        match self {
            Slot::Live(entry) => Some(entry),
            Slot::Retired(_) => None,
        }
    }

    pub(crate) fn tombstone_expired(&self, ttl: std::time::Duration) -> bool {
        match self {
            Slot::Retired(at) => at.elapsed() >= ttl,
            Slot::Live(_) => false,
        }
    }
}
