// crates/core/src/hub/listener.rs
//! Registered listeners and the subscriptions handed back to consumers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use charart_types::{Event, JobId};
use tokio::sync::mpsc::{self, error::SendTimeoutError};

pub type ListenerId = u64;

/// Which jobs a listener wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    Job(JobId),
    All,
}

impl Interest {
    pub fn matches(&self, job_id: &str) -> bool {
        match self {
            Interest::Job(id) => id == job_id,
            Interest::All => true,
        }
    }
}

impl From<&str> for Interest {
    fn from(id: &str) -> Self {
        Interest::Job(id.to_string())
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// Queue stayed full for the whole enqueue timeout.
    Skipped,
    /// Receiver is gone; the listener should be dropped.
    Gone,
}

pub(crate) struct Listener {
    pub(crate) id: ListenerId,
    pub(crate) interest: Interest,
    tx: mpsc::Sender<Event>,
    active: AtomicBool,
}

impl Listener {
    pub(crate) fn new(id: ListenerId, interest: Interest, tx: mpsc::Sender<Event>) -> Self {
        Self {
            id,
            interest,
            tx,
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Flip the liveness flag. Returns true only for the call that did it.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    pub(crate) async fn deliver(&self, event: Event, timeout: Duration) -> Delivery {
        if !self.is_active() {
            return Delivery::Gone;
        }
        match self.tx.send_timeout(event, timeout).await {
            Ok(()) => Delivery::Delivered,
            Err(SendTimeoutError::Timeout(_)) => Delivery::Skipped,
            Err(SendTimeoutError::Closed(_)) => Delivery::Gone,
        }
    }
}

/// Receiving half of a listener, owned by exactly one consumer.
pub struct Subscription {
    pub(crate) id: ListenerId,
    pub(crate) rx: mpsc::Receiver<Event>,
    pub(crate) listener: Arc<Listener>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn interest(&self) -> &Interest {
        &self.listener.interest
    }

    pub fn is_active(&self) -> bool {
        self.listener.is_active()
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
