// crates/core/src/hub/mod.rs
//! In-memory progress hub.
//!
//! Maps job ids to an append-only snapshot log, an append-only result log,
//! and fans every append out to the listeners interested in that job.
//! Appends for one job are serialized by that job's lock and delivered
//! while it is held, so every listener sees a job's events in append order.
//! Different jobs never contend.

mod listener;
mod log;
mod retirement;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use charart_types::{
    Artifact, CloseReason, Event, JobId, ProgressFields, ProgressSnapshot, ResultPayload,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
pub use listener::{Interest, ListenerId, Subscription};
use listener::{Delivery, Listener};
use log::{JobEntry, Slot};
use retirement::RetirementTimers;

/// Releases a job's temporary resources. Invoked on heartbeat-timeout and
/// error closes, before listeners hear about the close.
pub trait CleanupHook: Send + Sync + 'static {
    fn cleanup(&self, job_id: &str);
}

impl<F> CleanupHook for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn cleanup(&self, job_id: &str) {
        self(job_id)
    }
}

pub struct ProgressHub {
    config: HubConfig,
    jobs: Arc<DashMap<JobId, Slot>>,
    listeners: DashMap<ListenerId, Arc<Listener>>,
    next_listener: AtomicU64,
    retirement: RetirementTimers,
    cleanup: RwLock<Option<Arc<dyn CleanupHook>>>,
}

impl ProgressHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            jobs: Arc::new(DashMap::new()),
            listeners: DashMap::new(),
            next_listener: AtomicU64::new(1),
            retirement: RetirementTimers::default(),
            cleanup: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Fresh hub-generated job id.
    pub fn new_job_id() -> JobId {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn set_cleanup_hook(&self, hook: impl CleanupHook) {
        match self.cleanup.write() {
            Ok(mut slot) => *slot = Some(Arc::new(hook)),
            Err(e) => error!("RwLock poisoned writing cleanup hook: {e}"),
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Append a snapshot and notify matching listeners.
    ///
    /// Returns false when the write was dropped because the job is closing
    /// or retired.
    pub async fn update(&self, job_id: &str, fields: ProgressFields) -> bool {
        self.update_with(job_id, move || fields).await
    }

    /// Like [`update`](Self::update), but `fields` is evaluated while the
    /// job's lock is held. Producers that derive the percentage from shared
    /// state use this so that append order matches read order.
    pub async fn update_with<F>(&self, job_id: &str, fields: F) -> bool
    where
        F: FnOnce() -> ProgressFields + Send,
    {
        let Some(entry) = self.writable_entry(job_id) else {
            debug!(job_id, "update for retired job dropped");
            return false;
        };

        let mut log = entry.log.lock().await;
        if log.is_closing() {
            debug!(job_id, "update after close dropped");
            return false;
        }
        let snapshot = ProgressSnapshot::from_fields(job_id, fields());
        let done = snapshot.done;
        log.snapshots.push(snapshot.clone());
        self.deliver(Event::ProgressUpdate(snapshot)).await;
        drop(log);

        counter!("charart_hub_events_total", "kind" => "progress").increment(1);
        if done || self.retirement.is_pending(job_id) {
            self.schedule_retirement(job_id);
        }
        true
    }

    /// Append a result payload and notify listeners.
    pub async fn publish_result(&self, job_id: &str, artifact: Artifact) -> bool {
        let Some(entry) = self.writable_entry(job_id) else {
            debug!(job_id, "result for retired job dropped");
            return false;
        };

        let mut log = entry.log.lock().await;
        if log.is_closing() {
            debug!(job_id, "result after close dropped");
            return false;
        }
        let payload = ResultPayload::success(job_id, artifact);
        log.results.push(payload.clone());
        self.deliver(Event::ResultReady(payload)).await;
        drop(log);

        counter!("charart_hub_events_total", "kind" => "result").increment(1);
        self.schedule_retirement(job_id);
        true
    }

    /// Append the terminal snapshot and deliver `Closed`.
    ///
    /// Abnormal closes run the cleanup hook first. Closing a job that is
    /// already closing is a no-op and returns false.
    pub async fn close(&self, job_id: &str, reason: CloseReason) -> bool {
        let Some(entry) = self.writable_entry(job_id) else {
            debug!(job_id, %reason, "close for retired job ignored");
            return false;
        };

        let mut log = entry.log.lock().await;
        if let Some(previous) = log.closed {
            debug!(job_id, %reason, %previous, "job already closed");
            return false;
        }
        log.closed = Some(reason);
        let terminal = ProgressSnapshot::terminal(job_id, reason);
        log.snapshots.push(terminal.clone());

        // Once `closed` is set every other write bails out, so the lock can
        // be released while the hook does filesystem work.
        if reason.triggers_cleanup() {
            drop(log);
            self.run_cleanup(job_id).await;
            log = entry.log.lock().await;
        }
        self.deliver(Event::Closed(terminal, reason)).await;
        drop(log);

        match reason {
            CloseReason::Completed => info!(job_id, %reason, "job closed"),
            CloseReason::HeartbeatTimeout => warn!(job_id, %reason, "job closed"),
            CloseReason::Error => error!(job_id, %reason, "job closed"),
        }
        counter!("charart_jobs_closed_total", "reason" => reason.as_str()).increment(1);
        self.schedule_retirement(job_id);
        true
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Latest snapshot, or a zero-progress "waiting" snapshot when the job
    /// is unknown or retired.
    pub async fn query(&self, job_id: &str) -> ProgressSnapshot {
        match self.live_entry(job_id) {
            Some(entry) => entry
                .log
                .lock()
                .await
                .latest()
                .cloned()
                .unwrap_or_else(|| ProgressSnapshot::waiting(job_id)),
            None => ProgressSnapshot::waiting(job_id),
        }
    }

    pub async fn latest_result(&self, job_id: &str) -> Option<ResultPayload> {
        let entry = self.live_entry(job_id)?;
        let log = entry.log.lock().await;
        log.latest_result().cloned()
    }

    /// Copy of the job's snapshot log. Empty for unknown or retired jobs.
    pub async fn history(&self, job_id: &str) -> Vec<ProgressSnapshot> {
        match self.live_entry(job_id) {
            Some(entry) => entry.log.lock().await.snapshots.clone(),
            None => Vec::new(),
        }
    }

    pub async fn closed_reason(&self, job_id: &str) -> Option<CloseReason> {
        let entry = self.live_entry(job_id)?;
        let log = entry.log.lock().await;
        log.closed
    }

    pub fn is_retired(&self, job_id: &str) -> bool {
        matches!(self.jobs.get(job_id).as_deref(), Some(Slot::Retired(_)))
    }

    /// Number of jobs that have not been retired.
    pub fn job_count(&self) -> usize {
        self.jobs.iter().filter(|slot| slot.live().is_some()).count()
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    pub fn subscribe(&self, interest: impl Into<Interest>) -> Subscription {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.listener_capacity.max(1));
        let listener = Arc::new(Listener::new(id, interest.into(), tx));
        self.listeners.insert(id, Arc::clone(&listener));
        debug!(listener_id = id, interest = ?listener.interest, "listener subscribed");
        Subscription { id, rx, listener }
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        match self.listeners.remove(&id) {
            Some((_, listener)) => {
                listener.deactivate();
                debug!(listener_id = id, "listener unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn live_entry(&self, job_id: &str) -> Option<Arc<JobEntry>> {
        self.jobs.get(job_id).and_then(|slot| slot.live().cloned())
    }

    /// Live entry for a write, creating it if absent. `None` for a job
    /// whose tombstone has not yet expired.
    fn writable_entry(&self, job_id: &str) -> Option<Arc<JobEntry>> {
        match self.jobs.entry(job_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if let Slot::Live(entry) = occupied.get() {
                    return Some(Arc::clone(entry));
                }
                if !occupied.get().tombstone_expired(self.config.tombstone_ttl) {
                    return None;
                }
                let entry = Arc::new(JobEntry::default());
                occupied.insert(Slot::Live(Arc::clone(&entry)));
                Some(entry)
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::new(JobEntry::default());
                vacant.insert(Slot::Live(Arc::clone(&entry)));
                Some(entry)
            }
        }
    }

    async fn deliver(&self, event: Event) {
        let job_id = event.job_id().to_string();
        let targets: Vec<Arc<Listener>> = self
            .listeners
            .iter()
            .filter(|l| l.interest.matches(&job_id))
            .map(|l| Arc::clone(l.value()))
            .collect();

        for listener in targets {
            match listener
                .deliver(event.clone(), self.config.enqueue_timeout)
                .await
            {
                Delivery::Delivered => {}
                Delivery::Skipped => {
                    counter!("charart_hub_deliveries_skipped_total").increment(1);
                    debug!(job_id, listener_id = listener.id, "listener queue full, event skipped");
                }
                Delivery::Gone => {
                    self.unsubscribe(listener.id);
                }
            }
        }
    }

    async fn run_cleanup(&self, job_id: &str) {
        let hook = match self.cleanup.read() {
            Ok(slot) => slot.clone(),
            Err(e) => {
                error!("RwLock poisoned reading cleanup hook: {e}");
                None
            }
        };
        let Some(hook) = hook else {
            return;
        };
        debug!(job_id, "running cleanup hook");
        let id = job_id.to_string();
        if let Err(e) = tokio::task::spawn_blocking(move || hook.cleanup(&id)).await {
            error!(job_id, error = %e, "cleanup hook failed");
        }
    }

    fn schedule_retirement(&self, job_id: &str) {
        let jobs = Arc::downgrade(&self.jobs);
        let ttl = self.config.tombstone_ttl;
        let id = job_id.to_string();
        self.retirement
            .schedule(job_id, self.config.retirement_grace, move || {
                let Some(map) = jobs.upgrade() else {
                    return;
                };
                if let Some(mut slot) = map.get_mut(&id) {
                    *slot = Slot::Retired(Instant::now());
                }
                drop(map);
                debug!(job_id = %id, "job retired");

                // Each tombstone clears itself. A newer tombstone or a
                // recreated job under the same id is left alone.
                tokio::spawn(async move {
                    tokio::time::sleep(ttl).await;
                    if let Some(map) = jobs.upgrade() {
                        if map.remove_if(&id, |_, slot| slot.tombstone_expired(ttl)).is_some() {
                            debug!(job_id = %id, "tombstone cleared");
                        }
                    }
                });
            });
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}
