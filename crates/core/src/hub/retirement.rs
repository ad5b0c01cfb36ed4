// crates/core/src/hub/retirement.rs
//! Deferred, cancellable removal of finished jobs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use charart_types::JobId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;

/// One pending timer per job. Scheduling again replaces (and aborts) the
/// previous timer, so retirement always lands one grace period after the
/// most recent terminal activity.
#[derive(Default)]
pub(crate) struct RetirementTimers {
    timers: Arc<DashMap<JobId, (u64, AbortHandle)>>,
    generation: AtomicU64,
}

impl RetirementTimers {
    pub(crate) fn schedule<F>(&self, job_id: &str, delay: Duration, retire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let id = job_id.to_string();

        // The shard lock is held until the handle is stored, so the timer
        // task can never observe the map without its own entry.
        let entry = self.timers.entry(id.clone());
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if timers
                .remove_if(&id, |_, (g, _)| *g == generation)
                .is_some()
            {
                retire();
            }
        });
        match entry {
            Entry::Occupied(mut occupied) => {
                let (_, previous) = occupied.insert((generation, task.abort_handle()));
                previous.abort();
            }
            Entry::Vacant(vacant) => {
                vacant.insert((generation, task.abort_handle()));
            }
        }
    }

    pub(crate) fn is_pending(&self, job_id: &str) -> bool {
        self.timers.contains_key(job_id)
    }
}

impl Drop for RetirementTimers {
    fn drop(&mut self) {
        for timer in self.timers.iter() {
            timer.value().1.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let timers = RetirementTimers::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        timers.schedule("j", Duration::from_secs(60), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.is_pending("j"));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_pending("j"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous_timer() {
        let timers = RetirementTimers::default();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        timers.schedule("j", Duration::from_secs(10), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(5)).await;

        let f = Arc::clone(&fired);
        timers.schedule("j", Duration::from_secs(10), move || {
            f.fetch_add(10, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "first timer must not fire");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }
}
