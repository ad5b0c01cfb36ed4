// crates/core/src/pipeline/accumulator.rs
//! Shared stage counter behind the job-level percentage.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts completed frame stages across all workers.
///
/// Every completion adds the same delta, whichever frame it belongs to, so
/// the percentage only ever grows and lands on `end` exactly once every
/// stage of every frame is done.
#[derive(Debug)]
pub struct StageAccumulator {
    start: f64,
    end: f64,
    total: u64,
    completed: AtomicU64,
}

impl StageAccumulator {
    pub fn new(start: f64, end: f64, frames: usize, stages_per_frame: usize) -> Self {
        Self {
            start,
            end,
            total: (frames as u64).saturating_mul(stages_per_frame as u64),
            completed: AtomicU64::new(0),
        }
    }

    /// `(end - start) / frames / stages`.
    pub fn delta(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.end - self.start) / self.total as f64
    }

    /// Record one finished stage and return the new count.
    pub fn complete_stage(&self) -> u64 {
        self.completed.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn percentage(&self) -> f64 {
        let done = self.completed().min(self.total);
        if done == self.total {
            self.end
        } else {
            self.start + done as f64 * self.delta()
        }
    }
}
