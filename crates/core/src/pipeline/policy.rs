// crates/core/src/pipeline/policy.rs
//! Worker sizing and the job-level percentage span of a pipeline run.

use crate::config::PipelineConfig;

/// How many frame workers a job gets.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPolicy {
    pub factor: f64,
    pub min_workers: usize,
    pub max_frame_workers: usize,
}

impl WorkerPolicy {
    /// `min(max(floor(parallelism * factor), min_workers), frames, max_frame_workers)`,
    /// never below 1.
    pub fn worker_count(&self, frame_count: usize, parallelism: usize) -> usize {
        let scaled = (parallelism as f64 * self.factor).floor().max(0.0) as usize;
        scaled
            .max(self.min_workers)
            .min(frame_count)
            .min(self.max_frame_workers)
            .max(1)
    }
}

impl From<&PipelineConfig> for WorkerPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            factor: config.worker_factor,
            min_workers: config.min_workers,
            max_frame_workers: config.max_frame_workers,
        }
    }
}

impl Default for WorkerPolicy {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Job-level percentages owned by the pipeline: frames move the job from
/// `start` to `end`, the encode stage from `end` to `encode_end`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSpan {
    pub start: f64,
    pub end: f64,
    pub encode_end: f64,
}

impl Default for ProgressSpan {
    fn default() -> Self {
        Self {
            start: 40.0,
            end: 80.0,
            encode_end: 90.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_defaults() {
        let policy = WorkerPolicy::default();
        // 8 cpus * 0.5 = 4, capped by max 4
        assert_eq!(policy.worker_count(10, 8), 4);
        // 16 cpus * 0.5 = 8, capped by max 4
        assert_eq!(policy.worker_count(10, 16), 4);
        // 2 cpus * 0.5 = 1
        assert_eq!(policy.worker_count(10, 2), 1);
    }

    #[test]
    fn test_worker_count_capped_by_frames() {
        let policy = WorkerPolicy::default();
        assert_eq!(policy.worker_count(2, 32), 2);
        assert_eq!(policy.worker_count(1, 32), 1);
    }

    #[test]
    fn test_worker_count_floor_is_one() {
        let policy = WorkerPolicy {
            factor: 0.0,
            min_workers: 0,
            max_frame_workers: 4,
        };
        assert_eq!(policy.worker_count(5, 1), 1);
        assert_eq!(policy.worker_count(0, 8), 1);
    }

    #[test]
    fn test_min_workers_lifts_small_machines() {
        let policy = WorkerPolicy {
            factor: 0.5,
            min_workers: 3,
            max_frame_workers: 8,
        };
        assert_eq!(policy.worker_count(10, 1), 3);
    }
}
