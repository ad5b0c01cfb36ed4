// crates/core/src/pipeline/units.rs
//! Per-frame stages and the rate-limited counter reporter handed to them.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::FrameError;

/// Stages every frame goes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    Text,
    Render,
}

pub const STAGES_PER_FRAME: usize = 3;

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Decode => "decode",
            Stage::Text => "text",
            Stage::Render => "render",
        }
    }
}

/// Message from a blocking frame worker back to the pipeline driver.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WorkerReport {
    Units {
        frame: usize,
        stage: Stage,
        current: u64,
        total: u64,
    },
    StageDone {
        frame: usize,
        stage: Stage,
    },
}

/// Handed to transforms so they can report character/pixel counters.
///
/// Only every `interval`-th unit (and the last one) is forwarded, so a
/// transform can call [`report`](Self::report) per unit without flooding
/// the hub.
pub struct UnitReporter {
    frame: usize,
    stage: Stage,
    interval: u64,
    last_sent: u64,
    tx: Option<mpsc::UnboundedSender<WorkerReport>>,
    cancel: CancellationToken,
}

impl UnitReporter {
    pub(crate) fn new(
        frame: usize,
        stage: Stage,
        interval: u64,
        tx: mpsc::UnboundedSender<WorkerReport>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            frame,
            stage,
            interval: interval.max(1),
            last_sent: 0,
            tx: Some(tx),
            cancel,
        }
    }

    /// Reporter that drops everything. Handy for running a transform alone.
    pub fn detached() -> Self {
        Self {
            frame: 0,
            stage: Stage::Text,
            interval: u64::MAX,
            last_sent: 0,
            tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn report(&mut self, current: u64, total: u64) {
        let due = current >= self.last_sent.saturating_add(self.interval);
        let last = current == total && current != self.last_sent;
        if !(due || last) {
            return;
        }
        self.last_sent = current;
        if let Some(tx) = &self.tx {
            let _ = tx.send(WorkerReport::Units {
                frame: self.frame,
                stage: self.stage,
                current,
                total,
            });
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once a sibling failed. Long transforms should call
    /// this periodically.
    pub fn check_cancelled(&self) -> Result<(), FrameError> {
        if self.is_cancelled() {
            Err(FrameError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn next_stage(&mut self, stage: Stage) {
        self.stage = stage;
        self.last_sent = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_every_interval_and_last() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut units = UnitReporter::new(2, Stage::Text, 1000, tx, CancellationToken::new());
        for i in 1..=2500 {
            units.report(i, 2500);
        }
        let mut seen = Vec::new();
        while let Ok(WorkerReport::Units { current, frame, .. }) = rx.try_recv() {
            assert_eq!(frame, 2);
            seen.push(current);
        }
        assert_eq!(seen, vec![1000, 2000, 2500]);
    }

    #[test]
    fn test_cancellation_is_visible() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let units = UnitReporter::new(0, Stage::Render, 10, tx, token.clone());
        assert!(units.check_cancelled().is_ok());
        token.cancel();
        assert_eq!(units.check_cancelled(), Err(FrameError::Cancelled));
    }
}
