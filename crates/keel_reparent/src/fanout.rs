//! Concurrent fan-out bookkeeping.
//!
//! Every step that fans out over tablets spawns one task per tablet and
//! funnels per-task results into an mpsc channel. `FanoutGroup` drains that
//! channel and decides the step outcome; the two disciplines the reparent
//! steps need (all-required and at-least-one) are two configurations of the
//! same recorder.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Success/error thresholds for one fan-out step.
#[derive(Clone, Copy, Debug)]
pub struct FanoutGroup {
    pub num_tasks: usize,
    pub num_required_successes: usize,
    pub num_allowed_errors: usize,
}

impl FanoutGroup {
    /// Every task must succeed.
    pub fn all_required(num_tasks: usize) -> Self {
        Self {
            num_tasks,
            num_required_successes: num_tasks,
            num_allowed_errors: 0,
        }
    }

    /// Any single usable response keeps the step alive.
    pub fn at_least_one(num_tasks: usize) -> Self {
        Self {
            num_tasks,
            num_required_successes: 1,
            num_allowed_errors: num_tasks.saturating_sub(1),
        }
    }

    /// Drain per-task results until every task reported or the channel
    /// closed. Once the error budget is exhausted the outcome can no longer
    /// change, so outstanding work is cancelled; draining continues so tasks
    /// never block on a full channel.
    pub async fn wait(
        &self,
        cancel: &CancellationToken,
        rx: &mut mpsc::Receiver<anyhow::Result<()>>,
    ) -> FanoutOutcome {
        let mut outcome = FanoutOutcome::default();
        let mut received = 0usize;
        while received < self.num_tasks {
            let Some(res) = rx.recv().await else {
                break;
            };
            received += 1;
            match res {
                Ok(()) => outcome.successes += 1,
                Err(err) => outcome.errors.push(err),
            }
            if outcome.errors.len() > self.num_allowed_errors {
                cancel.cancel();
            }
        }
        outcome
    }

    /// `wait`, bounded by the step deadline. Returns `None` on deadline after
    /// cancelling the remaining tasks.
    pub async fn wait_until(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
        rx: &mut mpsc::Receiver<anyhow::Result<()>>,
    ) -> Option<FanoutOutcome> {
        match tokio::time::timeout(deadline, self.wait(cancel, rx)).await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                cancel.cancel();
                None
            }
        }
    }

    pub fn satisfied(&self, outcome: &FanoutOutcome) -> bool {
        outcome.successes >= self.num_required_successes
            && outcome.errors.len() <= self.num_allowed_errors
    }
}

/// Tally of one fan-out step.
#[derive(Debug, Default)]
pub struct FanoutOutcome {
    pub successes: usize,
    pub errors: Vec<anyhow::Error>,
}

impl FanoutOutcome {
    /// All recorded errors joined into one message.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|err| format!("{err:#}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
