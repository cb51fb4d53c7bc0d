//! Step status as a function of its work items.
//!
//! Given the counts of a step's items for the feature it runs:
//!
//! - `Succeeded` iff every item succeeded (an empty step is vacuously done)
//! - `Failed` iff every item failed and there is at least one
//! - `PartialSuccess` iff some but not all succeeded, at least one failed, and
//!   nothing is still in flight
//! - `Running` otherwise
//!
//! `Interrupted` is never produced here. It is imposed by the interrupt path and
//! survives aggregation.

use super::states::{ItemStatus, StepStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub running: usize,
    pub pending: usize,
    pub interrupted: usize,
    pub total: usize,
}

impl StepCounts {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = ItemStatus>,
    {
        let mut counts = Self::default();
        for status in statuses {
            counts.record(status);
        }
        counts
    }

    pub fn record(&mut self, status: ItemStatus) {
        self.total += 1;
        match status {
            ItemStatus::Succeeded => self.succeeded += 1,
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::Running => self.running += 1,
            ItemStatus::Pending => self.pending += 1,
            ItemStatus::Interrupted => self.interrupted += 1,
        }
    }

    /// Items that still owe work to the step
    pub fn in_flight(&self) -> usize {
        self.running + self.pending + self.interrupted
    }

    /// Integer percentage of succeeded items; an empty step reports 100
    pub fn progress(&self) -> i32 {
        if self.total == 0 {
            return 100;
        }
        ((self.succeeded * 100) / self.total) as i32
    }
}

pub fn aggregate_step_status(counts: &StepCounts) -> StepStatus {
    if counts.succeeded == counts.total {
        StepStatus::Succeeded
    } else if counts.total > 0 && counts.failed == counts.total {
        StepStatus::Failed
    } else if counts.succeeded > 0 && counts.failed > 0 && counts.in_flight() == 0 {
        StepStatus::PartialSuccess
    } else {
        StepStatus::Running
    }
}
