use serde::{Deserialize, Serialize};

use crate::domain::{SkipReason, TaskDisposition};

/// Per-batch counts produced by `Consumer::process`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub fetched: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub abandoned: usize,
    pub deferred: usize,
    pub malformed: usize,
    pub skipped_locked: usize,
    pub skipped_stale: usize,
    pub skipped_store: usize,
}

impl BatchReport {
    pub fn record(&mut self, disposition: TaskDisposition) {
        match disposition {
            TaskDisposition::Succeeded => self.succeeded += 1,
            TaskDisposition::Requeued { .. } => self.requeued += 1,
            TaskDisposition::Abandoned => self.abandoned += 1,
            TaskDisposition::Deferred => self.deferred += 1,
            TaskDisposition::Malformed => self.malformed += 1,
            TaskDisposition::Skipped(SkipReason::LockHeld) => self.skipped_locked += 1,
            TaskDisposition::Skipped(SkipReason::Stale) => self.skipped_stale += 1,
            TaskDisposition::Skipped(SkipReason::StoreUnavailable) => self.skipped_store += 1,
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped_locked + self.skipped_stale + self.skipped_store
    }

    /// Did any delivery in the batch move forward?
    pub fn made_progress(&self) -> bool {
        self.succeeded + self.requeued + self.abandoned + self.malformed > 0
    }
}
