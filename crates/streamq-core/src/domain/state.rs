//! What one `process_task` call did with a delivery.
//!
//! タスク ID ごとの状態遷移:
//! - Pending -> Locked -> Succeeded（entry 削除）
//! - Pending -> Locked -> Requeued -> Pending（新しい entry、retry_count - 1）
//! - Pending -> Locked -> Abandoned（dead-letter へ移動、retry_count == 0）
//! - Locked -> Pending（プロセスがクラッシュし lock が期限切れ。retry_count はそのまま）

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskDisposition {
    /// Handler succeeded; the entry was acknowledged and removed.
    Succeeded,

    /// Handler failed; a new entry with `remaining` retries was appended.
    Requeued { remaining: u32 },

    /// Handler failed with no retries left; the task moved to the dead-letter stream.
    Abandoned,

    /// Deferred retry that is not due yet; left untouched.
    Deferred,

    /// Nothing was done with this delivery.
    Skipped(SkipReason),

    /// The entry could not be decoded and was moved to the dead-letter stream.
    Malformed,
}

impl TaskDisposition {
    /// Did this call move the task forward (as opposed to leaving it as it was)?
    pub fn made_progress(self) -> bool {
        !matches!(self, Self::Deferred | Self::Skipped(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another consumer owns the task's lock.
    LockHeld,

    /// The entry was completed or superseded after the batch was read.
    Stale,

    /// A store command failed before the handler ran (or while requeueing).
    StoreUnavailable,
}
