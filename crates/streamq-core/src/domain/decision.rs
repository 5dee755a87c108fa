//! Decision model: what happens to a task after a failed attempt.
//!
//! Decider は純粋関数として設計されています（副作用なし）。
//! 実際の requeue / dead-letter / sleep は Dispatcher が実行します。

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::Task;

/// How the retry delay is honoured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    /// The consumer sleeps `retry_delay` after requeueing (stalls the whole loop).
    #[default]
    Blocking,

    /// The requeued entry carries `not_before`; the consumer keeps going and
    /// leaves the entry alone until it is due.
    Deferred,
}

impl fmt::Display for RetryBackoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking => f.write_str("blocking"),
            Self::Deferred => f.write_str("deferred"),
        }
    }
}

impl FromStr for RetryBackoff {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blocking" => Ok(Self::Blocking),
            "deferred" => Ok(Self::Deferred),
            other => Err(format!("unknown retry backoff {other:?}")),
        }
    }
}

/// The next action for a task whose attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Append `task` again (same id, decremented count). If `pause` is set the
    /// consumer sleeps that long before taking the next delivery.
    Requeue { task: Task, pause: Option<Duration> },

    /// Retries exhausted. `task.retry_count` is 0.
    Abandon { task: Task },
}

/// Decides the next action for a failed task.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &Task, now: DateTime<Utc>) -> Decision;
}

/// Countdown decider: one retry is consumed per failure, and the task is
/// retried while any remain.
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    backoff: RetryBackoff,
}

impl DefaultDecider {
    pub fn new(backoff: RetryBackoff) -> Self {
        Self { backoff }
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &Task, now: DateTime<Utc>) -> Decision {
        let remaining = task.retry_count.saturating_sub(1);
        let mut next = task.clone();
        next.retry_count = remaining;
        next.entry_id = None;
        next.not_before = None;

        if remaining == 0 {
            return Decision::Abandon { task: next };
        }

        let pause = match self.backoff {
            RetryBackoff::Blocking => {
                Some(task.retry_delay).filter(|delay| !delay.is_zero())
            }
            RetryBackoff::Deferred => {
                next.not_before = Some(deadline_after(now, task.retry_delay));
                None
            }
        };
        Decision::Requeue { task: next, pause }
    }
}

fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntryId, HandlerName, TaskId, TaskOptions};
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    fn task_with(retry_count: u32, retry_delay_secs: u64) -> Task {
        let mut task = Task::new(
            TaskId::from_ulid(Ulid::new()),
            HandlerName::new("EmailHandler"),
            serde_json::json!({"to": "a@b.com"}),
            TaskOptions::default()
                .with_retry_count(retry_count)
                .with_retry_delay(Duration::from_secs(retry_delay_secs)),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        task.entry_id = Some(EntryId::new("1-0"));
        task
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[rstest]
    #[case(3, 2)]
    #[case(2, 1)]
    fn requeue_decrements_and_keeps_identity(#[case] count: u32, #[case] remaining: u32) {
        let task = task_with(count, 5);
        let Decision::Requeue { task: next, pause } = DefaultDecider::default().decide(&task, now())
        else {
            panic!("expected requeue");
        };
        assert_eq!(next.id, task.id);
        assert_eq!(next.retry_count, remaining);
        assert_eq!(next.entry_id, None);
        assert_eq!(next.data, task.data);
        assert_eq!(pause, Some(Duration::from_secs(5)));
    }

    #[rstest]
    #[case(1)]
    #[case(0)]
    fn last_retry_abandons_with_zero_count(#[case] count: u32) {
        let task = task_with(count, 5);
        let decision = DefaultDecider::default().decide(&task, now());
        assert!(matches!(decision, Decision::Abandon { task } if task.retry_count == 0));
    }

    #[test]
    fn deferred_backoff_stamps_not_before_instead_of_pausing() {
        let task = task_with(3, 30);
        let decider = DefaultDecider::new(RetryBackoff::Deferred);
        let Decision::Requeue { task: next, pause } = decider.decide(&task, now()) else {
            panic!("expected requeue");
        };
        assert_eq!(pause, None);
        assert_eq!(next.not_before, Some(now() + chrono::Duration::seconds(30)));
    }

    #[test]
    fn zero_delay_does_not_pause() {
        let task = task_with(3, 0);
        let decision = DefaultDecider::default().decide(&task, now());
        assert!(matches!(decision, Decision::Requeue { pause: None, .. }));
    }

    #[test]
    fn retry_backoff_parses_case_insensitively() {
        assert_eq!("Deferred".parse::<RetryBackoff>(), Ok(RetryBackoff::Deferred));
        assert_eq!(" blocking ".parse::<RetryBackoff>(), Ok(RetryBackoff::Blocking));
        assert!("later".parse::<RetryBackoff>().is_err());
    }
}
