//! Task - キューを流れる作業単位

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{EntryId, TaskId};

/// Default number of retries granted to a new task.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default pause after a failed attempt, in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;

/// Default advisory execution budget, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Name under which a handler is registered (e.g. `"EmailHandler"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerName(String);

impl HandlerName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for HandlerName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for HandlerName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Retry / timeout policy chosen by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOptions {
    /// Retries left before the task is abandoned.
    pub retry_count: u32,

    /// How long to back off after a failed attempt.
    /// Stored in whole seconds; a fractional part is rounded up.
    pub retry_delay: Duration,

    /// Advisory upper bound for one dispatch. Only sizes the lock expiry.
    /// Whole seconds, rounded up like `retry_delay`.
    pub timeout: Duration,
}

impl TaskOptions {
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// One task as seen by the engine and by handlers.
///
/// `id` is the logical identity (stable across retries). `entry_id` is the
/// stream entry this particular delivery came from; it is `None` until the
/// task has been appended and read back.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub entry_id: Option<EntryId>,
    pub handler: HandlerName,
    pub data: serde_json::Value,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub enqueued_at: DateTime<Utc>,

    /// Earliest time this delivery may be dispatched (deferred backoff only).
    pub not_before: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: TaskId,
        handler: HandlerName,
        data: serde_json::Value,
        options: TaskOptions,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            entry_id: None,
            handler,
            data,
            retry_count: options.retry_count,
            retry_delay: options.retry_delay,
            timeout: options.timeout,
            enqueued_at,
            not_before: None,
        }
    }

    pub fn options(&self) -> TaskOptions {
        TaskOptions {
            retry_count: self.retry_count,
            retry_delay: self.retry_delay,
            timeout: self.timeout,
        }
    }

    /// Is this delivery still waiting for its deferred retry time?
    pub fn is_deferred_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_some_and(|not_before| not_before > now)
    }
}
