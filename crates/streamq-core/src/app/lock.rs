//! LockManager - タスク ID ごとの排他ロック
//!
//! lock key = prefix + TaskId。retry で entry が変わってもキーは同じです。
//!
//! # 不変条件
//! - 取得は `SET NX PX` 相当の 1 コマンド（期限なしの lock が残る隙間がない）
//! - 期限 = task.timeout + margin。保持者がクラッシュしても期限後に再取得できる
//! - 解放は owner token が一致する場合だけ（期限切れ後に他者が取った lock を消さない）

use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use crate::domain::{Task, TaskId};
use crate::error::QueueError;
use crate::ports::StreamStore;

/// A held lock. Releasing consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLock {
    key: String,
    token: String,
}

impl TaskLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn StreamStore>,
    prefix: String,
    margin: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn StreamStore>, prefix: impl Into<String>, margin: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            margin,
        }
    }

    pub fn lock_key(&self, id: &TaskId) -> String {
        format!("{}{}", self.prefix, id)
    }

    pub fn margin(&self) -> Duration {
        self.margin
    }

    pub fn lock_ttl(&self, task: &Task) -> Duration {
        task.timeout.saturating_add(self.margin)
    }

    /// `Ok(None)` when someone else holds the lock.
    pub async fn try_acquire(&self, task: &Task) -> Result<Option<TaskLock>, QueueError> {
        let lock = TaskLock {
            key: self.lock_key(&task.id),
            token: Ulid::new().to_string(),
        };
        let acquired = self
            .store
            .set_if_absent(&lock.key, &lock.token, Some(self.lock_ttl(task)))
            .await?;
        Ok(acquired.then_some(lock))
    }

    /// Re-arm the expiry of a held lock. Returns whether the key still existed.
    pub async fn set_expiry(&self, lock: &TaskLock, ttl: Duration) -> Result<bool, QueueError> {
        Ok(self.store.expire(&lock.key, ttl).await?)
    }

    /// Returns whether the lock was still ours to delete.
    pub async fn release(&self, lock: TaskLock) -> Result<bool, QueueError> {
        Ok(self.store.delete_if_equals(&lock.key, &lock.token).await?)
    }

    /// Drop the lock of `id` whoever holds it. For clearing a lock left by a
    /// consumer that is known to be gone; a live holder loses exclusivity.
    pub async fn force_release(&self, id: &TaskId) -> Result<bool, QueueError> {
        Ok(self.store.delete_key(&self.lock_key(id)).await?)
    }
}
