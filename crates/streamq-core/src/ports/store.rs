//! StreamStore port - stream log + key/value プリミティブ
//!
//! Redis Streams がリファレンス実装です（`impls::redis_store`）。
//! テストと開発用には `impls::memory_store` を使います。
//!
//! # 設計原則
//! - engine が必要とするプリミティブだけを公開する
//! - 排他制御は `set_if_absent` と `delete_if_equals` のアトミック性だけに依存する
//! - 接続の解決（host/port/credentials）は実装側の責務

use std::time::Duration;

use async_trait::async_trait;

use crate::codec::Fields;
use crate::domain::EntryId;
use crate::error::StoreError;

/// One entry read back from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: Fields,
}

#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Append an entry at the tail of `stream` and return its id.
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<EntryId, StoreError>;

    /// Read up to `count` entries with ids greater than `after` (`None` = from
    /// the beginning), waiting up to `block` if there are none.
    ///
    /// An elapsed wait returns `Ok(vec![])`.
    async fn read(
        &self,
        stream: &str,
        after: Option<&EntryId>,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    async fn entry_exists(&self, stream: &str, id: &EntryId) -> Result<bool, StoreError>;

    /// Returns whether an entry was actually removed.
    async fn delete_entry(&self, stream: &str, id: &EntryId) -> Result<bool, StoreError>;

    /// Best-effort delivery acknowledgement.
    async fn ack(&self, stream: &str, id: &EntryId) -> Result<(), StoreError>;

    /// Atomically set `key` to `value` (with optional expiry) only if it does
    /// not exist. Returns whether the key was set.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Unconditional delete (`LockManager::force_release`).
    /// Returns whether the key existed.
    async fn delete_key(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically delete `key` only if it currently holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError>;
}
