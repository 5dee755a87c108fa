//! MemoryStore - 開発・テスト用の StreamStore 実装
//!
//! # 実装詳細
//! - stream ごとに `BTreeMap<seq, Fields>`（append 順 = seq 順）
//! - key は `tokio::time::Instant` ベースの期限付き（`tokio::time::pause()` と相性が良い）
//! - blocking read は `Notify` で append を待つ
//! - `set_unavailable(true)` で全コマンドを失敗させられる（障害系のテスト用）

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::codec::Fields;
use crate::domain::EntryId;
use crate::error::StoreError;
use crate::ports::{StreamEntry, StreamStore};

struct KeyEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KeyEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct MemoryState {
    streams: HashMap<String, BTreeMap<u64, Fields>>,
    keys: HashMap<String, KeyEntry>,
    acked: HashSet<(String, EntryId)>,
    next_seq: u64,
}

impl MemoryState {
    /// Drop `key` if it has expired and return the live entry, if any.
    fn live_key(&mut self, key: &str) -> Option<&mut KeyEntry> {
        let now = Instant::now();
        if self.keys.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.keys.remove(key);
        }
        self.keys.get_mut(key)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    notify: Notify,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent command fail with `StoreError::Connection`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// All entries currently in `stream`, oldest first.
    pub async fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(seq, fields)| StreamEntry {
                        id: entry_id(*seq),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn stream_len(&self, stream: &str) -> usize {
        let state = self.state.lock().await;
        state.streams.get(stream).map_or(0, BTreeMap::len)
    }

    /// Current value of a live (non-expired) key.
    pub async fn key_value(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        state.live_key(key).map(|entry| entry.value.clone())
    }

    pub async fn is_acked(&self, stream: &str, id: &EntryId) -> bool {
        let state = self.state.lock().await;
        state.acked.contains(&(stream.to_string(), id.clone()))
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

fn entry_id(seq: u64) -> EntryId {
    EntryId::new(format!("{seq}-0"))
}

fn parse_seq(id: &EntryId) -> Result<u64, StoreError> {
    id.as_str()
        .split('-')
        .next()
        .and_then(|seq| seq.parse().ok())
        .ok_or_else(|| StoreError::Command(format!("invalid stream entry id {id}")))
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<EntryId, StoreError> {
        self.check_available()?;
        let id = {
            let mut state = self.state.lock().await;
            state.next_seq += 1;
            let seq = state.next_seq;
            state
                .streams
                .entry(stream.to_string())
                .or_default()
                .insert(seq, fields.to_vec());
            entry_id(seq)
        };
        // 待機中の read を起こす（lock 解放後）
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn read(
        &self,
        stream: &str,
        after: Option<&EntryId>,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let after = after.map(parse_seq).transpose()?.unwrap_or(0);
        let deadline = Instant::now() + block;

        loop {
            // append の通知を取りこぼさないよう、確認より先に登録しておく
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available()?;
            {
                let state = self.state.lock().await;
                let entries: Vec<StreamEntry> = state
                    .streams
                    .get(stream)
                    .map(|entries| {
                        entries
                            .range(after + 1..)
                            .take(count)
                            .map(|(seq, fields)| StreamEntry {
                                id: entry_id(*seq),
                                fields: fields.clone(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                if !entries.is_empty() || block.is_zero() {
                    return Ok(entries);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn entry_exists(&self, stream: &str, id: &EntryId) -> Result<bool, StoreError> {
        self.check_available()?;
        let seq = parse_seq(id)?;
        let state = self.state.lock().await;
        Ok(state
            .streams
            .get(stream)
            .is_some_and(|entries| entries.contains_key(&seq)))
    }

    async fn delete_entry(&self, stream: &str, id: &EntryId) -> Result<bool, StoreError> {
        self.check_available()?;
        let seq = parse_seq(id)?;
        let mut state = self.state.lock().await;
        Ok(state
            .streams
            .get_mut(stream)
            .is_some_and(|entries| entries.remove(&seq).is_some()))
    }

    async fn ack(&self, stream: &str, id: &EntryId) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.acked.insert((stream.to_string(), id.clone()));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.live_key(key).is_some() {
            return Ok(false);
        }
        state.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.live_key(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_key(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let existed = state.live_key(key).is_some();
        state.keys.remove(key);
        Ok(existed)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.live_key(key).is_some_and(|entry| entry.value == value) {
            state.keys.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
