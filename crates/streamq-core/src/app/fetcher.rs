//! BatchFetcher - stream の先頭から最大 N 件を読む
//!
//! 通常は offset 0 から読みます（処理済みの entry は削除されるため、先頭 = 未処理）。
//! 先頭のバッチが進められなかった場合、consumer は `fetch_tasks_after` でその先を読みます。
//! デコードできない entry もバッチ全体は失敗させず、`Delivery::Malformed` として返します。

use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::codec::{self, Fields};
use crate::domain::{EntryId, Task};
use crate::error::{CodecError, QueueError};
use crate::ports::StreamStore;

/// One entry from a fetched batch.
#[derive(Debug)]
pub enum Delivery {
    Task(Task),
    Malformed {
        entry_id: EntryId,
        fields: Fields,
        error: CodecError,
    },
}

impl Delivery {
    pub fn entry_id(&self) -> Option<&EntryId> {
        match self {
            Self::Task(task) => task.entry_id.as_ref(),
            Self::Malformed { entry_id, .. } => Some(entry_id),
        }
    }
}

#[derive(Clone)]
pub struct BatchFetcher {
    store: Arc<dyn StreamStore>,
    stream_key: String,
    count: usize,
    block: Duration,
}

impl BatchFetcher {
    pub fn new(
        store: Arc<dyn StreamStore>,
        stream_key: impl Into<String>,
        count: usize,
        block: Duration,
    ) -> Self {
        Self {
            store,
            stream_key: stream_key.into(),
            count: count.max(1),
            block,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Up to `count` deliveries from the head of the stream, in stream order.
    /// Empty when the wait elapses.
    pub async fn fetch_tasks(&self) -> Result<Vec<Delivery>, QueueError> {
        self.fetch_tasks_after(None).await
    }

    /// Same as `fetch_tasks`, starting after `after` instead of the head.
    pub async fn fetch_tasks_after(
        &self,
        after: Option<&EntryId>,
    ) -> Result<Vec<Delivery>, QueueError> {
        let entries = self
            .store
            .read(&self.stream_key, after, self.count, self.block)
            .await?;
        trace!(
            stream = %self.stream_key,
            after = after.map(EntryId::as_str),
            fetched = entries.len(),
            "batch read"
        );

        Ok(entries
            .into_iter()
            .map(|entry| match codec::decode(entry.id.clone(), &entry.fields) {
                Ok(task) => Delivery::Task(task),
                Err(error) => {
                    warn!(entry_id = %entry.id, error = %error, "undecodable stream entry");
                    Delivery::Malformed {
                        entry_id: entry.id,
                        fields: entry.fields,
                        error,
                    }
                }
            })
            .collect())
    }
}
