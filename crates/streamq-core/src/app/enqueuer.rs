//! Enqueuer - producer 側の API
//!
//! `add_task` は fire-and-forget（失敗はログに残すだけで呼び出し元には返さない）。
//! 失敗を知りたい呼び出し元は `try_add_task` を使います。

use std::sync::Arc;

use tracing::{debug, error};

use crate::codec;
use crate::domain::{EntryId, HandlerName, Task, TaskId, TaskOptions};
use crate::error::{CodecError, QueueError};
use crate::ports::{Clock, IdGenerator, StreamStore};
use crate::typed::TaskPayload;

#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn StreamStore>,
    stream_key: String,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl Enqueuer {
    pub fn new(
        store: Arc<dyn StreamStore>,
        stream_key: impl Into<String>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            stream_key: stream_key.into(),
            ids,
            clock,
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Enqueue a task, logging (not returning) any failure.
    pub async fn add_task(
        &self,
        handler: impl Into<HandlerName>,
        data: serde_json::Value,
        options: TaskOptions,
    ) -> Option<TaskId> {
        let handler = handler.into();
        match self.try_add_task(handler.clone(), data, options).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(handler = %handler, error = %e, "failed to enqueue task");
                None
            }
        }
    }

    /// Enqueue a task and report failures to the caller.
    pub async fn try_add_task(
        &self,
        handler: impl Into<HandlerName>,
        data: serde_json::Value,
        options: TaskOptions,
    ) -> Result<TaskId, QueueError> {
        let task = Task::new(
            self.ids.generate_task_id(),
            handler.into(),
            data,
            options,
            self.clock.now(),
        );
        let entry_id = self.append(&task).await?;
        debug!(task_id = %task.id, entry_id = %entry_id, handler = %task.handler, "task enqueued");
        Ok(task.id)
    }

    /// Enqueue a typed payload under `P::HANDLER`.
    pub async fn add_typed<P: TaskPayload>(
        &self,
        payload: &P,
        options: TaskOptions,
    ) -> Result<TaskId, QueueError> {
        let data = serde_json::to_value(payload).map_err(CodecError::Serialize)?;
        self.try_add_task(P::HANDLER, data, options).await
    }

    /// Append an existing task again (retry). The task keeps its id.
    pub async fn requeue(&self, task: &Task) -> Result<EntryId, QueueError> {
        self.append(task).await
    }

    async fn append(&self, task: &Task) -> Result<EntryId, QueueError> {
        let fields = codec::encode(task)?;
        Ok(self.store.append(&self.stream_key, &fields).await?)
    }
}
