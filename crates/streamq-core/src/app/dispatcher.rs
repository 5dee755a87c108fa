//! Dispatcher - 1 delivery を処理する retry エンジン
//!
//! # フロー
//! 1. Malformed → dead-letter stream へ移動して削除
//! 2. not_before が未来 → そのまま残す（Deferred）
//! 3. lock 取得（取れなければ Skipped）
//! 4. entry がまだ stream にあるか確認（完了済み / 置き換え済みなら Skipped）
//! 5. handler 実行（spawn して panic を隔離）
//! 6. Success → ack + 削除 / Failure → Decider に従って requeue か dead-letter
//! 7. lock 解放
//!
//! dispatch 中の store エラーはログに残すだけで呼び出し元には返しません。

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Span, debug, error, info, instrument, trace, warn};

use super::enqueuer::Enqueuer;
use super::fetcher::Delivery;
use super::lock::{LockManager, TaskLock};
use crate::codec::{self, Fields};
use crate::domain::{
    Decider, Decision, EntryId, Outcome, SkipReason, Task, TaskDisposition,
};
use crate::error::CodecError;
use crate::ports::{Clock, StreamStore};
use crate::typed::HandlerRegistry;

/// Dead-letter field: last failure reason of an abandoned task.
pub const FIELD_FAILURE: &str = "failure";

/// Dead-letter field: why a malformed entry could not be decoded.
pub const FIELD_DECODE_ERROR: &str = "decode_error";

/// Dead-letter field: id of the main-stream entry the record came from.
pub const FIELD_ORIGINAL_ENTRY_ID: &str = "original_entry_id";

pub struct Dispatcher {
    store: Arc<dyn StreamStore>,
    registry: Arc<HandlerRegistry>,
    locks: LockManager,
    enqueuer: Enqueuer,
    decider: Arc<dyn Decider>,
    clock: Arc<dyn Clock>,
    dead_letter_key: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StreamStore>,
        registry: Arc<HandlerRegistry>,
        locks: LockManager,
        enqueuer: Enqueuer,
        decider: Arc<dyn Decider>,
        clock: Arc<dyn Clock>,
        dead_letter_key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            locks,
            enqueuer,
            decider,
            clock,
            dead_letter_key: dead_letter_key.into(),
        }
    }

    fn stream_key(&self) -> &str {
        self.enqueuer.stream_key()
    }

    #[instrument(
        skip_all,
        fields(
            entry_id = delivery.entry_id().map(EntryId::as_str),
            task_id = tracing::field::Empty,
            handler = tracing::field::Empty,
        )
    )]
    pub async fn process_task(&self, delivery: Delivery) -> TaskDisposition {
        match delivery {
            Delivery::Malformed {
                entry_id,
                fields,
                error,
            } => self.dead_letter_malformed(entry_id, fields, error).await,
            Delivery::Task(task) => {
                Span::current()
                    .record("task_id", tracing::field::display(&task.id))
                    .record("handler", tracing::field::display(&task.handler));
                self.process_deliverable(task).await
            }
        }
    }

    async fn process_deliverable(&self, task: Task) -> TaskDisposition {
        if task.is_deferred_at(self.clock.now()) {
            trace!("retry not due yet");
            return TaskDisposition::Deferred;
        }
        let Some(entry_id) = task.entry_id.clone() else {
            warn!("delivery without entry id");
            return TaskDisposition::Skipped(SkipReason::Stale);
        };

        let lock = match self.locks.try_acquire(&task).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                debug!("task is locked by another consumer");
                return TaskDisposition::Skipped(SkipReason::LockHeld);
            }
            Err(e) => {
                warn!(error = %e, "lock acquisition failed");
                return TaskDisposition::Skipped(SkipReason::StoreUnavailable);
            }
        };

        let (disposition, pause) = self.process_locked(&task, &entry_id).await;

        if let Some(pause) = pause {
            // 待機中も lock を保持し、requeue した entry を他の consumer に先に拾わせない
            let ttl = pause.saturating_add(self.locks.margin());
            if let Err(e) = self.locks.set_expiry(&lock, ttl).await {
                warn!(error = %e, "failed to extend lock for retry delay");
            }
            debug!(delay_secs = pause.as_secs(), "backing off before next delivery");
            tokio::time::sleep(pause).await;
        }

        self.release(lock).await;
        disposition
    }

    async fn process_locked(
        &self,
        task: &Task,
        entry_id: &EntryId,
    ) -> (TaskDisposition, Option<Duration>) {
        match self.store.entry_exists(self.stream_key(), entry_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("entry already completed or superseded");
                return (TaskDisposition::Skipped(SkipReason::Stale), None);
            }
            Err(e) => {
                warn!(error = %e, "entry lookup failed");
                return (TaskDisposition::Skipped(SkipReason::StoreUnavailable), None);
            }
        }

        match self.invoke(task).await {
            Outcome::Success => {
                self.complete(entry_id).await;
                info!(retry_count = task.retry_count, "task succeeded");
                (TaskDisposition::Succeeded, None)
            }
            Outcome::Failure { reason } => self.retry(task, entry_id, &reason).await,
        }
    }

    /// Run the handler on its own tokio task so a panic is reported as a failure.
    async fn invoke(&self, task: &Task) -> Outcome {
        let Some(handler) = self.registry.get(&task.handler) else {
            warn!("no handler registered");
            return Outcome::failure(format!("no handler registered for {}", task.handler));
        };

        let owned = task.clone();
        let joined = tokio::spawn(async move { handler.handle(&owned).await }).await;

        match joined {
            Ok(Ok(Outcome::Success)) => Outcome::Success,
            Ok(Ok(Outcome::Failure { reason })) => {
                warn!(retry_count = task.retry_count, reason = %reason, "task failed");
                Outcome::Failure { reason }
            }
            Ok(Err(e)) => {
                error!(retry_count = task.retry_count, error = %e, "handler error");
                Outcome::failure(e.to_string())
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(retry_count = task.retry_count, panic = %message, "handler panicked");
                Outcome::failure(format!("handler panicked: {message}"))
            }
            Err(e) => {
                error!(error = %e, "handler task was cancelled");
                Outcome::failure(e.to_string())
            }
        }
    }

    async fn complete(&self, entry_id: &EntryId) {
        if let Err(e) = self.store.ack(self.stream_key(), entry_id).await {
            warn!(error = %e, "ack failed");
        }
        self.delete_entry(entry_id).await;
    }

    async fn retry(
        &self,
        task: &Task,
        entry_id: &EntryId,
        reason: &str,
    ) -> (TaskDisposition, Option<Duration>) {
        match self.decider.decide(task, self.clock.now()) {
            Decision::Requeue { task: next, pause } => {
                match self.enqueuer.requeue(&next).await {
                    Ok(new_entry) => {
                        info!(
                            retry_count = next.retry_count,
                            new_entry_id = %new_entry,
                            "task requeued"
                        );
                    }
                    Err(e) => {
                        // 元の entry が残るので lock 期限切れ後に同じ retry_count で再配送される
                        error!(error = %e, "requeue failed");
                        return (TaskDisposition::Skipped(SkipReason::StoreUnavailable), None);
                    }
                }
                self.delete_entry(entry_id).await;
                (
                    TaskDisposition::Requeued {
                        remaining: next.retry_count,
                    },
                    pause,
                )
            }
            Decision::Abandon { task: dead } => {
                error!(
                    retry_count = dead.retry_count,
                    data = %dead.data,
                    timeout_secs = dead.timeout.as_secs(),
                    retry_delay_secs = dead.retry_delay.as_secs(),
                    enqueued_at = %dead.enqueued_at,
                    reason,
                    "task abandoned after exhausting retries"
                );
                let mut fields = match codec::encode(&dead) {
                    Ok(fields) => fields,
                    Err(e) => {
                        error!(error = %e, "failed to encode dead-letter record");
                        return (TaskDisposition::Skipped(SkipReason::StoreUnavailable), None);
                    }
                };
                fields.push((FIELD_FAILURE.to_string(), reason.to_string()));
                fields.push((FIELD_ORIGINAL_ENTRY_ID.to_string(), entry_id.to_string()));

                if !self.append_dead_letter(&fields).await {
                    return (TaskDisposition::Skipped(SkipReason::StoreUnavailable), None);
                }
                self.delete_entry(entry_id).await;
                (TaskDisposition::Abandoned, None)
            }
        }
    }

    async fn dead_letter_malformed(
        &self,
        entry_id: EntryId,
        mut fields: Fields,
        error: CodecError,
    ) -> TaskDisposition {
        error!(error = %error, "moving undecodable entry to dead-letter stream");
        fields.push((FIELD_DECODE_ERROR.to_string(), error.to_string()));
        fields.push((FIELD_ORIGINAL_ENTRY_ID.to_string(), entry_id.to_string()));

        if !self.append_dead_letter(&fields).await {
            return TaskDisposition::Skipped(SkipReason::StoreUnavailable);
        }
        self.delete_entry(&entry_id).await;
        TaskDisposition::Malformed
    }

    async fn append_dead_letter(&self, fields: &[(String, String)]) -> bool {
        match self.store.append(&self.dead_letter_key, fields).await {
            Ok(id) => {
                debug!(dead_letter_entry_id = %id, stream = %self.dead_letter_key, "dead-lettered");
                true
            }
            Err(e) => {
                error!(error = %e, "dead-letter append failed");
                false
            }
        }
    }

    async fn delete_entry(&self, entry_id: &EntryId) {
        match self.store.delete_entry(self.stream_key(), entry_id).await {
            Ok(true) => {}
            Ok(false) => debug!("entry was already gone"),
            Err(e) => warn!(error = %e, "entry delete failed"),
        }
    }

    async fn release(&self, lock: TaskLock) {
        match self.locks.release(lock).await {
            Ok(true) => {}
            Ok(false) => warn!("lock expired before release"),
            Err(e) => warn!(error = %e, "lock release failed"),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DefaultDecider, HandlerName, RetryBackoff, TaskId, TaskOptions};
    use crate::error::HandlerError;
    use crate::impls::MemoryStore;
    use crate::ports::{FixedClock, UlidGenerator};
    use crate::typed::TaskHandler;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const STREAM: &str = "q";
    const DEAD: &str = "q:dead";

    struct Scripted {
        calls: Arc<AtomicUsize>,
        outcome: fn(usize) -> Result<Outcome, HandlerError>,
    }

    #[async_trait]
    impl TaskHandler for Scripted {
        async fn handle(&self, _task: &Task) -> Result<Outcome, HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)(n)
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskHandler for Panics {
        async fn handle(&self, _task: &Task) -> Result<Outcome, HandlerError> {
            panic!("boom");
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: FixedClock,
        dispatcher: Dispatcher,
        enqueuer: Enqueuer,
        calls: Arc<AtomicUsize>,
    }

    fn fixture(outcome: fn(usize) -> Result<Outcome, HandlerError>, backoff: RetryBackoff) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "Scripted",
                Scripted {
                    calls: calls.clone(),
                    outcome,
                },
            )
            .unwrap();
        registry.register("Panics", Panics).unwrap();

        let enqueuer = Enqueuer::new(
            store.clone(),
            STREAM,
            Arc::new(UlidGenerator::new(clock_arc.clone())),
            clock_arc.clone(),
        );
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(registry),
            LockManager::new(store.clone(), "lock:", Duration::from_secs(10)),
            enqueuer.clone(),
            Arc::new(DefaultDecider::new(backoff)),
            clock_arc,
            DEAD,
        );
        Fixture {
            store,
            clock,
            dispatcher,
            enqueuer,
            calls,
        }
    }

    async fn enqueue(f: &Fixture, handler: &str, options: TaskOptions) -> TaskId {
        f.enqueuer
            .try_add_task(handler, json!({"to": "a@b.com"}), options)
            .await
            .unwrap()
    }

    async fn head(f: &Fixture) -> Delivery {
        let entry = f.store.entries(STREAM).await.remove(0);
        match codec::decode(entry.id.clone(), &entry.fields) {
            Ok(task) => Delivery::Task(task),
            Err(error) => Delivery::Malformed {
                entry_id: entry.id,
                fields: entry.fields,
                error,
            },
        }
    }

    fn no_delay() -> TaskOptions {
        TaskOptions::default().with_retry_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn success_removes_entry_and_releases_lock() {
        let f = fixture(|_| Ok(Outcome::success()), RetryBackoff::Blocking);
        let id = enqueue(&f, "Scripted", no_delay()).await;
        let delivery = head(&f).await;
        let entry_id = delivery.entry_id().cloned().unwrap();

        let disposition = f.dispatcher.process_task(delivery).await;

        assert_eq!(disposition, TaskDisposition::Succeeded);
        assert_eq!(f.store.stream_len(STREAM).await, 0);
        assert!(f.store.is_acked(STREAM, &entry_id).await);
        assert_eq!(f.store.key_value(&format!("lock:{id}")).await, None);
    }

    #[tokio::test]
    async fn failure_requeues_same_id_with_decremented_count() {
        let f = fixture(|_| Ok(Outcome::failure("smtp down")), RetryBackoff::Blocking);
        let id = enqueue(&f, "Scripted", no_delay().with_retry_count(3)).await;
        let delivery = head(&f).await;
        let old_entry = delivery.entry_id().cloned().unwrap();

        let disposition = f.dispatcher.process_task(delivery).await;

        assert_eq!(disposition, TaskDisposition::Requeued { remaining: 2 });
        let Delivery::Task(next) = head(&f).await else {
            panic!("requeued entry should decode");
        };
        assert_eq!(next.id, id);
        assert_eq!(next.retry_count, 2);
        assert_ne!(next.entry_id, Some(old_entry));
        assert_eq!(f.store.stream_len(STREAM).await, 1);
        assert_eq!(f.store.key_value(&format!("lock:{id}")).await, None);
    }

    #[tokio::test]
    async fn handler_error_counts_as_failure() {
        let f = fixture(|_| Err(HandlerError::new("db gone")), RetryBackoff::Blocking);
        enqueue(&f, "Scripted", no_delay().with_retry_count(2)).await;

        let disposition = f.dispatcher.process_task(head(&f).await).await;
        assert_eq!(disposition, TaskDisposition::Requeued { remaining: 1 });
    }

    #[tokio::test]
    async fn last_failure_moves_task_to_dead_letter() {
        let f = fixture(|_| Ok(Outcome::failure("smtp down")), RetryBackoff::Blocking);
        let id = enqueue(&f, "Scripted", no_delay().with_retry_count(1)).await;

        let disposition = f.dispatcher.process_task(head(&f).await).await;

        assert_eq!(disposition, TaskDisposition::Abandoned);
        assert_eq!(f.store.stream_len(STREAM).await, 0);
        let dead = f.store.entries(DEAD).await;
        assert_eq!(dead.len(), 1);
        let record = codec::decode(dead[0].id.clone(), &dead[0].fields).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.retry_count, 0);
        assert!(dead[0]
            .fields
            .contains(&(FIELD_FAILURE.to_string(), "smtp down".to_string())));
    }

    #[tokio::test]
    async fn unknown_handler_is_a_failure() {
        let f = fixture(|_| Ok(Outcome::success()), RetryBackoff::Blocking);
        enqueue(&f, "Nobody", no_delay().with_retry_count(2)).await;

        let disposition = f.dispatcher.process_task(head(&f).await).await;
        assert_eq!(disposition, TaskDisposition::Requeued { remaining: 1 });
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let f = fixture(|_| Ok(Outcome::success()), RetryBackoff::Blocking);
        enqueue(&f, "Panics", no_delay().with_retry_count(1)).await;

        let disposition = f.dispatcher.process_task(head(&f).await).await;

        assert_eq!(disposition, TaskDisposition::Abandoned);
        let dead = f.store.entries(DEAD).await;
        let failure = dead[0]
            .fields
            .iter()
            .find(|(k, _)| k == FIELD_FAILURE)
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(failure.contains("boom"));
    }

    #[tokio::test]
    async fn held_lock_skips_without_side_effects() {
        let f = fixture(|_| Ok(Outcome::success()), RetryBackoff::Blocking);
        let id = enqueue(&f, "Scripted", no_delay()).await;
        f.store
            .set_if_absent(&format!("lock:{id}"), "someone-else", None)
            .await
            .unwrap();

        let disposition = f.dispatcher.process_task(head(&f).await).await;

        assert_eq!(disposition, TaskDisposition::Skipped(SkipReason::LockHeld));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.store.stream_len(STREAM).await, 1);
        assert_eq!(
            f.store.key_value(&format!("lock:{id}")).await.as_deref(),
            Some("someone-else")
        );
    }

    #[tokio::test]
    async fn stale_delivery_is_skipped() {
        let f = fixture(|_| Ok(Outcome::success()), RetryBackoff::Blocking);
        let id = enqueue(&f, "Scripted", no_delay()).await;
        let delivery = head(&f).await;
        f.store
            .delete_entry(STREAM, delivery.entry_id().unwrap())
            .await
            .unwrap();

        let disposition = f.dispatcher.process_task(delivery).await;

        assert_eq!(disposition, TaskDisposition::Skipped(SkipReason::Stale));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.store.key_value(&format!("lock:{id}")).await, None);
    }

    #[tokio::test]
    async fn malformed_entry_moves_to_dead_letter() {
        let f = fixture(|_| Ok(Outcome::success()), RetryBackoff::Blocking);
        f.store
            .append(STREAM, &[("handler".to_string(), "Scripted".to_string())])
            .await
            .unwrap();

        let disposition = f.dispatcher.process_task(head(&f).await).await;

        assert_eq!(disposition, TaskDisposition::Malformed);
        assert_eq!(f.store.stream_len(STREAM).await, 0);
        let dead = f.store.entries(DEAD).await;
        assert!(dead[0].fields.iter().any(|(k, _)| k == FIELD_DECODE_ERROR));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_backoff_pauses_while_holding_lock() {
        let f = fixture(|_| Ok(Outcome::failure("later")), RetryBackoff::Blocking);
        let id = enqueue(
            &f,
            "Scripted",
            TaskOptions::default()
                .with_retry_count(2)
                .with_retry_delay(Duration::from_secs(30)),
        )
        .await;
        let delivery = head(&f).await;

        let started = tokio::time::Instant::now();
        let disposition = f.dispatcher.process_task(delivery).await;

        assert_eq!(disposition, TaskDisposition::Requeued { remaining: 1 });
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(f.store.key_value(&format!("lock:{id}")).await, None);
    }

    #[tokio::test]
    async fn deferred_backoff_skips_until_due() {
        let f = fixture(
            |n| {
                if n == 0 {
                    Ok(Outcome::failure("later"))
                } else {
                    Ok(Outcome::success())
                }
            },
            RetryBackoff::Deferred,
        );
        enqueue(
            &f,
            "Scripted",
            TaskOptions::default().with_retry_delay(Duration::from_secs(30)),
        )
        .await;

        let first = f.dispatcher.process_task(head(&f).await).await;
        assert_eq!(first, TaskDisposition::Requeued { remaining: 2 });

        let early = f.dispatcher.process_task(head(&f).await).await;
        assert_eq!(early, TaskDisposition::Deferred);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);

        f.clock.advance(chrono::Duration::seconds(30));
        let due = f.dispatcher.process_task(head(&f).await).await;
        assert_eq!(due, TaskDisposition::Succeeded);
        assert_eq!(f.store.stream_len(STREAM).await, 0);
    }

    #[tokio::test]
    async fn requeue_failure_leaves_original_entry() {
        let f = fixture(|_| Ok(Outcome::failure("x")), RetryBackoff::Blocking);
        enqueue(&f, "Scripted", no_delay().with_retry_count(3)).await;
        let delivery = head(&f).await;

        // handler 実行後に store が落ちたケース
        let Delivery::Task(task) = delivery else {
            panic!("expected task");
        };
        let entry_id = task.entry_id.clone().unwrap();
        f.store.set_unavailable(true);
        let (disposition, pause) = f.dispatcher.retry(&task, &entry_id, "x").await;
        f.store.set_unavailable(false);

        assert_eq!(disposition, TaskDisposition::Skipped(SkipReason::StoreUnavailable));
        assert_eq!(pause, None);
        let entries = f.store.entries(STREAM).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, entry_id);
    }

    #[test]
    fn panic_payloads_are_stringified() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7_u8)), "non-string panic payload");
    }

    #[tokio::test]
    async fn handler_name_resolution_is_exact() {
        let f = fixture(|_| Ok(Outcome::success()), RetryBackoff::Blocking);
        assert!(f.dispatcher.registry.get(&HandlerName::new("Scripted")).is_some());
        assert!(f.dispatcher.registry.get(&HandlerName::new("scripted")).is_none());
    }
}
