//! Consumer - fetch → dispatch を繰り返す run loop
//!
//! 1 consumer = 1 本の逐次ループ。水平スケールは consumer を増やして行う
//! （別プロセス、または `ConsumerGroup` で同一プロセス内に複数）。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatcher::Dispatcher;
use super::fetcher::{BatchFetcher, Delivery};
use crate::domain::EntryId;
use crate::error::QueueError;
use crate::observability::BatchReport;

#[derive(Clone)]
pub struct Consumer {
    fetcher: BatchFetcher,
    dispatcher: Arc<Dispatcher>,
    idle_interval: Duration,
    /// 直前のバッチが一件も進まなかったとき、その末尾の entry id
    cursor: Option<EntryId>,
}

impl Consumer {
    pub fn new(fetcher: BatchFetcher, dispatcher: Arc<Dispatcher>, idle_interval: Duration) -> Self {
        Self {
            fetcher,
            dispatcher,
            idle_interval,
            cursor: None,
        }
    }

    /// One fetch, then each delivery in fetch order. Fetch failures propagate.
    ///
    /// Reads from the head of the stream, except right after a batch in which nothing
    /// moved: then it continues past that batch so entries behind it are not starved.
    pub async fn process(&mut self) -> Result<BatchReport, QueueError> {
        let batch = self.fetcher.fetch_tasks_after(self.cursor.as_ref()).await?;
        Ok(self.dispatch_batch(batch).await)
    }

    async fn dispatch_batch(&mut self, batch: Vec<Delivery>) -> BatchReport {
        let mut report = BatchReport {
            fetched: batch.len(),
            ..Default::default()
        };
        let last = batch.last().and_then(Delivery::entry_id).cloned();
        for delivery in batch {
            report.record(self.dispatcher.process_task(delivery).await);
        }
        if report.fetched > 0 {
            debug!(?report, "batch processed");
        }

        // 進んだ / 空読み → 先頭から。全件 skip / deferred → その先へ
        self.cursor = if report.made_progress() { None } else { last };
        report
    }

    /// Repeat `process` until `shutdown` turns true (or its sender is dropped).
    ///
    /// A delivery being dispatched is always finished; only the fetch wait and the
    /// idle pause are interrupted.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        info!("consumer started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                batch = self.fetcher.fetch_tasks_after(self.cursor.as_ref()) => batch?,
            };

            let report = self.dispatch_batch(batch).await;

            // 末尾まで読んで何も進まなかった場合だけ待つ（stream を叩き続けない）
            if report.fetched > 0 && report.fetched < self.fetcher.count() && !report.made_progress() {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.idle_interval) => {}
                }
            }
        }
        info!("consumer stopped");
        Ok(())
    }
}

/// Several consumers in one process sharing a shutdown signal.
/// - `shutdown_and_join()` で全 consumer の終了を待てる
/// - dispatch 中の task は中断しない（次の fetch を始めないだけ）
pub struct ConsumerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<Result<(), QueueError>>>,
}

impl ConsumerGroup {
    pub fn spawn(n: usize, consumer: Consumer) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = (0..n)
            .map(|_| {
                let mut consumer = consumer.clone();
                let rx = shutdown_rx.clone();
                tokio::spawn(async move { consumer.run(rx).await })
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop every consumer and return the first error any of them hit.
    pub async fn shutdown_and_join(self) -> Result<(), QueueError> {
        self.request_shutdown();
        let mut first_error = None;
        for join in self.joins {
            match join.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "consumer exited with error");
                    first_error.get_or_insert(e);
                }
                Err(e) => warn!(error = %e, "consumer task panicked"),
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::QueueBuilder;
    use crate::app::dispatcher::FIELD_FAILURE;
    use crate::codec;
    use crate::config::QueueConfig;
    use crate::domain::{Outcome, RetryBackoff, Task, TaskOptions};
    use crate::error::HandlerError;
    use crate::impls::MemoryStore;
    use crate::typed::payload::fixtures::SendEmail;
    use crate::typed::{Handler, TaskHandler};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> QueueConfig {
        QueueConfig {
            stream_key: "tasks".to_string(),
            dead_letter_key: "tasks:dead".to_string(),
            block_timeout_ms: 100,
            ..QueueConfig::default()
        }
    }

    struct Counting {
        calls: Arc<AtomicUsize>,
        succeed_from: usize,
        work: Duration,
    }

    #[async_trait]
    impl TaskHandler for Counting {
        async fn handle(&self, _task: &Task) -> Result<Outcome, HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            if n >= self.succeed_from {
                Ok(Outcome::success())
            } else {
                Ok(Outcome::failure(format!("attempt {n} failed")))
            }
        }
    }

    fn counting(succeed_from: usize, work: Duration) -> (Counting, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Counting {
            calls: calls.clone(),
            succeed_from,
            work,
        };
        (handler, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn two_consumers_never_run_the_same_task_concurrently() {
        let store = Arc::new(MemoryStore::new());
        let (handler, calls) = counting(0, Duration::from_secs(2));
        let queue = QueueBuilder::new(config())
            .store(store.clone())
            .register("Slow", handler)
            .unwrap()
            .build()
            .unwrap();
        queue
            .enqueuer()
            .try_add_task("Slow", json!({}), TaskOptions::default())
            .await
            .unwrap();

        let mut a = queue.consumer();
        let mut b = queue.consumer();
        let (ra, rb) = tokio::join!(a.process(), b.process());
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ra.succeeded + rb.succeeded, 1);
        assert_eq!(ra.skipped() + rb.skipped(), 1);
        assert_eq!(store.stream_len("tasks").await, 0);
    }

    #[tokio::test]
    async fn always_failing_task_is_retried_then_abandoned() {
        let store = Arc::new(MemoryStore::new());
        let (handler, calls) = counting(usize::MAX, Duration::ZERO);
        let queue = QueueBuilder::new(config())
            .store(store.clone())
            .register("Broken", handler)
            .unwrap()
            .build()
            .unwrap();
        let id = queue
            .enqueuer()
            .try_add_task(
                "Broken",
                json!({"n": 1}),
                TaskOptions::default()
                    .with_retry_count(3)
                    .with_retry_delay(Duration::ZERO),
            )
            .await
            .unwrap();

        let mut consumer = queue.consumer();
        let mut requeues = 0;
        loop {
            let report = consumer.process().await.unwrap();
            requeues += report.requeued;
            if report.abandoned == 1 {
                break;
            }
        }

        assert_eq!(requeues, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.stream_len("tasks").await, 0);

        let dead = store.entries("tasks:dead").await;
        assert_eq!(dead.len(), 1);
        let record = codec::decode(dead[0].id.clone(), &dead[0].fields).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.retry_count, 0);
        assert!(dead[0]
            .fields
            .contains(&(FIELD_FAILURE.to_string(), "attempt 2 failed".to_string())));
    }

    struct FlakyEmail {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler<SendEmail> for FlakyEmail {
        async fn handle(&self, payload: SendEmail, _task: &Task) -> Result<Outcome, HandlerError> {
            assert_eq!(payload.to, "a@b.com");
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Outcome::failure("smtp timeout"))
            } else {
                Ok(Outcome::success())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn email_task_fails_once_then_succeeds_after_delay() {
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = QueueBuilder::new(config())
            .store(store.clone())
            .register_typed::<SendEmail, _>(FlakyEmail {
                calls: calls.clone(),
            })
            .unwrap()
            .expect_handlers(&["EmailHandler"])
            .build()
            .unwrap();
        queue
            .enqueuer()
            .add_typed(
                &SendEmail {
                    to: "a@b.com".to_string(),
                },
                TaskOptions::default()
                    .with_retry_count(2)
                    .with_retry_delay(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        let mut consumer = queue.consumer();
        let started = tokio::time::Instant::now();
        let first = consumer.process().await.unwrap();
        assert_eq!(first.requeued, 1);
        assert!(started.elapsed() >= Duration::from_secs(1));

        let entries = store.entries("tasks").await;
        let requeued = codec::decode(entries[0].id.clone(), &entries[0].fields).unwrap();
        assert_eq!(requeued.retry_count, 1);

        let second = consumer.process().await.unwrap();
        assert_eq!(second.succeeded, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.stream_len("tasks").await, 0);
        assert_eq!(store.stream_len("tasks:dead").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_entries_at_the_head_do_not_starve_later_tasks() {
        let store = Arc::new(MemoryStore::new());
        let (stuck, _) = counting(usize::MAX, Duration::ZERO);
        let (fresh, fresh_calls) = counting(0, Duration::ZERO);
        let queue = QueueBuilder::new(QueueConfig {
            batch_count: 2,
            retry_backoff: RetryBackoff::Deferred,
            ..config()
        })
        .store(store.clone())
        .register("Stuck", stuck)
        .unwrap()
        .register("Fresh", fresh)
        .unwrap()
        .build()
        .unwrap();
        let stuck_options = TaskOptions::default()
            .with_retry_count(5)
            .with_retry_delay(Duration::from_secs(3600));
        for n in 0..2 {
            queue
                .enqueuer()
                .try_add_task("Stuck", json!({ "n": n }), stuck_options)
                .await
                .unwrap();
        }

        let mut consumer = queue.consumer();
        assert_eq!(consumer.process().await.unwrap().requeued, 2);

        // 先頭の 2 件はどちらも 1 時間後まで deferred
        queue
            .enqueuer()
            .try_add_task("Fresh", json!({}), TaskOptions::default())
            .await
            .unwrap();

        for _ in 0..5 {
            if fresh_calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            consumer.process().await.unwrap();
        }

        assert_eq!(fresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.stream_len("tasks").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_stream_yields_empty_report() {
        let queue = QueueBuilder::new(config())
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();

        let report = queue.consumer().process().await.unwrap();
        assert_eq!(report, BatchReport::default());
    }

    #[tokio::test]
    async fn fetch_failure_propagates_from_process_and_run() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let queue = QueueBuilder::new(config())
            .store(store.clone())
            .build()
            .unwrap();

        assert!(matches!(queue.consumer().process().await, Err(QueueError::Store(_))));

        let (_tx, rx) = watch::channel(false);
        assert!(queue.consumer().run(rx).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let queue = QueueBuilder::new(config())
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let mut consumer = queue.consumer();
        let handle = tokio::spawn(async move { consumer.run(rx).await });

        tokio::time::sleep(Duration::from_millis(250)).await;
        tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn group_drains_queue_and_shuts_down() {
        let store = Arc::new(MemoryStore::new());
        let (handler, calls) = counting(0, Duration::from_millis(10));
        let queue = QueueBuilder::new(config())
            .store(store.clone())
            .register("Work", handler)
            .unwrap()
            .build()
            .unwrap();
        for n in 0..6 {
            queue
                .enqueuer()
                .try_add_task("Work", json!({ "n": n }), TaskOptions::default())
                .await
                .unwrap();
        }

        let group = ConsumerGroup::spawn(3, queue.consumer());
        for _ in 0..100 {
            if store.stream_len("tasks").await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        group.shutdown_and_join().await.unwrap();

        assert_eq!(store.stream_len("tasks").await, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }
}
