//! streamq-core
//!
//! Durable background task queue on top of a stream log (Redis Streams).
//! Delivery is at-least-once: handlers must be idempotent per task id.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, outcome, decision, state）
//! - **codec**: Task と stream entry fields の相互変換
//! - **ports**: 抽象化レイヤー（StreamStore, Clock, IdGenerator）
//! - **impls**: 実装（MemoryStore、RedisStore）
//! - **typed**: handler API（TaskHandler, Handler<P>, HandlerRegistry）
//! - **app**: アプリケーションロジック（builder, enqueuer, fetcher, lock, dispatcher, consumer）
//! - **config**: 環境変数からの設定読み込み
//! - **observability**: バッチ単位の集計
//! - **error**: エラー型

pub mod app;
pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod typed;

pub use app::{Consumer, ConsumerGroup, Enqueuer, Queue, QueueBuilder};
pub use config::QueueConfig;
pub use domain::{Outcome, RetryBackoff, Task, TaskId, TaskOptions};
pub use error::{HandlerError, QueueError, StoreError};
pub use typed::{Handler, TaskHandler, TaskPayload};
