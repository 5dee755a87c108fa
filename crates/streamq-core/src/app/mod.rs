//! App - アプリケーション層
//!
//! ports を組み合わせてキューの振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **QueueBuilder**: 構築とワイヤリング（起動時検証つき）
//! - **Enqueuer**: producer 側の API
//! - **BatchFetcher**: stream からのバッチ取得
//! - **LockManager**: タスク ID ごとの排他ロック
//! - **Dispatcher**: handler 実行と retry / dead-letter
//! - **Consumer**: fetch → dispatch の run loop

pub mod builder;
pub mod consumer;
pub mod dispatcher;
pub mod enqueuer;
pub mod fetcher;
pub mod lock;

pub use self::builder::{BuildError, Queue, QueueBuilder};
pub use self::consumer::{Consumer, ConsumerGroup};
pub use self::dispatcher::Dispatcher;
pub use self::enqueuer::Enqueuer;
pub use self::fetcher::{BatchFetcher, Delivery};
pub use self::lock::{LockManager, TaskLock};
