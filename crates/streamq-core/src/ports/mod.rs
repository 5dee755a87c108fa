//! Ports - 抽象化レイヤー
//!
//! engine が外部（stream store、時刻、ID 生成）に依存する箇所を trait で切り出します。
//! 実装は `impls` にあります。

pub mod clock;
pub mod id_generator;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::store::{StreamEntry, StreamStore};
