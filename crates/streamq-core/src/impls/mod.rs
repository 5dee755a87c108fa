//! Impls - ports の実装
//!
//! - **MemoryStore**: 開発・テスト用の StreamStore
//! - **RedisStore**: Redis Streams による本番用 StreamStore（feature `redis`）

pub mod memory_store;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use self::memory_store::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis_store::RedisStore;
