//! RedisStore - Redis Streams による StreamStore 実装（本番用）
//!
//! | port method        | Redis command                          |
//! |--------------------|----------------------------------------|
//! | `append`           | `XADD stream * field value ...`        |
//! | `read`             | `XREAD COUNT n BLOCK ms STREAMS s id`  |
//! | `entry_exists`     | `XRANGE stream id id`                  |
//! | `delete_entry`     | `XDEL stream id`                       |
//! | `ack`              | `XACK stream group id` (group 設定時のみ) |
//! | `set_if_absent`    | `SET key value NX [PX ms]`             |
//! | `expire`           | `PEXPIRE key ms`                       |
//! | `delete_key`       | `DEL key`                              |
//! | `delete_if_equals` | Lua compare-and-delete                 |

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamRangeReply, StreamReadReply};
use tracing::debug;

use crate::domain::EntryId;
use crate::error::StoreError;
use crate::ports::{StreamEntry, StreamStore};

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    ack_group: Option<String>,
}

impl RedisStore {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379/0`).
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        debug!("connected to redis");
        Ok(Self {
            conn,
            ack_group: None,
        })
    }

    /// Consumer group used for `XACK`. Without one, `ack` is a no-op because
    /// plain `XREAD` deliveries are not tracked in a pending list.
    pub fn with_ack_group(mut self, group: Option<String>) -> Self {
        self.ack_group = group;
        self
    }
}

fn to_entry(id: redis::streams::StreamId) -> Result<StreamEntry, StoreError> {
    let mut fields = Vec::with_capacity(id.map.len());
    for (name, value) in &id.map {
        let value = field_value(value)
            .map_err(|e| StoreError::Protocol(format!("field {name} of {}: {e}", id.id)))?;
        fields.push((name.clone(), value));
    }
    Ok(StreamEntry {
        id: EntryId::new(id.id),
        fields,
    })
}

/// 不正な UTF-8 は U+FFFD に置き換える。
/// 読めない entry は read 全体ではなく decode で弾き、Malformed として扱う。
fn field_value(value: &redis::Value) -> redis::RedisResult<String> {
    match value {
        redis::Value::BulkString(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::SimpleString(s) => Ok(s.clone()),
        other => redis::from_redis_value(other),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<EntryId, StoreError> {
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(EntryId::new(id))
    }

    async fn read(
        &self,
        stream: &str,
        after: Option<&EntryId>,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT").arg(count);
        // BLOCK 0 は無期限待ちなので、ゼロの場合は BLOCK を付けない
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(millis(block));
        }
        cmd.arg("STREAMS")
            .arg(stream)
            .arg(after.map_or("0", EntryId::as_str));

        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                entries.push(to_entry(id)?);
            }
        }
        Ok(entries)
    }

    async fn entry_exists(&self, stream: &str, id: &EntryId) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(stream)
            .arg(id.as_str())
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(!reply.ids.is_empty())
    }

    async fn delete_entry(&self, stream: &str, id: &EntryId) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("XDEL")
            .arg(stream)
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn ack(&self, stream: &str, id: &EntryId) -> Result<(), StoreError> {
        let Some(group) = &self.ack_group else {
            return Ok(());
        };
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let set: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(set == 1)
    }

    async fn delete_key(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}
