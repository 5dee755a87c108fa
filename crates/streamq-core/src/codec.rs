//! Task record codec - Task と stream entry fields の相互変換
//!
//! Stream entries are flat `field, value, field, value, ...` lists. Decoding
//! goes through a name -> value map, so field order does not matter and
//! unknown fields are ignored.
//!
//! | field         | encoding                             |
//! |---------------|--------------------------------------|
//! | `id`          | ULID                                 |
//! | `handler`     | handler name                         |
//! | `data`        | JSON                                 |
//! | `retry_count` | decimal                              |
//! | `retry_delay` | whole seconds, rounded up            |
//! | `timeout`     | whole seconds, rounded up            |
//! | `enqueued_at` | RFC 3339 (optional on decode)        |
//! | `not_before`  | RFC 3339 (only on deferred retries)  |

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::domain::{EntryId, HandlerName, Task, TaskId};
use crate::error::CodecError;

pub const FIELD_ID: &str = "id";
pub const FIELD_HANDLER: &str = "handler";
pub const FIELD_DATA: &str = "data";
pub const FIELD_RETRY_COUNT: &str = "retry_count";
pub const FIELD_RETRY_DELAY: &str = "retry_delay";
pub const FIELD_TIMEOUT: &str = "timeout";
pub const FIELD_ENQUEUED_AT: &str = "enqueued_at";
pub const FIELD_NOT_BEFORE: &str = "not_before";

/// Flat field list as stored in one stream entry.
pub type Fields = Vec<(String, String)>;

pub fn encode(task: &Task) -> Result<Fields, CodecError> {
    let data = serde_json::to_string(&task.data).map_err(CodecError::Serialize)?;

    let mut fields = vec![
        (FIELD_ID.to_string(), task.id.to_string()),
        (FIELD_HANDLER.to_string(), task.handler.to_string()),
        (FIELD_DATA.to_string(), data),
        (FIELD_RETRY_COUNT.to_string(), task.retry_count.to_string()),
        (FIELD_RETRY_DELAY.to_string(), whole_secs(task.retry_delay).to_string()),
        (FIELD_TIMEOUT.to_string(), whole_secs(task.timeout).to_string()),
        (FIELD_ENQUEUED_AT.to_string(), format_timestamp(task.enqueued_at)),
    ];
    if let Some(not_before) = task.not_before {
        fields.push((FIELD_NOT_BEFORE.to_string(), format_timestamp(not_before)));
    }
    Ok(fields)
}

pub fn decode(entry_id: EntryId, fields: &[(String, String)]) -> Result<Task, CodecError> {
    let map: HashMap<&str, &str> = fields
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let field = |name: &'static str| map.get(name).copied().ok_or(CodecError::MissingField(name));

    let raw_id = field(FIELD_ID)?;
    let id = TaskId::from_str(raw_id).map_err(|_| CodecError::InvalidId(raw_id.to_string()))?;
    let handler = HandlerName::new(field(FIELD_HANDLER)?);
    let data = serde_json::from_str(field(FIELD_DATA)?).map_err(|source| {
        CodecError::InvalidJson {
            field: FIELD_DATA,
            source,
        }
    })?;
    let retry_count = parse_number::<u32>(FIELD_RETRY_COUNT, field(FIELD_RETRY_COUNT)?)?;
    let retry_delay = parse_number::<u64>(FIELD_RETRY_DELAY, field(FIELD_RETRY_DELAY)?)?;
    let timeout = parse_number::<u64>(FIELD_TIMEOUT, field(FIELD_TIMEOUT)?)?;

    // entries written before enqueued_at existed
    let enqueued_at = match map.get(FIELD_ENQUEUED_AT) {
        Some(raw) => parse_timestamp(FIELD_ENQUEUED_AT, raw)?,
        None => Utc::now(),
    };
    let not_before = map
        .get(FIELD_NOT_BEFORE)
        .map(|raw| parse_timestamp(FIELD_NOT_BEFORE, raw))
        .transpose()?;

    Ok(Task {
        id,
        entry_id: Some(entry_id),
        handler,
        data,
        retry_count,
        retry_delay: Duration::from_secs(retry_delay),
        timeout: Duration::from_secs(timeout),
        enqueued_at,
        not_before,
    })
}

/// 端数は切り上げ（1 秒未満を 0 にしない）
fn whole_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

fn parse_number<T: FromStr>(field: &'static str, raw: &str) -> Result<T, CodecError> {
    raw.trim().parse().map_err(|_| CodecError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(field: &'static str, raw: &str) -> Result<DateTime<Utc>, CodecError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| CodecError::InvalidTimestamp {
            field,
            value: raw.to_string(),
        })
}
