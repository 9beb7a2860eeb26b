//! Redis outbox.
//!
//! - `p:seq` counter handing out entry ids
//! - `p:entry:{id}` hash with the entry fields
//! - `p:unprocessed` sorted set of pending ids scored by id

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use kennel_queue::{SharedClock, SystemClock};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use tracing::{debug, instrument};

use super::{OutboxEntry, OutboxEntryId, OutboxStore};
use crate::{MessagingError, MessagingResult};

/// KEYS: unprocessed, entry hash. ARGV: id, processed_at ms.
const MARK_PROCESSED: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[2], 'processed_at', ARGV[2])
return 1
"#;

/// KEYS: entry hash. ARGV: error.
const MARK_FAILED: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HINCRBY', KEYS[1], 'attempts', 1)
redis.call('HSET', KEYS[1], 'last_error', ARGV[1])
return 1
"#;

pub struct RedisOutbox {
    conn: ConnectionManager,
    prefix: String,
    clock: SharedClock,
    mark_processed: Script,
    mark_failed: Script,
}

impl RedisOutbox {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> MessagingResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn, prefix))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            clock: Arc::new(SystemClock),
            mark_processed: Script::new(MARK_PROCESSED),
            mark_failed: Script::new(MARK_FAILED),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn seq_key(&self) -> String {
        format!("{}:seq", self.prefix)
    }

    fn unprocessed_key(&self) -> String {
        format!("{}:unprocessed", self.prefix)
    }

    fn entry_key(&self, id: OutboxEntryId) -> String {
        format!("{}:entry:{}", self.prefix, id)
    }

    async fn load(&self, ids: &[u64]) -> MessagingResult<Vec<OutboxEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.hgetall(self.entry_key(OutboxEntryId(*id)));
        }
        let mut conn = self.conn.clone();
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;
        hashes
            .into_iter()
            .filter(|fields| !fields.is_empty())
            .map(entry_from_fields)
            .collect()
    }
}

#[async_trait]
impl OutboxStore for RedisOutbox {
    #[instrument(skip(self, payload))]
    async fn add(&self, topic: &str, payload: Value) -> MessagingResult<OutboxEntryId> {
        let mut conn = self.conn.clone();
        let id: u64 = conn.incr(self.seq_key(), 1).await?;
        let id = OutboxEntryId(id);
        let created_at = self.clock.now().timestamp_millis();

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(
                self.entry_key(id),
                &[
                    ("id", id.to_string()),
                    ("topic", topic.to_string()),
                    ("payload", serde_json::to_string(&payload)?),
                    ("created_at", created_at.to_string()),
                    ("attempts", "0".to_string()),
                ],
            )
            .ignore()
            .zadd(self.unprocessed_key(), id.value(), id.value())
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(outbox_id = %id, "Staged outbox entry");
        Ok(id)
    }

    async fn fetch_unprocessed(&self, limit: usize, topics: Option<&[String]>) -> MessagingResult<Vec<OutboxEntry>> {
        let mut found = Vec::new();
        if limit == 0 {
            return Ok(found);
        }
        let page = limit.max(64) as isize;
        let mut offset: isize = 0;
        let mut conn = self.conn.clone();

        loop {
            let ids: Vec<u64> = conn
                .zrange(self.unprocessed_key(), offset, offset + page - 1)
                .await?;
            let exhausted = (ids.len() as isize) < page;
            offset += page;

            for entry in self.load(&ids).await? {
                if !entry.is_processed() && entry.matches(topics) {
                    found.push(entry);
                    if found.len() == limit {
                        return Ok(found);
                    }
                }
            }
            if exhausted {
                return Ok(found);
            }
        }
    }

    async fn mark_processed(&self, id: OutboxEntryId) -> MessagingResult<bool> {
        let mut conn = self.conn.clone();
        let flipped: i64 = self
            .mark_processed
            .key(self.unprocessed_key())
            .key(self.entry_key(id))
            .arg(id.value())
            .arg(self.clock.now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        if flipped == 1 {
            return Ok(true);
        }
        let exists: bool = conn.exists(self.entry_key(id)).await?;
        if exists {
            Ok(false)
        } else {
            Err(MessagingError::EntryNotFound(id))
        }
    }

    async fn mark_failed(&self, id: OutboxEntryId, error: &str) -> MessagingResult<()> {
        let mut conn = self.conn.clone();
        let found: i64 = self
            .mark_failed
            .key(self.entry_key(id))
            .arg(error)
            .invoke_async(&mut conn)
            .await?;
        if found == 1 {
            Ok(())
        } else {
            Err(MessagingError::EntryNotFound(id))
        }
    }

    async fn get(&self, id: OutboxEntryId) -> MessagingResult<Option<OutboxEntry>> {
        Ok(self.load(&[id.value()]).await?.pop())
    }
}

fn entry_from_fields(fields: HashMap<String, String>) -> MessagingResult<OutboxEntry> {
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| MessagingError::Serialization(format!("outbox entry missing field {name}")))
    };
    let number = |name: &str| -> MessagingResult<i64> {
        field(name)?
            .parse()
            .map_err(|_| MessagingError::Serialization(format!("outbox entry field {name} is not a number")))
    };
    let timestamp = |ms: i64| -> MessagingResult<DateTime<Utc>> {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| MessagingError::Serialization(format!("timestamp out of range: {ms}")))
    };

    let processed_at = match fields.get("processed_at") {
        Some(ms) => Some(timestamp(ms.parse().map_err(|_| {
            MessagingError::Serialization("outbox entry field processed_at is not a number".into())
        })?)?),
        None => None,
    };

    Ok(OutboxEntry {
        id: OutboxEntryId(number("id")? as u64),
        topic: field("topic")?.clone(),
        payload: serde_json::from_str(field("payload")?)?,
        created_at: timestamp(number("created_at")?)?,
        processed_at,
        attempts: number("attempts")? as u32,
        last_error: fields.get("last_error").cloned(),
    })
}
