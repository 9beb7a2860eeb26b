//! Redis inbox: one `p:msg:{id}` key per message with a native expiry.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{InboxStore, DEFAULT_INBOX_TTL};
use crate::MessagingResult;

pub struct RedisInbox {
    conn: ConnectionManager,
    prefix: String,
    default_ttl: Duration,
}

impl RedisInbox {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> MessagingResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn, prefix))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            default_ttl: DEFAULT_INBOX_TTL,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    fn key(&self, message_id: &str) -> String {
        format!("{}:msg:{}", self.prefix, message_id)
    }

    fn ttl_millis(&self, ttl: Option<Duration>) -> u64 {
        let millis = ttl.unwrap_or(self.default_ttl).as_millis();
        u64::try_from(millis).unwrap_or(u64::MAX).max(1)
    }
}

#[async_trait]
impl InboxStore for RedisInbox {
    async fn has_processed(&self, message_id: &str) -> MessagingResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(self.key(message_id)).await?)
    }

    async fn mark_processed(&self, message_id: &str, ttl: Option<Duration>) -> MessagingResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.key(message_id))
            .arg(1)
            .arg("PX")
            .arg(self.ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn mark_if_new(&self, message_id: &str, ttl: Option<Duration>) -> MessagingResult<bool> {
        let mut conn = self.conn.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(self.key(message_id))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(created.is_some())
    }

    /// Redis expires keys itself
    async fn purge_expired(&self) -> MessagingResult<usize> {
        Ok(0)
    }
}
