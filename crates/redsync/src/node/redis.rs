use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;

use super::{LockNode, ttl_millis};
use crate::error::NodeError;

const DELETE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis-backed lock node
///
/// Uses a reconnecting multiplexed connection, so one node may be shared by
/// any number of concurrent mutexes without a serialization guard.
pub struct RedisNode {
    name: String,
    conn: ConnectionManager,
    delete_script: Script,
    extend_script: Script,
}

impl RedisNode {
    /// Connect to the Redis server at `url`
    pub async fn connect(url: &str) -> Result<Self, NodeError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self::from_connection(url, conn))
    }

    /// Wrap an existing connection
    pub fn from_connection(name: impl Into<String>, conn: ConnectionManager) -> Self {
        Self {
            name: name.into(),
            conn,
            delete_script: Script::new(DELETE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        }
    }
}

#[async_trait]
impl LockNode for RedisNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, NodeError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl)?)
            .query_async(&mut conn)
            .await?;

        match reply.as_deref() {
            Some("OK") => Ok(true),
            None => Ok(false),
            Some(other) => Err(NodeError::Protocol(format!(
                "unexpected SET reply: {}",
                other
            ))),
        }
    }

    async fn try_release(&self, key: &str, value: &str) -> Result<bool, NodeError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .delete_script
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted != 0)
    }

    async fn try_extend(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, NodeError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(value)
            .arg(ttl_millis(ttl)?)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended != 0)
    }
}
