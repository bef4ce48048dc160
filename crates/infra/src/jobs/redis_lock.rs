//! Redis-backed distributed lock.
//!
//! - **Acquire**: `SET key token NX PX ttl`
//! - **Release / extend**: Lua scripts that act only while the stored token
//!   still matches, so a holder whose lock expired and was re-acquired by
//!   someone else can never delete or prolong the new holder's lock.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{RedisError, Script};
use tracing::{debug, instrument};

use platform_jobs::{LockError, LockHandle, LockProvider};

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Default key prefix, so lock keys never collide with application data.
const DEFAULT_PREFIX: &str = "platform:locks";

#[derive(Clone)]
pub struct RedisLockProvider {
    conn: MultiplexedConnection,
    prefix: String,
    release: Script,
    extend: Script,
}

impl std::fmt::Debug for RedisLockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockProvider")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisLockProvider {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str, prefix: Option<String>) -> Result<Self, LockError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| LockError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;
        Ok(Self::new(conn, prefix))
    }

    pub fn new(conn: MultiplexedConnection, prefix: Option<String>) -> Self {
        Self {
            conn,
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl LockProvider for RedisLockProvider {
    #[instrument(skip(self), err)]
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>, LockError> {
        let handle = LockHandle::new(key);
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(&handle.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("SET NX", e))?;

        if reply.is_none() {
            debug!(key, "lock held elsewhere");
            return Ok(None);
        }
        Ok(Some(handle))
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(self.key(&handle.key))
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("release", e))?;
        Ok(deleted == 1)
    }

    async fn extend(&self, handle: &LockHandle, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend
            .key(self.key(&handle.key))
            .arg(&handle.token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("extend", e))?;
        Ok(extended == 1)
    }
}

/// Redis rejects `PX 0`.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn command_error(command: &str, err: RedisError) -> LockError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        LockError::Connection(format!("{command} failed: {err}"))
    } else {
        LockError::Command(format!("{command} failed: {err}"))
    }
}
