//! Redis-backed job queue (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! Per queue `q`, under the configured prefix:
//!
//! - **`{q}:items`**: hash of item id to its serialized envelope (item + retry policy)
//! - **`{q}:waiting`**: sorted set of item ids scored by the instant they become due
//! - **`{q}:active`**: sorted set of leased item ids scored by lease expiry
//! - **`{q}:receipts`**, **`{q}:attempts`**, **`{q}:stalls`**: per-item lease
//!   receipt, attempts used up by failures and stall count
//! - **`{q}:dedup:{key}`**: expiring marker collapsing duplicate enqueues
//! - **`{q}:failed`**: stream of items whose retries or stall allowance ran out
//!
//! Every state change of an item is a Lua script checking the lease receipt,
//! so it is atomic with respect to other workers. The dedup marker is written
//! last in the enqueue script, after the item itself.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::streams::StreamRangeReply;
use redis::{RedisError, Script};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use platform_core::SharedClock;
use platform_jobs::{
    Delivery, EnqueueOptions, EnqueueOutcome, FailOutcome, FailedItem, JobQueue, QueueError,
    QueueItem, QueueOptions, RetryPolicy, STALL_LIMIT_ERROR, StallReport,
};

/// Default key prefix.
const DEFAULT_PREFIX: &str = "platform:jobs";

/// How often an idle `fetch` re-checks for due items.
const POLL_SLICE: Duration = Duration::from_millis(100);

// KEYS: items, waiting[, dedup]
// ARGV: id, body, available_at_ms, dedup_ttl_ms
const ENQUEUE_SCRIPT: &str = r#"
if KEYS[3] and redis.call('EXISTS', KEYS[3]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
if KEYS[3] then
    redis.call('SET', KEYS[3], ARGV[1], 'PX', ARGV[4])
end
return 1
"#;

// KEYS: waiting, active, receipts, attempts, items, stalls
// ARGV: now_ms, lease_ms, receipt
const LEASE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
    return false
end
local id = ids[1]
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[2], tonumber(ARGV[1]) + tonumber(ARGV[2]), id)
redis.call('HSET', KEYS[3], id, ARGV[3])
local attempts = tonumber(redis.call('HGET', KEYS[4], id) or '0') + 1
local body = redis.call('HGET', KEYS[5], id)
local stalls = redis.call('HGET', KEYS[6], id) or '0'
return {id, body, tostring(attempts), stalls}
"#;

// KEYS: active, receipts
// ARGV: id, receipt, lease_until_ms
const HEARTBEAT_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
return 1
"#;

// KEYS: waiting, active, receipts, attempts, items, stalls
// ARGV: id, receipt
const COMPLETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
    if redis.call('HEXISTS', KEYS[5], ARGV[1]) == 1 then
        return -1
    end
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('HDEL', KEYS[5], ARGV[1])
redis.call('HDEL', KEYS[6], ARGV[1])
return 1
"#;

// KEYS: waiting, active, receipts
// ARGV: id, receipt, available_at_ms
const POSTPONE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
return 1
"#;

// KEYS: waiting, active, receipts, attempts, items, stalls, failed
// ARGV: id, receipt, mode ('retry' | 'fail'), available_at_ms, error, failed_at, attempts
const FAIL_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
    return -1
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
if ARGV[3] == 'retry' then
    redis.call('HSET', KEYS[4], ARGV[1], ARGV[7])
    redis.call('ZADD', KEYS[1], ARGV[4], ARGV[1])
    return 1
end
local body = redis.call('HGET', KEYS[5], ARGV[1])
redis.call('XADD', KEYS[7], '*', 'id', ARGV[1], 'error', ARGV[5],
    'attempts', ARGV[7], 'failed_at', ARGV[6], 'body', body or '')
redis.call('HDEL', KEYS[5], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('HDEL', KEYS[6], ARGV[1])
return 0
"#;

// KEYS: waiting, active, receipts, attempts, items, stalls, failed
// ARGV: now_ms, max_stalled_count, stall_error, failed_at
const RECLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
local out = {}
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('HDEL', KEYS[3], id)
    local stalls = redis.call('HINCRBY', KEYS[6], id, 1)
    local body = redis.call('HGET', KEYS[5], id)
    if body then
        if stalls > tonumber(ARGV[2]) then
            local attempts = tonumber(redis.call('HGET', KEYS[4], id) or '0') + 1
            redis.call('XADD', KEYS[7], '*', 'id', id, 'error', ARGV[3],
                'attempts', tostring(attempts), 'failed_at', ARGV[4], 'body', body)
            redis.call('HDEL', KEYS[5], id)
            redis.call('HDEL', KEYS[4], id)
            redis.call('HDEL', KEYS[6], id)
            table.insert(out, {'exhausted', body})
        else
            redis.call('ZADD', KEYS[1], 0, id)
            table.insert(out, {'redelivered', body})
        end
    end
end
return out
"#;

/// What is stored per item: the item itself plus the retry policy it was
/// enqueued with.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    item: QueueItem,
    retry: RetryPolicy,
}

/// Redis-backed [`JobQueue`].
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: MultiplexedConnection,
    prefix: String,
    clock: SharedClock,
    queues: Arc<RwLock<HashMap<String, QueueOptions>>>,
    enqueue: Script,
    lease: Script,
    heartbeat: Script,
    complete: Script,
    postpone: Script,
    fail: Script,
    reclaim: Script,
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("prefix", &self.prefix)
            .field("queues", &self.queues.read().unwrap().len())
            .finish_non_exhaustive()
    }
}

struct Keys {
    base: String,
    waiting: String,
    active: String,
    receipts: String,
    attempts: String,
    items: String,
    stalls: String,
    failed: String,
    options: String,
}

impl Keys {
    fn dedup(&self, key: &str) -> String {
        format!("{}:dedup:{key}", self.base)
    }
}

impl RedisJobQueue {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(
        redis_url: &str,
        prefix: Option<String>,
        clock: SharedClock,
    ) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| QueueError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(Self::new(conn, prefix, clock))
    }

    pub fn new(conn: MultiplexedConnection, prefix: Option<String>, clock: SharedClock) -> Self {
        Self {
            conn,
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            clock,
            queues: Arc::new(RwLock::new(HashMap::new())),
            enqueue: Script::new(ENQUEUE_SCRIPT),
            lease: Script::new(LEASE_SCRIPT),
            heartbeat: Script::new(HEARTBEAT_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            postpone: Script::new(POSTPONE_SCRIPT),
            fail: Script::new(FAIL_SCRIPT),
            reclaim: Script::new(RECLAIM_SCRIPT),
        }
    }

    fn base(&self, queue: &str) -> String {
        format!("{}:{}", self.prefix, queue)
    }

    fn keys(&self, queue: &str) -> Keys {
        let base = self.base(queue);
        Keys {
            waiting: format!("{base}:waiting"),
            active: format!("{base}:active"),
            receipts: format!("{base}:receipts"),
            attempts: format!("{base}:attempts"),
            items: format!("{base}:items"),
            stalls: format!("{base}:stalls"),
            failed: format!("{base}:failed"),
            options: format!("{base}:options"),
            base,
        }
    }

    fn options(&self, queue: &str) -> Result<QueueOptions, QueueError> {
        self.queues
            .read()
            .unwrap()
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))
    }

    async fn try_lease(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let options = self.options(queue)?;
        let keys = self.keys(queue);
        let receipt = Uuid::now_v7().to_string();
        let now = self.clock.now();
        let mut conn = self.conn.clone();

        let leased: Option<(String, String, u32, u32)> = self
            .lease
            .key(&keys.waiting)
            .key(&keys.active)
            .key(&keys.receipts)
            .key(&keys.attempts)
            .key(&keys.items)
            .key(&keys.stalls)
            .arg(now.timestamp_millis())
            .arg(millis(options.stalled_interval))
            .arg(&receipt)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("lease", e))?;

        let Some((id, body, attempt, stalled_count)) = leased else {
            return Ok(None);
        };
        let envelope = decode(&body).map_err(|e| {
            warn!(queue, id = %id, error = %e, "undecodable queue item");
            e
        })?;
        Ok(Some(Delivery {
            queue: queue.to_string(),
            receipt,
            item: envelope.item,
            attempt,
            stalled_count,
            retry: envelope.retry,
        }))
    }

    /// Most recent entries of the failed stream, newest first.
    pub async fn failed(&self, queue: &str, count: usize) -> Result<Vec<FailedItem>, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(&keys.failed)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XREVRANGE", e))?;

        let mut failed = Vec::with_capacity(reply.ids.len());
        for entry in reply.ids {
            let body: String = entry.get("body").unwrap_or_default();
            let Ok(envelope) = decode(&body) else {
                warn!(queue, entry_id = %entry.id, "skipping undecodable failed entry");
                continue;
            };
            let failed_at = entry
                .get::<String>("failed_at")
                .and_then(|at| DateTime::parse_from_rfc3339(&at).ok())
                .map_or_else(|| self.clock.now(), |at| at.with_timezone(&Utc));
            failed.push(FailedItem {
                item: envelope.item,
                error: entry.get("error").unwrap_or_default(),
                attempts: entry.get("attempts").unwrap_or_default(),
                failed_at,
            });
        }
        Ok(failed)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, options), err)]
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), QueueError> {
        let keys = self.keys(name);
        let mut conn = self.conn.clone();
        // Informational copy for operators; workers use their own declaration.
        let _: () = redis::cmd("HSET")
            .arg(&keys.options)
            .arg("concurrency")
            .arg(options.concurrency)
            .arg("max_stalled_count")
            .arg(options.max_stalled_count)
            .arg("stalled_interval_ms")
            .arg(millis(options.stalled_interval))
            .arg("dedup_window_ms")
            .arg(millis(options.dedup_window))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("HSET", e))?;

        self.queues
            .write()
            .unwrap()
            .insert(name.to_string(), options);
        Ok(())
    }

    #[instrument(skip(self, item, options), fields(job = %item.job_name, id = %item.id), err)]
    async fn enqueue(
        &self,
        queue: &str,
        mut item: QueueItem,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let queue_options = self.options(queue)?;
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();

        item.dedup_key = options.dedup_key.clone();
        let id = item.id;
        let body = serde_json::to_string(&Envelope {
            item,
            retry: options.retry,
        })
        .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let available_at = self.clock.now().timestamp_millis()
            + i64::try_from(millis(options.delay.unwrap_or_default())).unwrap_or(i64::MAX);

        let mut invocation = self.enqueue.key(&keys.items);
        invocation.key(&keys.waiting);
        if let Some(key) = &options.dedup_key {
            invocation.key(keys.dedup(key));
        }
        let enqueued: i64 = invocation
            .arg(id.to_string())
            .arg(body)
            .arg(available_at)
            .arg(millis(queue_options.dedup_window).max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("enqueue", e))?;

        match (enqueued, options.dedup_key) {
            (0, Some(dedup_key)) => {
                debug!(%dedup_key, "duplicate enqueue collapsed");
                Ok(EnqueueOutcome::Duplicate { dedup_key })
            }
            _ => Ok(EnqueueOutcome::Enqueued(id)),
        }
    }

    async fn fetch(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_lease(queue).await? {
                return Ok(Some(delivery));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(POLL_SLICE)).await;
        }
    }

    async fn heartbeat(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let options = self.options(&delivery.queue)?;
        let keys = self.keys(&delivery.queue);
        let lease_until = self.clock.now().timestamp_millis()
            + i64::try_from(millis(options.stalled_interval)).unwrap_or(i64::MAX);
        let mut conn = self.conn.clone();

        let renewed: i64 = self
            .heartbeat
            .key(&keys.active)
            .key(&keys.receipts)
            .arg(delivery.item.id.to_string())
            .arg(&delivery.receipt)
            .arg(lease_until)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("heartbeat", e))?;
        if renewed != 1 {
            return Err(QueueError::LeaseLost(delivery.item.id));
        }
        Ok(())
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let keys = self.keys(&delivery.queue);
        let mut conn = self.conn.clone();

        let completed: i64 = self
            .complete
            .key(&keys.waiting)
            .key(&keys.active)
            .key(&keys.receipts)
            .key(&keys.attempts)
            .key(&keys.items)
            .key(&keys.stalls)
            .arg(delivery.item.id.to_string())
            .arg(&delivery.receipt)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("complete", e))?;
        if completed < 0 {
            return Err(QueueError::LeaseLost(delivery.item.id));
        }
        Ok(())
    }

    async fn postpone(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let keys = self.keys(&delivery.queue);
        let available_at = self.clock.now().timestamp_millis()
            + i64::try_from(millis(delay)).unwrap_or(i64::MAX);
        let mut conn = self.conn.clone();

        let postponed: i64 = self
            .postpone
            .key(&keys.waiting)
            .key(&keys.active)
            .key(&keys.receipts)
            .arg(delivery.item.id.to_string())
            .arg(&delivery.receipt)
            .arg(available_at)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("postpone", e))?;
        if postponed != 1 {
            return Err(QueueError::LeaseLost(delivery.item.id));
        }
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(id = %delivery.item.id, attempt = delivery.attempt), err)]
    async fn fail(&self, delivery: &Delivery, error: &str) -> Result<FailOutcome, QueueError> {
        let keys = self.keys(&delivery.queue);
        let now = self.clock.now();
        let retry = delivery.retry.should_retry(delivery.attempt);
        let delay = delivery.retry.delay_for_attempt(delivery.attempt);
        let available_at =
            now.timestamp_millis() + i64::try_from(millis(delay)).unwrap_or(i64::MAX);
        let mut conn = self.conn.clone();

        let result: i64 = self
            .fail
            .key(&keys.waiting)
            .key(&keys.active)
            .key(&keys.receipts)
            .key(&keys.attempts)
            .key(&keys.items)
            .key(&keys.stalls)
            .key(&keys.failed)
            .arg(delivery.item.id.to_string())
            .arg(&delivery.receipt)
            .arg(if retry { "retry" } else { "fail" })
            .arg(available_at)
            .arg(error)
            .arg(now.to_rfc3339())
            .arg(delivery.attempt)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("fail", e))?;

        match result {
            1 => Ok(FailOutcome::Retrying {
                attempt: delivery.attempt,
                delay,
            }),
            0 => {
                warn!(queue = %delivery.queue, error, "item moved to failed stream");
                Ok(FailOutcome::Exhausted {
                    attempts: delivery.attempt,
                })
            }
            _ => Err(QueueError::LeaseLost(delivery.item.id)),
        }
    }

    async fn reclaim_stalled(&self, queue: &str) -> Result<StallReport, QueueError> {
        let options = self.options(queue)?;
        let keys = self.keys(queue);
        let now = self.clock.now();
        let mut conn = self.conn.clone();

        let reclaimed: Vec<(String, String)> = self
            .reclaim
            .key(&keys.waiting)
            .key(&keys.active)
            .key(&keys.receipts)
            .key(&keys.attempts)
            .key(&keys.items)
            .key(&keys.stalls)
            .key(&keys.failed)
            .arg(now.timestamp_millis())
            .arg(options.max_stalled_count)
            .arg(STALL_LIMIT_ERROR)
            .arg(now.to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("reclaim", e))?;

        let mut report = StallReport::default();
        for (kind, body) in reclaimed {
            let envelope = decode(&body)?;
            match kind.as_str() {
                "exhausted" => report.exhausted.push(envelope.item),
                _ => report.redelivered.push(envelope.item),
            }
        }
        if !report.is_empty() {
            warn!(
                queue,
                redelivered = report.redelivered.len(),
                exhausted = report.exhausted.len(),
                "reclaimed stalled items"
            );
        }
        Ok(report)
    }
}

fn decode(body: &str) -> Result<Envelope, QueueError> {
    serde_json::from_str(body).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn command_error(command: &str, err: RedisError) -> QueueError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        QueueError::Connection(format!("{command} failed: {err}"))
    } else {
        QueueError::Command(format!("{command} failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use platform_core::SystemClock;

    /// Connects to `REDIS_URL` under a scratch prefix, or skips when unset.
    async fn queue(options: QueueOptions) -> Option<RedisJobQueue> {
        let url = std::env::var("REDIS_URL").ok()?;
        let prefix = format!("test:jobs:{}", Uuid::now_v7().simple());
        let queue = RedisJobQueue::connect(&url, Some(prefix), SystemClock::shared())
            .await
            .ok()?;
        queue.declare_queue("work", options).await.ok()?;
        Some(queue)
    }

    fn item() -> QueueItem {
        QueueItem::new("report", 1, Utc::now())
    }

    #[test]
    fn envelopes_carry_the_retry_policy() {
        let envelope = Envelope {
            item: item().with_dedup_key("report:1"),
            retry: RetryPolicy::fixed(3, Duration::from_secs(2)),
        };
        let body = serde_json::to_string(&envelope).unwrap();
        let decoded = decode(&body).unwrap();
        assert_eq!(decoded.item, envelope.item);
        assert_eq!(decoded.retry.max_attempts, 3);
        assert!(matches!(decode("{"), Err(QueueError::Serialization(_))));
    }

    #[tokio::test]
    async fn undeclared_queues_are_rejected() {
        let Some(queue) = queue(QueueOptions::default()).await else {
            return;
        };
        let err = queue.fetch("elsewhere", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue(name) if name == "elsewhere"));
    }

    #[tokio::test]
    async fn dedup_keys_collapse_and_items_lease_once() {
        let Some(queue) = queue(QueueOptions::default()).await else {
            return;
        };
        let options = EnqueueOptions {
            dedup_key: Some("report:1".to_string()),
            ..Default::default()
        };

        let first = queue.enqueue("work", item(), options.clone()).await.unwrap();
        let second = queue.enqueue("work", item(), options).await.unwrap();
        assert!(matches!(first, EnqueueOutcome::Enqueued(_)));
        assert!(matches!(second, EnqueueOutcome::Duplicate { .. }));

        let delivery = queue.fetch("work", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 1);
        assert!(queue.fetch("work", Duration::ZERO).await.unwrap().is_none());

        queue.heartbeat(&delivery).await.unwrap();
        queue.complete(&delivery).await.unwrap();
        queue.complete(&delivery).await.unwrap();
        assert!(matches!(
            queue.heartbeat(&delivery).await,
            Err(QueueError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn dedup_marker_is_only_written_with_its_item() {
        let Some(queue) = queue(QueueOptions::default()).await else {
            return;
        };
        let keys = queue.keys("work");
        let mut conn = queue.conn.clone();
        let options = EnqueueOptions {
            dedup_key: Some("cleanup:1000".to_string()),
            ..Default::default()
        };

        // A wrong-typed items key makes the item write fail inside the script.
        let _: () = redis::cmd("SET")
            .arg(&keys.items)
            .arg("not-a-hash")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(queue.enqueue("work", item(), options.clone()).await.is_err());
        let marker: bool = redis::cmd("EXISTS")
            .arg(keys.dedup("cleanup:1000"))
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(!marker);

        let _: () = redis::cmd("DEL")
            .arg(&keys.items)
            .query_async(&mut conn)
            .await
            .unwrap();
        let retried = queue.enqueue("work", item(), options).await.unwrap();
        let EnqueueOutcome::Enqueued(id) = retried else {
            panic!("retry after a failed enqueue collapsed");
        };
        let stored: bool = redis::cmd("HEXISTS")
            .arg(&keys.items)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(stored);
    }

    #[tokio::test]
    async fn stale_receipts_cannot_complete_and_postpone_keeps_the_attempt() {
        let options = QueueOptions {
            stalled_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let Some(queue) = queue(options).await else {
            return;
        };
        let retry = EnqueueOptions {
            retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
            ..Default::default()
        };
        queue.enqueue("work", item(), retry).await.unwrap();

        let zombie = queue.fetch("work", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.reclaim_stalled("work").await.unwrap();
        let fresh = queue.fetch("work", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(fresh.attempt, 1);

        assert!(matches!(queue.complete(&zombie).await, Err(QueueError::LeaseLost(_))));
        queue.postpone(&fresh, Duration::ZERO).await.unwrap();
        assert!(matches!(
            queue.postpone(&fresh, Duration::ZERO).await,
            Err(QueueError::LeaseLost(_))
        ));

        let again = queue.fetch("work", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.item.id, fresh.item.id);
        assert_eq!(again.attempt, 1);
        assert!(matches!(
            queue.fail(&again, "boom").await.unwrap(),
            FailOutcome::Retrying { attempt: 1, .. }
        ));
    }

    #[tokio::test]
    async fn exhausted_items_land_in_the_failed_stream() {
        let Some(queue) = queue(QueueOptions::default()).await else {
            return;
        };
        let options = EnqueueOptions {
            retry: RetryPolicy::fixed(2, Duration::from_millis(1)),
            ..Default::default()
        };
        queue.enqueue("work", item(), options).await.unwrap();

        let first = queue.fetch("work", Duration::ZERO).await.unwrap().unwrap();
        assert!(matches!(
            queue.fail(&first, "boom").await.unwrap(),
            FailOutcome::Retrying { attempt: 1, .. }
        ));

        let second = queue
            .fetch("work", Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.attempt, 2);
        assert!(matches!(
            queue.fail(&second, "boom again").await.unwrap(),
            FailOutcome::Exhausted { attempts: 2 }
        ));

        let failed = queue.failed("work", 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error, "boom again");
        assert_eq!(failed[0].attempts, 2);
    }

    #[tokio::test]
    async fn expired_leases_are_redelivered_then_exhausted() {
        let options = QueueOptions {
            max_stalled_count: 1,
            stalled_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let Some(queue) = queue(options).await else {
            return;
        };
        queue
            .enqueue("work", item(), EnqueueOptions::default())
            .await
            .unwrap();

        let lost = queue.fetch("work", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = queue.reclaim_stalled("work").await.unwrap();
        assert_eq!(report.redelivered.len(), 1);
        assert!(matches!(queue.fail(&lost, "late").await, Err(QueueError::LeaseLost(_))));

        let again = queue.fetch("work", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.stalled_count, 1);
        assert_eq!(again.attempt, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = queue.reclaim_stalled("work").await.unwrap();
        assert_eq!(report.exhausted.len(), 1);

        let failed = queue.failed("work", 10).await.unwrap();
        assert_eq!(failed[0].error, STALL_LIMIT_ERROR);
    }
}
