//! Durable implementations of the `platform-jobs` seams.
//!
//! - `PostgresJobStore`: job definitions, versions and execution history
//! - `RedisLockProvider`: token-checked distributed locks (`redis` feature)
//! - `RedisJobQueue`: leased, retrying, deduplicating queues (`redis` feature)

pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis_lock;
#[cfg(feature = "redis")]
pub mod redis_queue;

pub use postgres::PostgresJobStore;
#[cfg(feature = "redis")]
pub use redis_lock::RedisLockProvider;
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
