//! Infrastructure adapters for the job runner: Postgres persistence and,
//! behind the `redis` feature, Redis locks and queues.

pub mod jobs;

pub use jobs::PostgresJobStore;
#[cfg(feature = "redis")]
pub use jobs::{RedisJobQueue, RedisLockProvider};
