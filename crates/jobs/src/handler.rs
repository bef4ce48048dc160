//! Job handler abstraction.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use platform_core::{ExecutionId, TenantId};

/// Everything a handler gets to know about the run it executes.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub execution_id: ExecutionId,
    pub job_name: String,
    pub queue: String,
    pub job_version: u64,
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
    pub tenant_id: Option<TenantId>,
    pub payload: serde_json::Value,
}

impl JobContext {
    /// Deserialize the payload into a typed value.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Application code run for a job.
///
/// Delivery is at-least-once, so implementations must tolerate re-execution.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()>;
}

pub type SharedHandler = Arc<dyn JobHandler>;

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}
