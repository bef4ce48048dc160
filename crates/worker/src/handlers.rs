//! Handlers shipped with the worker binary.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use platform_core::SharedClock;
use platform_jobs::{JobContext, JobExecutionService, JobHandler, SharedJobStore};

/// Job name of [`ExecutionRetention`].
pub const EXECUTION_RETENTION: &str = "execution-retention";

/// Job name of [`Heartbeat`].
pub const HEARTBEAT: &str = "heartbeat";

/// Deletes finished executions older than the retention period.
pub struct ExecutionRetention {
    executions: JobExecutionService,
    retention: Duration,
}

impl ExecutionRetention {
    pub fn new(store: SharedJobStore, clock: SharedClock, retention: Duration) -> Self {
        Self {
            executions: JobExecutionService::new(store, clock),
            retention,
        }
    }
}

#[async_trait]
impl JobHandler for ExecutionRetention {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        let pruned = self.executions.prune(self.retention).await?;
        info!(
            execution_id = %ctx.execution_id,
            pruned,
            retention_secs = self.retention.as_secs(),
            "pruned execution history"
        );
        Ok(())
    }
}

/// Logs that the worker is alive, echoing the trigger payload.
pub struct Heartbeat;

#[async_trait]
impl JobHandler for Heartbeat {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        info!(
            execution_id = %ctx.execution_id,
            attempt = ctx.attempt,
            payload = %ctx.payload,
            "heartbeat"
        );
        Ok(())
    }
}
