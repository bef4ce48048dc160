//! Process-wide handles shared by the job services.

use std::sync::Arc;

use platform_core::SharedClock;

use crate::config::JobsConfig;
use crate::lock::SharedLockProvider;
use crate::queue::SharedJobQueue;
use crate::store::SharedJobStore;

/// Created once at process start by [`crate::JobsBuilder`] and handed to
/// every component at construction.
#[derive(Clone)]
pub struct JobsContext {
    pub config: Arc<JobsConfig>,
    pub store: SharedJobStore,
    pub locks: SharedLockProvider,
    pub queue: SharedJobQueue,
    pub clock: SharedClock,
    /// Names this process in logs.
    pub worker_id: String,
}

impl std::fmt::Debug for JobsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobsContext")
            .field("worker_id", &self.worker_id)
            .field("queues", &self.config.queues.len())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
