//! Job version tracking.
//!
//! Every queued item carries the version of its job at enqueue time. Items
//! whose version is behind the current one are stale and never run.

use tracing::instrument;

use platform_core::SharedClock;

use crate::store::{JobStoreError, SharedJobStore};

#[derive(Debug, Clone, thiserror::Error)]
pub enum VersionError {
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

#[derive(Clone)]
pub struct JobVersionService {
    store: SharedJobStore,
    clock: SharedClock,
}

impl JobVersionService {
    pub fn new(store: SharedJobStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub async fn get_version(&self, job_name: &str) -> Result<u64, VersionError> {
        self.store
            .load_job(job_name)
            .await?
            .map(|job| job.version)
            .ok_or_else(|| VersionError::UnknownJob(job_name.to_string()))
    }

    /// Atomically increment the version; returns the new value.
    #[instrument(skip(self), fields(job = %job_name))]
    pub async fn bump_version(&self, job_name: &str) -> Result<u64, VersionError> {
        match self.store.bump_version(job_name, self.clock.now()).await {
            Ok(version) => {
                tracing::info!(version, "job version bumped");
                Ok(version)
            }
            Err(JobStoreError::NotFound(_)) => Err(VersionError::UnknownJob(job_name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn is_current(&self, job_name: &str, version: u64) -> Result<bool, VersionError> {
        Ok(self.get_version(job_name).await? == version)
    }
}
