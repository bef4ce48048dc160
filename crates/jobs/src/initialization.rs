//! Boot-time reconciliation of configured jobs against persisted rows.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, instrument};

use platform_core::SharedClock;

use crate::registry::JobRegistry;
use crate::store::{JobStoreError, SharedJobStore};
use crate::types::JobChange;

/// What reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    /// Jobs whose semantics changed, with their new version.
    pub updated: Vec<(String, u64)>,
    /// Jobs whose enabled flag flipped without a version change.
    pub toggled: Vec<String>,
    /// Persisted jobs no longer configured; soft-disabled.
    pub disabled: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty()
            && self.updated.is_empty()
            && self.toggled.is_empty()
            && self.disabled.is_empty()
    }
}

#[derive(Clone)]
pub struct JobInitializationService {
    registry: Arc<JobRegistry>,
    store: SharedJobStore,
    clock: SharedClock,
}

impl JobInitializationService {
    pub fn new(
        registry: Arc<JobRegistry>,
        store: SharedJobStore,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
        }
    }

    /// Create missing job rows, update changed ones (bumping their version)
    /// and soft-disable rows nothing configures anymore. Idempotent, and safe
    /// to run from several workers at once: the store bumps a changed job
    /// exactly once.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, JobStoreError> {
        let mut report = ReconcileReport::default();
        let mut configured = HashSet::new();

        for descriptor in self.registry.jobs() {
            configured.insert(descriptor.name.as_str());
            let upserted = self
                .store
                .upsert_job(descriptor.definition(), self.clock.now())
                .await?;

            match upserted.change {
                JobChange::Created => {
                    info!(job = %descriptor.name, queue = %descriptor.queue, "job registered");
                    report.created.push(descriptor.name.clone());
                }
                JobChange::Updated => {
                    let version = upserted.job.version;
                    info!(job = %descriptor.name, version, "job definition changed");
                    report.updated.push((descriptor.name.clone(), version));
                }
                JobChange::Toggled => {
                    info!(job = %descriptor.name, enabled = descriptor.enabled, "job toggled");
                    report.toggled.push(descriptor.name.clone());
                }
                JobChange::Unchanged => {}
            }
        }

        for job in self.store.list_jobs().await? {
            if configured.contains(job.name.as_str()) || !job.enabled {
                continue;
            }
            let mut definition = job.definition();
            definition.enabled = false;
            self.store.upsert_job(definition, self.clock.now()).await?;
            info!(job = %job.name, "job no longer configured, disabled");
            report.disabled.push(job.name);
        }

        Ok(report)
    }
}
