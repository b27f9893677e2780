//! Job definitions loaded from configuration

use crate::JobError;
use crate::schedule::next_run_at;
use chrono::{DateTime, Utc};
use dw_config::{DwConfig, JobConfig};
use dw_store::{DwStore, JobStore, JobTarget, JobUpdate, ScheduledJob};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Keeps the `jobs` table in step with `[[jobs]]`
pub struct JobCatalog {
    store: Arc<DwStore>,
}

impl JobCatalog {
    pub fn new(store: Arc<DwStore>) -> Self {
        Self { store }
    }

    /// Upsert every configured job and disable stored jobs no longer configured.
    ///
    /// Run history is preserved. `next_run_at` is computed when missing or
    /// when the schedule changed.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] on store failures or an invalid schedule.
    pub fn load_from_config(&self, config: &DwConfig, now: DateTime<Utc>) -> Result<usize, JobError> {
        let mut configured = HashSet::new();

        for job_config in &config.jobs {
            let existing = self.store.get_job(&job_config.id)?;
            let job = merge(job_config, existing.as_ref(), now)?;
            self.store.upsert_job(&job)?;
            configured.insert(job.job_id);
        }

        for stale in self.store.list_jobs()? {
            if stale.enabled && !configured.contains(&stale.job_id) {
                warn!(job_id = %stale.job_id, "Job no longer configured, disabling");
                self.store.update_job(
                    &stale.job_id,
                    &JobUpdate {
                        enabled: Some(false),
                        ..Default::default()
                    },
                )?;
            }
        }

        info!(count = configured.len(), "Loaded jobs from config");
        Ok(configured.len())
    }

    /// All stored jobs
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] if the query fails.
    pub fn jobs(&self) -> Result<Vec<ScheduledJob>, JobError> {
        Ok(self.store.list_jobs()?)
    }
}

fn merge(
    config: &JobConfig,
    existing: Option<&ScheduledJob>,
    now: DateTime<Utc>,
) -> Result<ScheduledJob, JobError> {
    let last_run_at = existing.and_then(|j| j.last_run_at);
    let next = match existing {
        Some(job) if job.schedule == config.schedule && job.next_run_at.is_some() => {
            job.next_run_at
        }
        _ => Some(next_run_at(&config.schedule, last_run_at, now)?),
    };

    Ok(ScheduledJob {
        job_id: config.id.clone(),
        owner: config.owner.clone(),
        schedule: config.schedule,
        retention: config.retention,
        enabled: config.enabled,
        last_run_at,
        next_run_at: next,
        targets: config
            .targets
            .iter()
            .map(|t| JobTarget {
                host_id: t.host.clone(),
                container: t.container.clone(),
            })
            .collect(),
    })
}
