//! Scheduler loop: run due jobs, record history, advance next-run

use crate::JobError;
use crate::runner::SnapshotRunner;
use crate::schedule;
use chrono::{DateTime, Utc};
use dw_remote::BusyFlag;
use dw_store::{JobRun, JobRunStatus, JobStore, JobUpdate, ScheduledJob};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Outcome of one scheduler tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSummary {
    /// The previous tick was still running
    pub skipped: bool,
    pub jobs_run: usize,
    pub targets_succeeded: usize,
    pub targets_failed: usize,
}

pub struct JobScheduler {
    jobs: Arc<dyn JobStore>,
    runner: SnapshotRunner,
    busy: BusyFlag,
}

impl JobScheduler {
    pub fn new(jobs: Arc<dyn JobStore>, runner: SnapshotRunner) -> Self {
        Self {
            jobs,
            runner,
            busy: BusyFlag::new(),
        }
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.is_busy()
    }

    /// Next run of `job` as seen at `now`
    ///
    /// # Errors
    ///
    /// Returns [`JobError::InvalidSchedule`] for out-of-range schedule fields.
    pub fn next_run_at(
        &self,
        job: &ScheduledJob,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, JobError> {
        schedule::next_run_at(&job.schedule, job.last_run_at, now)
    }

    pub async fn tick(&self) -> Result<SchedulerSummary, JobError> {
        self.tick_at(Utc::now()).await
    }

    /// One scheduler pass; skipped if the previous pass is still running.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] only if due jobs cannot be listed.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<SchedulerSummary, JobError> {
        let Some(_guard) = self.busy.try_enter() else {
            debug!("Scheduler tick still running, skipping");
            return Ok(SchedulerSummary {
                skipped: true,
                ..Default::default()
            });
        };
        self.run_due_jobs(now).await
    }

    /// Run every job due at `now`, one after another.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] only if due jobs cannot be listed.
    pub async fn run_due_jobs(&self, now: DateTime<Utc>) -> Result<SchedulerSummary, JobError> {
        let due = self.jobs.find_due_jobs(now)?;
        let mut summary = SchedulerSummary::default();
        if due.is_empty() {
            return Ok(summary);
        }

        info!(count = due.len(), "Running due jobs");
        for job in &due {
            let (ok, failed) = self.run_job(job, now).await;
            summary.jobs_run += 1;
            summary.targets_succeeded += ok;
            summary.targets_failed += failed;
        }
        Ok(summary)
    }

    /// Run each target in order, then persist `last_run_at` and the next run.
    #[instrument(skip(self, job), fields(job_id = %job.job_id))]
    async fn run_job(&self, job: &ScheduledJob, now: DateTime<Utc>) -> (usize, usize) {
        let mut ok = 0;
        let mut failed = 0;

        for target in &job.targets {
            let started_at = Utc::now();
            let result = self.runner.run_target(target, job.retention, now).await;
            let finished_at = Utc::now();

            let mut run = JobRun {
                run_id: Uuid::new_v4().to_string(),
                job_id: job.job_id.clone(),
                host_id: target.host_id.clone(),
                container: target.container.clone(),
                started_at,
                finished_at,
                status: JobRunStatus::Success,
                snapshot: None,
                pruned: 0,
                error: None,
            };
            match result {
                Ok(outcome) => {
                    ok += 1;
                    run.snapshot = Some(outcome.snapshot);
                    run.pruned = outcome.pruned;
                }
                Err(e) => {
                    failed += 1;
                    warn!(
                        host_id = %target.host_id,
                        container = %target.container,
                        error = %e,
                        "Job target failed"
                    );
                    run.status = JobRunStatus::Failure;
                    run.error = Some(e.to_string());
                }
            }
            if let Err(e) = self.jobs.record_job_run(&run) {
                warn!(error = %e, "Failed to record job run");
            }
        }

        let update = match schedule::next_run_at(&job.schedule, Some(now), now) {
            Ok(next) => JobUpdate {
                last_run_at: Some(now),
                next_run_at: Some(next),
                enabled: None,
            },
            Err(e) => {
                error!(error = %e, "Disabling job with invalid schedule");
                JobUpdate {
                    last_run_at: Some(now),
                    next_run_at: None,
                    enabled: Some(false),
                }
            }
        };
        if let Err(e) = self.jobs.update_job(&job.job_id, &update) {
            error!(error = %e, "Failed to persist job progress");
        }

        info!(succeeded = ok, failed, "Job finished");
        (ok, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dw_config::Schedule;
    use dw_remote::mock::{MockReply, MockTransport};
    use dw_remote::{CommandExecutor, EnvCredentialResolver, SessionConfig, SessionRegistry};
    use dw_store::{DwStore, Host, JobTarget};
    use std::time::Duration;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn setup(transport: &MockTransport) -> (Arc<DwStore>, JobScheduler) {
        let store = Arc::new(DwStore::open_memory().unwrap());
        for id in ["web-1", "web-2"] {
            store
                .upsert_host(&Host {
                    host_id: id.to_string(),
                    name: None,
                    address: format!("{id}.example.com"),
                    overlay_address: None,
                    port: 22,
                    user: "deploy".to_string(),
                    credential_ref: None,
                    enabled: true,
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        let sessions = Arc::new(SessionRegistry::new(
            Arc::new(transport.clone()),
            Arc::new(EnvCredentialResolver::with_lookup(|_| None)),
            SessionConfig::default(),
        ));
        let executor = Arc::new(CommandExecutor::new(
            sessions,
            store.clone(),
            Duration::from_secs(5),
        ));
        let runner = SnapshotRunner::new(executor, "snapshots", Duration::from_secs(60));
        (store.clone(), JobScheduler::new(store, runner))
    }

    fn nightly(next: Option<DateTime<Utc>>, targets: &[(&str, &str)]) -> ScheduledJob {
        ScheduledJob {
            job_id: "nightly".to_string(),
            owner: "ops".to_string(),
            schedule: Schedule::Daily { hour: 2, minute: 0 },
            retention: 5,
            enabled: true,
            last_run_at: None,
            next_run_at: next,
            targets: targets
                .iter()
                .map(|(host, container)| JobTarget {
                    host_id: (*host).to_string(),
                    container: (*container).to_string(),
                })
                .collect(),
        }
    }

    fn script_success(transport: &MockTransport) {
        transport.reply("docker ps -a", MockReply::ok("c0ffee\n"));
        transport.reply("docker commit", MockReply::ok(""));
        transport.reply("docker images", MockReply::ok(""));
    }

    #[tokio::test]
    async fn test_due_job_runs_and_advances() {
        let transport = MockTransport::new();
        script_success(&transport);
        let (store, scheduler) = setup(&transport);
        store
            .upsert_job(&nightly(None, &[("web-1", "api"), ("web-2", "db")]))
            .unwrap();

        let now = utc("2024-01-01T03:00:00Z");
        let summary = scheduler.tick_at(now).await.unwrap();
        assert_eq!(summary.jobs_run, 1);
        assert_eq!(summary.targets_succeeded, 2);

        let job = store.get_job("nightly").unwrap().unwrap();
        assert_eq!(job.last_run_at, Some(now));
        assert_eq!(job.next_run_at, Some(utc("2024-01-02T02:00:00Z")));

        let runs = store.list_job_runs("nightly", 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == JobRunStatus::Success));
        assert!(
            runs.iter()
                .any(|r| r.snapshot.as_deref() == Some("snapshots/db:20240101030000"))
        );

        // Not due again until tomorrow
        let summary = scheduler.tick_at(utc("2024-01-01T12:00:00Z")).await.unwrap();
        assert_eq!(summary.jobs_run, 0);
    }

    #[tokio::test]
    async fn test_failed_target_does_not_stop_the_rest() {
        let transport = MockTransport::new();
        script_success(&transport);
        transport.reply_for("web-2", "docker ps -a", MockReply::ok(""));
        let (store, scheduler) = setup(&transport);
        store
            .upsert_job(&nightly(
                None,
                &[("web-1", "api"), ("web-2", "db"), ("web-1", "worker")],
            ))
            .unwrap();

        let summary = scheduler
            .tick_at(utc("2024-01-01T03:00:00Z"))
            .await
            .unwrap();
        assert_eq!(summary.targets_succeeded, 2);
        assert_eq!(summary.targets_failed, 1);

        let worker_commits = transport
            .commands_for("web-1")
            .iter()
            .filter(|c| c.starts_with("docker commit"))
            .count();
        assert_eq!(worker_commits, 2);

        let runs = store.list_job_runs("nightly", 10).unwrap();
        let failed: Vec<&JobRun> = runs
            .iter()
            .filter(|r| r.status == JobRunStatus::Failure)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].container, "db");
        assert!(failed[0].error.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_next_run_advances_when_every_target_fails() {
        let transport = MockTransport::new();
        transport.fail_dial("web-1.example.com");
        let (store, scheduler) = setup(&transport);
        store.upsert_job(&nightly(None, &[("web-1", "api")])).unwrap();

        let now = utc("2024-01-01T01:00:00Z");
        let summary = scheduler.tick_at(now).await.unwrap();
        assert_eq!(summary.targets_failed, 1);

        let job = store.get_job("nightly").unwrap().unwrap();
        assert_eq!(job.last_run_at, Some(now));
        assert_eq!(job.next_run_at, Some(utc("2024-01-01T02:00:00Z")));
    }

    #[tokio::test]
    async fn test_future_and_disabled_jobs_are_ignored() {
        let transport = MockTransport::new();
        let (store, scheduler) = setup(&transport);
        store
            .upsert_job(&nightly(Some(utc("2024-01-02T02:00:00Z")), &[("web-1", "api")]))
            .unwrap();
        let mut disabled = nightly(None, &[("web-1", "api")]);
        disabled.job_id = "off".to_string();
        disabled.enabled = false;
        store.upsert_job(&disabled).unwrap();

        let summary = scheduler
            .tick_at(utc("2024-01-01T03:00:00Z"))
            .await
            .unwrap();
        assert_eq!(summary, SchedulerSummary::default());
        assert!(transport.commands().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_schedule_disables_job() {
        let transport = MockTransport::new();
        let (store, scheduler) = setup(&transport);
        let mut job = nightly(None, &[]);
        job.schedule = Schedule::Daily {
            hour: 25,
            minute: 0,
        };
        store.upsert_job(&job).unwrap();

        scheduler
            .tick_at(utc("2024-01-01T03:00:00Z"))
            .await
            .unwrap();
        let stored = store.get_job("nightly").unwrap().unwrap();
        assert!(!stored.enabled);
    }

    #[test]
    fn test_next_run_at_uses_last_run() {
        let transport = MockTransport::new();
        let (_store, scheduler) = setup(&transport);
        let mut job = nightly(None, &[]);
        job.schedule = Schedule::Interval { hours: 4 };
        job.last_run_at = Some(utc("2024-01-01T10:00:00Z"));
        assert_eq!(
            scheduler
                .next_run_at(&job, utc("2024-01-01T11:00:00Z"))
                .unwrap(),
            utc("2024-01-01T14:00:00Z")
        );
    }
}
