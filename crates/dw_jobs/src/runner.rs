//! Snapshot one job target: locate, commit, prune

use crate::JobError;
use crate::snapshot::{
    commit_command, find_container_command, list_command, parse_snapshot_list,
    remove_command, repository_for, select_prunable, tag_for, validate_container_name,
};
use chrono::{DateTime, Utc};
use dw_remote::{CommandExecutor, RunOptions};
use dw_store::JobTarget;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// What one successful target run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    /// Full image reference of the new snapshot
    pub snapshot: String,
    /// Old snapshots removed
    pub pruned: u32,
}

pub struct SnapshotRunner {
    executor: Arc<CommandExecutor>,
    repository: String,
    commit_timeout: Duration,
}

impl SnapshotRunner {
    pub fn new(
        executor: Arc<CommandExecutor>,
        repository: impl Into<String>,
        commit_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            repository: repository.into(),
            commit_timeout,
        }
    }

    /// Snapshot `target` and prune to `retention`.
    ///
    /// A failed removal during pruning is logged and not counted; it does not
    /// fail the target.
    ///
    /// # Errors
    ///
    /// - [`JobError::InvalidContainerName`] before anything runs remotely
    /// - [`JobError::ContainerNotFound`] when no container has the name
    /// - [`JobError::AmbiguousContainer`] when the lookup returns several ids
    /// - [`JobError::Remote`] when locating, committing or listing fails
    #[instrument(skip(self), fields(host_id = %target.host_id, container = %target.container))]
    pub async fn run_target(
        &self,
        target: &JobTarget,
        retention: u32,
        at: DateTime<Utc>,
    ) -> Result<TargetOutcome, JobError> {
        validate_container_name(&target.container)?;
        let host = self.executor.host(&target.host_id)?;

        let found = self
            .executor
            .run_on(&host, &find_container_command(&target.container), RunOptions::default())
            .await?;
        let ids: Vec<&str> = found
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        let container_id = match ids.as_slice() {
            [id] => (*id).to_string(),
            [] => {
                return Err(JobError::ContainerNotFound {
                    host: target.host_id.clone(),
                    container: target.container.clone(),
                });
            }
            _ => {
                return Err(JobError::AmbiguousContainer {
                    host: target.host_id.clone(),
                    container: target.container.clone(),
                    matches: ids.len(),
                });
            }
        };

        let repository = repository_for(&self.repository, &target.container);
        let image = format!("{repository}:{}", tag_for(at));
        self.executor
            .run_on(
                &host,
                &commit_command(&container_id, &image),
                RunOptions::default().with_timeout(self.commit_timeout),
            )
            .await?;
        info!(image = %image, "Snapshot committed");

        let listing = self
            .executor
            .run_on(&host, &list_command(&repository), RunOptions::default())
            .await?;
        let snapshots = parse_snapshot_list(&listing.stdout);

        let mut pruned = 0;
        for old in select_prunable(&snapshots, retention) {
            let reference = format!("{repository}:{}", old.tag);
            match self
                .executor
                .run_on(&host, &remove_command(&reference), RunOptions::default())
                .await
            {
                Ok(_) => {
                    debug!(image = %reference, "Pruned snapshot");
                    pruned += 1;
                }
                Err(e) => warn!(image = %reference, error = %e, "Failed to prune snapshot"),
            }
        }

        Ok(TargetOutcome {
            snapshot: image,
            pruned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dw_remote::mock::{MockReply, MockTransport};
    use dw_remote::{EnvCredentialResolver, SessionConfig, SessionRegistry};
    use dw_store::{DwStore, Host};

    fn executor(transport: &MockTransport) -> Arc<CommandExecutor> {
        let store = Arc::new(DwStore::open_memory().unwrap());
        store
            .upsert_host(&Host {
                host_id: "web-1".to_string(),
                name: None,
                address: "203.0.113.10".to_string(),
                overlay_address: None,
                port: 22,
                user: "deploy".to_string(),
                credential_ref: None,
                enabled: true,
                created_at: Utc::now(),
            })
            .unwrap();
        let sessions = Arc::new(SessionRegistry::new(
            Arc::new(transport.clone()),
            Arc::new(EnvCredentialResolver::with_lookup(|_| None)),
            SessionConfig::default(),
        ));
        Arc::new(CommandExecutor::new(sessions, store, Duration::from_secs(5)))
    }

    fn target(container: &str) -> JobTarget {
        JobTarget {
            host_id: "web-1".to_string(),
            container: container.to_string(),
        }
    }

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-08T02:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn listing(days: std::ops::RangeInclusive<u32>) -> String {
        days.map(|d| format!("202401{d:02}020000|2024-01-{d:02} 02:00:01 +0000 UTC\n"))
            .collect()
    }

    #[tokio::test]
    async fn test_snapshot_and_prune() {
        let transport = MockTransport::new();
        transport.reply("docker ps -a", MockReply::ok("c0ffee\n"));
        transport.reply("docker commit", MockReply::ok("sha256:abc\n"));
        transport.reply("docker images", MockReply::ok(listing(2..=8)));
        transport.reply("docker rmi", MockReply::ok("Untagged\n"));

        let runner = SnapshotRunner::new(executor(&transport), "snapshots", Duration::from_secs(60));
        let outcome = runner.run_target(&target("api"), 5, at()).await.unwrap();

        assert_eq!(outcome.snapshot, "snapshots/api:20240108020000");
        assert_eq!(outcome.pruned, 2);

        let commands = transport.commands_for("web-1");
        assert!(commands.contains(&"docker commit c0ffee snapshots/api:20240108020000".to_string()));
        let removed: Vec<&String> = commands.iter().filter(|c| c.starts_with("docker rmi")).collect();
        assert_eq!(
            removed,
            vec![
                "docker rmi snapshots/api:20240103020000",
                "docker rmi snapshots/api:20240102020000",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_container() {
        let transport = MockTransport::new();
        transport.reply("docker ps -a", MockReply::ok(""));

        let runner = SnapshotRunner::new(executor(&transport), "snapshots", Duration::from_secs(60));
        let err = runner.run_target(&target("api"), 5, at()).await.unwrap_err();
        assert!(matches!(err, JobError::ContainerNotFound { .. }));
        assert!(
            !transport
                .commands_for("web-1")
                .iter()
                .any(|c| c.starts_with("docker commit"))
        );
    }

    #[tokio::test]
    async fn test_invalid_name_runs_nothing() {
        let transport = MockTransport::new();
        let runner = SnapshotRunner::new(executor(&transport), "snapshots", Duration::from_secs(60));
        let err = runner
            .run_target(&target("api$(reboot)"), 5, at())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidContainerName(_)));
        assert!(transport.commands().is_empty());
    }

    #[tokio::test]
    async fn test_failed_prune_is_not_counted() {
        let transport = MockTransport::new();
        transport.reply("docker ps -a", MockReply::ok("c0ffee\n"));
        transport.reply("docker commit", MockReply::ok(""));
        transport.reply("docker images", MockReply::ok(listing(1..=7)));
        transport.reply("docker rmi", MockReply::ok(""));
        transport.reply(
            "docker rmi snapshots/api:20240101",
            MockReply::fail(1, "image is being used"),
        );

        let runner = SnapshotRunner::new(executor(&transport), "snapshots", Duration::from_secs(60));
        let outcome = runner.run_target(&target("api"), 5, at()).await.unwrap();
        assert_eq!(outcome.pruned, 1);
    }

    #[tokio::test]
    async fn test_ambiguous_lookup_commits_nothing() {
        let transport = MockTransport::new();
        transport.reply("docker ps -a", MockReply::ok("c0ffee\nbadd1e\n"));

        let runner = SnapshotRunner::new(executor(&transport), "snapshots", Duration::from_secs(60));
        let err = runner.run_target(&target("web.1"), 5, at()).await.unwrap_err();
        assert!(matches!(err, JobError::AmbiguousContainer { matches: 2, .. }));

        let commands = transport.commands_for("web-1");
        assert_eq!(
            commands,
            vec![r"docker ps -a --filter 'name=^/web\.1$' --format '{{.ID}}'".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unordered_listing_prunes_oldest() {
        let transport = MockTransport::new();
        transport.reply("docker ps -a", MockReply::ok("c0ffee\n"));
        transport.reply("docker commit", MockReply::ok(""));
        let shuffled: String = [5, 2, 8, 3, 7, 4, 6]
            .iter()
            .map(|d| format!("202401{d:02}020000|2024-01-{d:02} 02:00:01 +0000 UTC\n"))
            .collect();
        transport.reply("docker images", MockReply::ok(shuffled));
        transport.reply("docker rmi", MockReply::ok(""));

        let runner = SnapshotRunner::new(executor(&transport), "snapshots", Duration::from_secs(60));
        let outcome = runner.run_target(&target("api"), 5, at()).await.unwrap();
        assert_eq!(outcome.pruned, 2);

        let mut removed: Vec<String> = transport
            .commands_for("web-1")
            .into_iter()
            .filter(|c| c.starts_with("docker rmi"))
            .collect();
        removed.sort();
        assert_eq!(
            removed,
            vec![
                "docker rmi snapshots/api:20240102020000".to_string(),
                "docker rmi snapshots/api:20240103020000".to_string(),
            ]
        );
    }
}
