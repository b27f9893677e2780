//! Wiring of the store, session registry, synchronizer, monitor and scheduler

use crate::CliError;
use chrono::Utc;
use dw_alert::{CachedInventory, InventorySource, LiveInventory, Monitor, notifier_from_config};
use dw_config::{DwConfig, InventorySourceKind};
use dw_jobs::{JobCatalog, JobScheduler, SnapshotRunner};
use dw_remote::{
    BroadcastSink, CommandExecutor, CommandResult, CredentialResolver, EnvCredentialResolver,
    LastErrorRegistry, RemoteError, RunOptions, RusshTransport, SessionConfig, SessionRegistry,
    Synchronizer, Transport,
};
use dw_store::{DwStore, HostRegistry};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything a running dockwatch needs, built once from configuration
pub struct Engine {
    config: DwConfig,
    store: Arc<DwStore>,
    sessions: Arc<SessionRegistry>,
    executor: Arc<CommandExecutor>,
    events: Arc<BroadcastSink>,
    synchronizer: Arc<Synchronizer>,
    monitor: Option<Arc<Monitor>>,
    scheduler: Arc<JobScheduler>,
}

impl Engine {
    /// Open the configured database and connect over SSH.
    ///
    /// # Errors
    ///
    /// Returns [`CliError`] if the store cannot be opened or seeded.
    pub fn open(config: DwConfig) -> Result<Self, CliError> {
        let store = Arc::new(DwStore::open(&config.global.db_path)?);
        let transport = Arc::new(RusshTransport::new(config.ssh.keepalive_interval()));
        Self::assemble(config, store, transport, Arc::new(EnvCredentialResolver::new()))
    }

    /// Build on an explicit store, transport and credential resolver.
    ///
    /// Hosts and jobs from `config` are written to the store first.
    ///
    /// # Errors
    ///
    /// Returns [`CliError`] if seeding hosts or jobs fails.
    pub fn assemble(
        config: DwConfig,
        store: Arc<DwStore>,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialResolver>,
    ) -> Result<Self, CliError> {
        HostRegistry::new(store.clone()).load_from_config(&config)?;
        JobCatalog::new(store.clone()).load_from_config(&config, Utc::now())?;

        let sessions = Arc::new(SessionRegistry::new(
            transport,
            credentials,
            SessionConfig::from(&config.ssh),
        ));
        let executor = Arc::new(CommandExecutor::new(
            sessions.clone(),
            store.clone(),
            config.ssh.command_timeout(),
        ));
        let events = Arc::new(BroadcastSink::default());
        let errors = Arc::new(LastErrorRegistry::new());
        let synchronizer = Arc::new(Synchronizer::new(
            store.clone(),
            store.clone(),
            executor.clone(),
            events.clone(),
            errors.clone(),
        ));
        let monitor = build_monitor(&config, &store, &executor, errors).map(Arc::new);
        let scheduler = Arc::new(JobScheduler::new(
            store.clone(),
            SnapshotRunner::new(
                executor.clone(),
                config.scheduler.snapshot_repository.clone(),
                config.ssh.long_command_timeout(),
            ),
        ));

        Ok(Self {
            config,
            store,
            sessions,
            executor,
            events,
            synchronizer,
            monitor,
            scheduler,
        })
    }

    #[must_use]
    pub fn config(&self) -> &DwConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<DwStore> {
        &self.store
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    #[must_use]
    pub fn events(&self) -> &Arc<BroadcastSink> {
        &self.events
    }

    #[must_use]
    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }

    /// `None` when alerting is disabled or has no delivery channel
    #[must_use]
    pub fn monitor(&self) -> Option<&Arc<Monitor>> {
        self.monitor.as_ref()
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Run a command on a host.
    ///
    /// # Errors
    ///
    /// See [`CommandExecutor::run`].
    pub async fn run_command(
        &self,
        host_id: &str,
        command: &str,
        options: RunOptions,
    ) -> Result<CommandResult, RemoteError> {
        self.executor.run(host_id, command, options).await
    }

    /// Sync one host immediately.
    ///
    /// # Errors
    ///
    /// See [`Synchronizer::sync_one`].
    pub async fn sync_host_now(&self, host_id: &str) -> Result<(), RemoteError> {
        self.synchronizer.sync_one(host_id).await
    }

    #[must_use]
    pub fn last_sync_error(&self, host_id: &str) -> Option<String> {
        self.synchronizer.last_error(host_id)
    }

    /// Put a host at the front of the next sync tick.
    pub async fn refresh_server(&self, host_id: &str) {
        self.synchronizer.refresh_server(host_id).await;
    }

    /// Close every pooled session.
    pub async fn shutdown(&self) {
        self.sessions.close_all().await;
    }
}

fn build_monitor(
    config: &DwConfig,
    store: &Arc<DwStore>,
    executor: &Arc<CommandExecutor>,
    errors: Arc<LastErrorRegistry>,
) -> Option<Monitor> {
    if !config.monitor.enabled {
        info!("Container monitor disabled");
        return None;
    }
    let Some(notifier) = notifier_from_config(&config.monitor) else {
        warn!("No alert channel configured; container alerting disabled");
        return None;
    };

    let source: Arc<dyn InventorySource> = match config.monitor.source {
        InventorySourceKind::Cache => {
            Arc::new(CachedInventory::new(store.clone()).with_sync_errors(errors))
        }
        InventorySourceKind::Live => Arc::new(LiveInventory::new(executor.clone())),
    };

    Some(
        Monitor::new(
            config.monitor.subscriptions.clone(),
            store.clone(),
            source,
            Arc::new(notifier),
            config.alert_cooldown(),
        )
        .with_alert_log(store.clone()),
    )
}
