//! Periodic container monitor
//!
//! Each tick reads every watched host's containers once, runs them through the
//! [`AlertStateStore`] for every subscription covering the host, and hands the
//! resulting alerts to the [`Notifier`]. Delivery attempts are written to the
//! alert log when one is attached.

use crate::notify::{Delivery, Notifier};
use crate::source::InventorySource;
use crate::state::{AlertKey, AlertStateStore, Observation};
use crate::{AlertKind, ContainerAlert};
use chrono::{DateTime, Utc};
use dw_config::AlertSubscription;
use dw_remote::{BusyFlag, ContainerInfo};
use dw_store::{AlertLogEntry, DwStore, Host, HostDirectory, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Persists alert delivery attempts
pub trait AlertLog: Send + Sync {
    fn record(&self, entry: &AlertLogEntry) -> Result<(), StoreError>;
}

impl AlertLog for DwStore {
    fn record(&self, entry: &AlertLogEntry) -> Result<(), StoreError> {
        self.record_alert(entry)
    }
}

/// Outcome of one monitor tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    /// The previous tick was still running
    pub skipped: bool,
    pub hosts_checked: usize,
    pub hosts_failed: usize,
    pub alerts_sent: usize,
    pub alerts_failed: usize,
}

pub struct Monitor {
    subscriptions: Vec<AlertSubscription>,
    hosts: Arc<dyn HostDirectory>,
    source: Arc<dyn InventorySource>,
    notifier: Arc<dyn Notifier>,
    log: Option<Arc<dyn AlertLog>>,
    state: AlertStateStore,
    cooldown: Duration,
    busy: BusyFlag,
}

impl Monitor {
    pub fn new(
        subscriptions: Vec<AlertSubscription>,
        hosts: Arc<dyn HostDirectory>,
        source: Arc<dyn InventorySource>,
        notifier: Arc<dyn Notifier>,
        cooldown: Duration,
    ) -> Self {
        Self {
            subscriptions,
            hosts,
            source,
            notifier,
            log: None,
            state: AlertStateStore::new(),
            cooldown,
            busy: BusyFlag::new(),
        }
    }

    #[must_use]
    pub fn with_alert_log(mut self, log: Arc<dyn AlertLog>) -> Self {
        self.log = Some(log);
        self
    }

    #[must_use]
    pub fn state(&self) -> &AlertStateStore {
        &self.state
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.is_busy()
    }

    pub async fn tick(&self) -> Result<MonitorSummary, StoreError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one monitor pass as of `now`.
    ///
    /// A tick that overlaps a running one is skipped. A host whose inventory
    /// cannot be read is skipped for this tick; its alert state is untouched.
    #[instrument(skip(self))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<MonitorSummary, StoreError> {
        let Some(_guard) = self.busy.try_enter() else {
            debug!("Monitor tick still running, skipping");
            return Ok(MonitorSummary {
                skipped: true,
                ..Default::default()
            });
        };

        let mut summary = MonitorSummary::default();
        if self.subscriptions.is_empty() {
            debug!("No alert subscriptions configured");
            return Ok(summary);
        }

        for host in self.hosts.list_hosts()?.into_iter().filter(|h| h.enabled) {
            let watchers: Vec<&AlertSubscription> = self
                .subscriptions
                .iter()
                .filter(|s| s.covers(&host.host_id))
                .collect();
            if watchers.is_empty() {
                continue;
            }

            let containers = match self.source.containers(&host).await {
                Ok(containers) => containers,
                Err(e) => {
                    warn!(host_id = %host.host_id, error = %e, "Inventory unavailable, skipping host");
                    summary.hosts_failed += 1;
                    continue;
                }
            };
            summary.hosts_checked += 1;

            // Placeholder records from malformed output carry no trustworthy state
            let (containers, degraded): (Vec<ContainerInfo>, Vec<ContainerInfo>) = containers
                .into_iter()
                .partition(|c| c.degraded.is_none());
            if !degraded.is_empty() {
                debug!(
                    host_id = %host.host_id,
                    skipped = degraded.len(),
                    "Ignoring degraded inventory records"
                );
            }

            for subscription in watchers {
                for container in &containers {
                    self.check_container(&host, subscription, container, now, &mut summary)
                        .await;
                }
            }
        }

        if summary.alerts_sent + summary.alerts_failed > 0 {
            info!(
                sent = summary.alerts_sent,
                failed = summary.alerts_failed,
                "Monitor tick delivered alerts"
            );
        }
        Ok(summary)
    }

    async fn check_container(
        &self,
        host: &Host,
        subscription: &AlertSubscription,
        container: &ContainerInfo,
        now: DateTime<Utc>,
        summary: &mut MonitorSummary,
    ) {
        let key = AlertKey::new(&subscription.owner, &host.host_id, &container.name);
        let observation = Observation {
            running: container.is_running(),
            auto_restart: container.has_auto_restart(),
        };

        for kind in self.state.observe(&key, observation, now, self.cooldown) {
            let alert = ContainerAlert {
                kind,
                owner: subscription.owner.clone(),
                recipient: subscription.recipient.clone(),
                host_id: host.host_id.clone(),
                host_name: host.display_name().to_string(),
                container: container.name.clone(),
                image: container.image.clone(),
                status: container.status.clone(),
                at: now,
            };

            let delivery = self.send(&alert).await;
            if delivery.success {
                summary.alerts_sent += 1;
            } else {
                summary.alerts_failed += 1;
                warn!(
                    kind = kind.as_str(),
                    host_id = %alert.host_id,
                    container = %alert.container,
                    error = delivery.error.as_deref().unwrap_or(""),
                    "Alert delivery failed"
                );
            }
            self.log_attempt(&alert, &delivery);
        }
    }

    async fn send(&self, alert: &ContainerAlert) -> Delivery {
        match alert.kind {
            AlertKind::Down => self.notifier.send_down_alert(alert).await,
            AlertKind::Up => self.notifier.send_up_alert(alert).await,
            AlertKind::NoAutoRestart => self.notifier.send_no_auto_restart_alert(alert).await,
        }
    }

    fn log_attempt(&self, alert: &ContainerAlert, delivery: &Delivery) {
        let Some(log) = &self.log else {
            return;
        };
        let entry = AlertLogEntry {
            sent_at: alert.at,
            owner: alert.owner.clone(),
            host_id: alert.host_id.clone(),
            container: alert.container.clone(),
            kind: alert.kind.as_str().to_string(),
            recipient: alert.recipient.clone(),
            success: delivery.success,
            error: delivery.error.clone(),
        };
        if let Err(e) = log.record(&entry) {
            warn!(error = %e, "Failed to record alert");
        }
    }
}
