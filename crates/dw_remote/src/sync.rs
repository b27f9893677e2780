//! Inventory synchronizer
//!
//! Each tick visits enabled hosts one at a time in creation order, pulls the
//! container inventory and host facts, and replaces the host's cached rows.
//! A host failure is recorded and the tick moves on to the next host.

use crate::busy::BusyFlag;
use crate::commands;
use crate::events::{ChangeEvent, EventSink};
use crate::executor::{CommandExecutor, RunOptions};
use crate::facts;
use crate::parse::parse_inventory;
use crate::RemoteError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dw_store::{Host, HostDirectory, InventoryCache, InventoryRecord, RecordKind};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Most recent sync failure per host, cleared on the next success
#[derive(Debug, Default)]
pub struct LastErrorRegistry {
    errors: DashMap<String, String>,
}

impl LastErrorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, host_id: &str) -> Option<String> {
        self.errors.get(host_id).map(|e| e.value().clone())
    }

    pub fn set(&self, host_id: &str, message: String) {
        self.errors.insert(host_id.to_string(), message);
    }

    pub fn clear(&self, host_id: &str) {
        self.errors.remove(host_id);
    }

    /// All current errors, sorted by host id
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let mut all: Vec<_> = self
            .errors
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort();
        all
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    /// The tick did nothing because another was running
    pub skipped: bool,
    pub synced: usize,
    pub failed: usize,
}

/// Keeps the inventory cache in line with the fleet
pub struct Synchronizer {
    hosts: Arc<dyn HostDirectory>,
    cache: Arc<dyn InventoryCache>,
    executor: Arc<CommandExecutor>,
    events: Arc<dyn EventSink>,
    errors: Arc<LastErrorRegistry>,
    busy: BusyFlag,
    /// Held for the duration of one host sync, tick or on demand
    in_flight: Mutex<()>,
    priority: Mutex<VecDeque<String>>,
}

impl Synchronizer {
    pub fn new(
        hosts: Arc<dyn HostDirectory>,
        cache: Arc<dyn InventoryCache>,
        executor: Arc<CommandExecutor>,
        events: Arc<dyn EventSink>,
        errors: Arc<LastErrorRegistry>,
    ) -> Self {
        Self {
            hosts,
            cache,
            executor,
            events,
            errors,
            busy: BusyFlag::new(),
            in_flight: Mutex::new(()),
            priority: Mutex::new(VecDeque::new()),
        }
    }

    /// The error recorded by the host's last failed sync, if it has not succeeded since
    #[must_use]
    pub fn last_error(&self, host_id: &str) -> Option<String> {
        self.errors.get(host_id)
    }

    #[must_use]
    pub fn errors(&self) -> &Arc<LastErrorRegistry> {
        &self.errors
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.is_busy()
    }

    /// Ask for `host_id` to be synced first on the next tick.
    pub async fn refresh_server(&self, host_id: &str) {
        let mut queue = self.priority.lock().await;
        if !queue.iter().any(|h| h == host_id) {
            queue.push_back(host_id.to_string());
        }
        debug!(host_id, "Priority refresh queued");
    }

    /// Host ids waiting for a priority refresh
    pub async fn pending_refreshes(&self) -> Vec<String> {
        self.priority.lock().await.iter().cloned().collect()
    }

    /// One pass over every enabled host. A tick while another is running is a no-op.
    pub async fn tick(&self) -> SyncSummary {
        let Some(_guard) = self.busy.try_enter() else {
            debug!("Sync tick skipped; previous tick still running");
            return SyncSummary {
                skipped: true,
                ..Default::default()
            };
        };

        let hosts = match self.hosts.list_hosts() {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(error = %e, "Could not list hosts; skipping sync tick");
                return SyncSummary::default();
            }
        };

        let priority: Vec<String> = self.priority.lock().await.drain(..).collect();
        let ordered = order_hosts(hosts, &priority);

        let mut summary = SyncSummary::default();
        for host in &ordered {
            match self.sync_host(host).await {
                Ok(()) => summary.synced += 1,
                Err(_) => summary.failed += 1,
            }
        }

        info!(
            synced = summary.synced,
            failed = summary.failed,
            "Sync tick complete"
        );
        summary
    }

    /// Sync a single host now, outside the tick.
    ///
    /// Waits for any host sync already in flight, so at most one runs at a time.
    ///
    /// # Errors
    ///
    /// [`RemoteError::UnknownHost`] for an unknown id, otherwise the host's sync error
    /// (which is also recorded as its last error).
    pub async fn sync_one(&self, host_id: &str) -> Result<(), RemoteError> {
        let host = self
            .hosts
            .get_host(host_id)?
            .ok_or_else(|| RemoteError::UnknownHost(host_id.to_string()))?;
        self.sync_host(&host).await
    }

    async fn sync_host(&self, host: &Host) -> Result<(), RemoteError> {
        let _slot = self.in_flight.lock().await;
        match self.refresh_host(host).await {
            Ok(()) => {
                self.errors.clear(&host.host_id);
                Ok(())
            }
            Err(e) => {
                warn!(host_id = %host.host_id, error = %e, "Host sync failed");
                self.errors.set(&host.host_id, e.to_string());
                Err(e)
            }
        }
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id))]
    async fn refresh_host(&self, host: &Host) -> Result<(), RemoteError> {
        let output = self
            .executor
            .run_on(host, commands::INVENTORY, RunOptions::default())
            .await?;

        let parsed = parse_inventory(&output.stdout);
        if let Some(reason) = parsed.degraded_reason() {
            warn!(reason, "Inventory output partially parsed");
        }

        let now = Utc::now();
        let previous: HashMap<String, InventoryRecord> = self
            .cache
            .query(&host.host_id)?
            .into_iter()
            .map(|r| (record_key(r.kind, &r.resource_id), r))
            .collect();

        let mut records = Vec::new();
        for container in parsed.into_value() {
            let payload = serde_json::to_value(&container)?;
            let updated_at = unchanged_since(&previous, RecordKind::Container, &container.id, &payload)
                .unwrap_or(now);
            records.push(InventoryRecord::container(
                &host.host_id,
                container.id,
                payload,
                updated_at,
            ));
        }

        self.cache.replace_host_records(&host.host_id, &records)?;
        self.events.publish(ChangeEvent::InventoryUpdated {
            host_id: host.host_id.clone(),
            containers: records.len(),
            at: now,
        });

        let facts = facts::collect(&self.executor, host).await;
        let payload = serde_json::to_value(&facts)?;
        let updated_at = unchanged_since(
            &previous,
            RecordKind::HostFacts,
            dw_store::HOST_FACTS_RESOURCE,
            &payload,
        )
        .unwrap_or(now);
        self.cache
            .upsert_host_facts(&host.host_id, &payload, updated_at)?;
        self.events.publish(ChangeEvent::FactsUpdated {
            host_id: host.host_id.clone(),
            at: now,
        });

        debug!(containers = records.len(), "Host synced");
        Ok(())
    }
}

fn record_key(kind: RecordKind, resource_id: &str) -> String {
    format!("{}/{resource_id}", kind.as_str())
}

/// Previous timestamp of a record whose payload has not changed
fn unchanged_since(
    previous: &HashMap<String, InventoryRecord>,
    kind: RecordKind,
    resource_id: &str,
    payload: &serde_json::Value,
) -> Option<DateTime<Utc>> {
    previous
        .get(&record_key(kind, resource_id))
        .filter(|prev| &prev.payload == payload)
        .map(|prev| prev.updated_at)
}

/// Enabled hosts in creation order, with priority refreshes moved to the front.
fn order_hosts(hosts: Vec<Host>, priority: &[String]) -> Vec<Host> {
    let (mut first, rest): (Vec<Host>, Vec<Host>) = hosts
        .into_iter()
        .filter(|h| h.enabled)
        .partition(|h| priority.contains(&h.host_id));
    first.sort_by_key(|h| priority.iter().position(|p| p == &h.host_id));
    first.extend(rest);
    first
}
