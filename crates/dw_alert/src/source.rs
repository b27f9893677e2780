//! Where the monitor gets container state from

use crate::AlertError;
use async_trait::async_trait;
use dw_remote::commands;
use dw_remote::parse::parse_inventory;
use dw_remote::{CommandExecutor, ContainerInfo, LastErrorRegistry, RunOptions};
use dw_store::{Host, InventoryCache, RecordKind};
use std::sync::Arc;
use tracing::warn;

/// Supplies the current containers of one host
#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn containers(&self, host: &Host) -> Result<Vec<ContainerInfo>, AlertError>;
}

/// Reads the synchronizer's cache.
///
/// A host whose last sync failed is reported as unavailable so stale
/// records never drive alerts.
pub struct CachedInventory {
    cache: Arc<dyn InventoryCache>,
    errors: Option<Arc<LastErrorRegistry>>,
}

impl CachedInventory {
    pub fn new(cache: Arc<dyn InventoryCache>) -> Self {
        Self {
            cache,
            errors: None,
        }
    }

    #[must_use]
    pub fn with_sync_errors(mut self, errors: Arc<LastErrorRegistry>) -> Self {
        self.errors = Some(errors);
        self
    }
}

#[async_trait]
impl InventorySource for CachedInventory {
    async fn containers(&self, host: &Host) -> Result<Vec<ContainerInfo>, AlertError> {
        if let Some(message) = self.errors.as_ref().and_then(|e| e.get(&host.host_id)) {
            return Err(AlertError::InventoryUnavailable {
                host: host.host_id.clone(),
                message,
            });
        }

        let records = self.cache.query(&host.host_id)?;
        let mut containers = Vec::with_capacity(records.len());
        for record in records {
            if record.kind != RecordKind::Container {
                continue;
            }
            match serde_json::from_value::<ContainerInfo>(record.payload) {
                Ok(info) => containers.push(info),
                Err(e) => warn!(
                    host_id = %host.host_id,
                    resource_id = %record.resource_id,
                    error = %e,
                    "Skipping unreadable container record"
                ),
            }
        }
        Ok(containers)
    }
}

/// Polls the host directly on every call
pub struct LiveInventory {
    executor: Arc<CommandExecutor>,
}

impl LiveInventory {
    pub fn new(executor: Arc<CommandExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl InventorySource for LiveInventory {
    async fn containers(&self, host: &Host) -> Result<Vec<ContainerInfo>, AlertError> {
        let output = self
            .executor
            .run_on(host, commands::INVENTORY, RunOptions::default())
            .await?;
        let parsed = parse_inventory(&output.stdout);
        if let Some(reason) = parsed.degraded_reason() {
            warn!(host_id = %host.host_id, reason, "Inventory output degraded");
        }
        Ok(parsed.into_value())
    }
}
