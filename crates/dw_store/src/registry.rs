//! Host seeding from configuration

use crate::{DwStore, Host, HostDirectory, StoreError};
use chrono::Utc;
use dw_config::{DwConfig, HostConfig};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Keeps the `hosts` table in line with the configured host inventory.
pub struct HostRegistry {
    store: Arc<DwStore>,
}

impl HostRegistry {
    pub fn new(store: Arc<DwStore>) -> Self {
        Self { store }
    }

    /// Upsert every configured host and disable stored hosts no longer in the config.
    ///
    /// Returns the number of configured hosts.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any read or write fails.
    pub fn load_from_config(&self, config: &DwConfig) -> Result<usize, StoreError> {
        let configured: HashSet<&str> = config.hosts.keys().map(String::as_str).collect();

        for (id, host) in &config.hosts {
            self.store.upsert_host(&host_from_config(id, host))?;
            debug!(host_id = %id, "Seeded host");
        }

        for stale in self.store.list_hosts()? {
            if stale.enabled && !configured.contains(stale.host_id.as_str()) {
                info!(host_id = %stale.host_id, "Disabling host removed from config");
                self.store.set_host_enabled(&stale.host_id, false)?;
            }
        }

        Ok(config.hosts.len())
    }

    /// Enabled hosts in creation order
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn enabled_hosts(&self) -> Result<Vec<Host>, StoreError> {
        Ok(self
            .store
            .list_hosts()?
            .into_iter()
            .filter(|h| h.enabled)
            .collect())
    }
}

fn host_from_config(id: &str, config: &HostConfig) -> Host {
    Host {
        host_id: id.to_string(),
        name: config.name.clone(),
        address: config.address.clone(),
        overlay_address: config
            .overlay_address
            .clone()
            .filter(|addr| !addr.trim().is_empty()),
        port: config.port,
        user: config.user.clone(),
        credential_ref: config.credential.clone(),
        enabled: config.enabled,
        created_at: Utc::now(),
    }
}
