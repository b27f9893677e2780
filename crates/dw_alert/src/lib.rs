//! `dw_alert` - Container liveness alerting for dockwatch
//!
//! This crate provides:
//! - Delivery channels (log, webhook, in-memory) and the notifier fan-out
//! - The alert-state store tracking per-(owner, host, container) liveness and cooldowns
//! - Inventory sources (the synchronizer's cache, or a live poll)
//! - The monitor loop turning inventory into debounced notifications

pub mod monitor;
pub mod notify;
pub mod source;
pub mod state;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use monitor::{AlertLog, Monitor, MonitorSummary};
pub use notify::{
    AlertChannel, Delivery, DeliveryResult, LogChannel, MemoryChannel, Notifier, NotifierSet,
    WebhookChannel, notifier_from_config,
};
pub use source::{CachedInventory, InventorySource, LiveInventory};
pub use state::{AlertKey, AlertStateStore, Observation};

/// Alert errors
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Inventory unavailable for {host}: {message}")]
    InventoryUnavailable { host: String, message: String },

    #[error("Remote error: {0}")]
    Remote(#[from] dw_remote::RemoteError),

    #[error("Store error: {0}")]
    StoreError(#[from] dw_store::StoreError),
}

/// Which condition an alert reports
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Down,
    Up,
    NoAutoRestart,
}

impl AlertKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Up => "up",
            Self::NoAutoRestart => "no_auto_restart",
        }
    }
}

/// A notification about one container, addressed to one recipient
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerAlert {
    pub kind: AlertKind,
    pub owner: String,
    pub recipient: String,
    pub host_id: String,
    pub host_name: String,
    pub container: String,
    pub image: String,
    pub status: String,
    pub at: DateTime<Utc>,
}

impl ContainerAlert {
    /// Human-readable summary
    #[must_use]
    pub fn message(&self) -> String {
        match self.kind {
            AlertKind::Down => format!(
                "Container {} on {} is down (status: {})",
                self.container, self.host_name, self.status
            ),
            AlertKind::Up => format!(
                "Container {} on {} is running again",
                self.container, self.host_name
            ),
            AlertKind::NoAutoRestart => format!(
                "Container {} on {} is running without an auto-restart policy",
                self.container, self.host_name
            ),
        }
    }
}
