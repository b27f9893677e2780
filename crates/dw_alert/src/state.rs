//! Per-(owner, host, container) alert state
//!
//! Two independent tracks are kept: liveness (down/up with a resend cooldown)
//! and the no-auto-restart warning for running containers without a restart policy.

use crate::AlertKind;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

/// Identity of one watched container for one owner
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub owner: String,
    pub host_id: String,
    pub container: String,
}

impl AlertKey {
    pub fn new(
        owner: impl Into<String>,
        host_id: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            host_id: host_id.into(),
            container: container.into(),
        }
    }
}

/// What the monitor saw for a container on this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub running: bool,
    pub auto_restart: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Liveness {
    was_down: bool,
    last_alert_at: Option<DateTime<Utc>>,
}

/// In-memory alert state, created on first observation
#[derive(Debug, Default)]
pub struct AlertStateStore {
    liveness: DashMap<AlertKey, Liveness>,
    no_auto_restart: DashMap<AlertKey, DateTime<Utc>>,
}

fn cooled_down(last: Option<DateTime<Utc>>, now: DateTime<Utc>, cooldown: Duration) -> bool {
    match last {
        None => true,
        Some(last) => (now - last).to_std().is_ok_and(|elapsed| elapsed >= cooldown),
    }
}

impl AlertStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one observation and return the alerts that should be sent.
    ///
    /// State is updated whether or not delivery later succeeds.
    pub fn observe(
        &self,
        key: &AlertKey,
        observation: Observation,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Vec<AlertKind> {
        let mut alerts = Vec::new();

        {
            let mut state = self.liveness.entry(key.clone()).or_default();
            if observation.running {
                if state.was_down {
                    alerts.push(AlertKind::Up);
                    state.was_down = false;
                    state.last_alert_at = Some(now);
                }
            } else if !state.was_down || cooled_down(state.last_alert_at, now, cooldown) {
                alerts.push(AlertKind::Down);
                state.was_down = true;
                state.last_alert_at = Some(now);
            }
        }

        if observation.running && !observation.auto_restart {
            let due = self
                .no_auto_restart
                .get(key)
                .is_none_or(|last| cooled_down(Some(*last), now, cooldown));
            if due {
                alerts.push(AlertKind::NoAutoRestart);
                self.no_auto_restart.insert(key.clone(), now);
            }
        } else {
            self.no_auto_restart.remove(key);
        }

        alerts
    }

    /// Whether the container is currently considered down
    #[must_use]
    pub fn is_down(&self, key: &AlertKey) -> bool {
        self.liveness.get(key).is_some_and(|s| s.was_down)
    }

    /// Last liveness alert time
    #[must_use]
    pub fn last_alert_at(&self, key: &AlertKey) -> Option<DateTime<Utc>> {
        self.liveness.get(key).and_then(|s| s.last_alert_at)
    }

    /// Whether the no-auto-restart warning is active
    #[must_use]
    pub fn no_auto_restart_flagged(&self, key: &AlertKey) -> bool {
        self.no_auto_restart.contains_key(key)
    }

    /// Number of tracked containers
    #[must_use]
    pub fn len(&self) -> usize {
        self.liveness.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.liveness.is_empty()
    }
}
