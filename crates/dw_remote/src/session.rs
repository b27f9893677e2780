//! Session registry: at most one live session per host
//!
//! A fresh acquisition walks an ordered candidate list (overlay first when it
//! differs from the primary address) and stops at the first address that
//! dials. Only connection errors move on to the next candidate.

use crate::credentials::CredentialResolver;
use crate::transport::{Connection, DialTarget, Transport};
use crate::RemoteError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dw_config::SshConfig;
use dw_store::Host;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};

/// Dial policy for the registry
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on each dial attempt
    pub connect_timeout: Duration,
    /// Extra candidates tried after the first fails
    pub max_fallbacks: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_fallbacks: 1,
        }
    }
}

impl From<&SshConfig> for SessionConfig {
    fn from(config: &SshConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            max_fallbacks: config.max_fallbacks,
        }
    }
}

/// A live connection to one host
pub struct Session {
    id: u64,
    host_id: String,
    address: String,
    connected_at: DateTime<Utc>,
    connection: Arc<dyn Connection>,
}

impl Session {
    /// Registry-unique id; a reconnect always yields a new id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// The address this session actually dialled
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.connection.is_closed()
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("host_id", &self.host_id)
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Observable session lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Connected {
        host_id: String,
        address: String,
        session_id: u64,
    },
    Fallback {
        host_id: String,
        failed_address: String,
        next_address: String,
        reason: String,
    },
    Disconnected {
        host_id: String,
        session_id: u64,
    },
    Invalidated {
        host_id: String,
        session_id: u64,
    },
}

/// Pool statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub active_sessions: usize,
    /// (host id, address in use) for every live session
    pub hosts: Vec<(String, String)>,
}

type Slot = Arc<Mutex<Option<Arc<Session>>>>;

/// Owns every host session
pub struct SessionRegistry {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialResolver>,
    config: SessionConfig,
    slots: DashMap<String, Slot>,
    next_id: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Ordered dial candidates for a host: overlay first, then primary, capped by `max_fallbacks`.
#[must_use]
pub fn dial_candidates(host: &Host, max_fallbacks: usize) -> Vec<String> {
    let mut candidates = Vec::with_capacity(2);
    if let Some(overlay) = host
        .overlay_address
        .as_deref()
        .map(str::trim)
        .filter(|o| !o.is_empty() && *o != host.address)
    {
        candidates.push(overlay.to_string());
    }
    candidates.push(host.address.clone());
    candidates.truncate(max_fallbacks.saturating_add(1));
    candidates
}

impl SessionRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialResolver>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            transport,
            credentials,
            config,
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Receive connection lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn slot(&self, host_id: &str) -> Slot {
        self.slots
            .entry(host_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn emit(&self, event: ConnectionEvent) {
        match &event {
            ConnectionEvent::Connected {
                host_id,
                address,
                session_id,
            } => info!(host_id = %host_id, address = %address, session_id, "Session connected"),
            ConnectionEvent::Fallback {
                host_id,
                failed_address,
                next_address,
                reason,
            } => warn!(
                host_id = %host_id,
                failed = %failed_address,
                next = %next_address,
                reason = %reason,
                "Falling back to next address"
            ),
            ConnectionEvent::Disconnected {
                host_id,
                session_id,
            } => info!(host_id = %host_id, session_id, "Session disconnected"),
            ConnectionEvent::Invalidated {
                host_id,
                session_id,
            } => warn!(host_id = %host_id, session_id, "Session invalidated"),
        }
        let _ = self.events.send(event);
    }

    /// Return the host's connected session, dialling a new one if needed.
    ///
    /// # Errors
    ///
    /// [`RemoteError::Connection`] when every candidate fails, or
    /// [`RemoteError::Credential`] when no key can be resolved.
    #[instrument(skip(self, host), fields(host_id = %host.host_id))]
    pub async fn acquire(&self, host: &Host) -> Result<Arc<Session>, RemoteError> {
        let slot = self.slot(&host.host_id);
        let mut current = slot.lock().await;

        if let Some(session) = current.as_ref() {
            if session.is_connected() {
                return Ok(Arc::clone(session));
            }
            let session_id = session.id;
            *current = None;
            self.emit(ConnectionEvent::Disconnected {
                host_id: host.host_id.clone(),
                session_id,
            });
        }

        let session = Arc::new(self.dial(host).await?);
        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn dial(&self, host: &Host) -> Result<Session, RemoteError> {
        let credential = self.credentials.private_key(host)?;
        let candidates = dial_candidates(host, self.config.max_fallbacks);
        let mut last_error = String::from("no address to dial");

        for (index, address) in candidates.iter().enumerate() {
            if index > 0 {
                self.emit(ConnectionEvent::Fallback {
                    host_id: host.host_id.clone(),
                    failed_address: candidates[index - 1].clone(),
                    next_address: address.clone(),
                    reason: last_error.clone(),
                });
            }

            let target = DialTarget {
                host_id: host.host_id.clone(),
                address: address.clone(),
                port: host.port,
                user: host.user.clone(),
            };

            debug!(address = %address, attempt = index + 1, "Dialling");
            let attempt = tokio::time::timeout(
                self.config.connect_timeout,
                self.transport.dial(&target, &credential),
            )
            .await;

            match attempt {
                Ok(Ok(connection)) => {
                    let session = Session {
                        id: self.next_id.fetch_add(1, Ordering::Relaxed),
                        host_id: host.host_id.clone(),
                        address: address.clone(),
                        connected_at: Utc::now(),
                        connection,
                    };
                    self.emit(ConnectionEvent::Connected {
                        host_id: host.host_id.clone(),
                        address: address.clone(),
                        session_id: session.id,
                    });
                    return Ok(session);
                }
                Ok(Err(RemoteError::Connection { message, .. })) => last_error = message,
                Ok(Err(other)) => return Err(other),
                Err(_) => {
                    last_error = format!(
                        "{address}: connect timed out after {:?}",
                        self.config.connect_timeout
                    );
                }
            }
        }

        Err(RemoteError::Connection {
            host: host.host_id.clone(),
            message: last_error,
        })
    }

    async fn take(&self, host_id: &str) -> Option<Arc<Session>> {
        let slot = self.slots.get(host_id).map(|s| Arc::clone(s.value()))?;
        let mut current = slot.lock().await;
        current.take()
    }

    /// Close and forget the host's session.
    pub async fn release(&self, host_id: &str) {
        if let Some(session) = self.take(host_id).await {
            session.connection.disconnect().await;
            self.emit(ConnectionEvent::Disconnected {
                host_id: host_id.to_string(),
                session_id: session.id,
            });
        }
    }

    /// Forcibly close and forget the host's session so the next acquisition redials.
    pub async fn invalidate(&self, host_id: &str) {
        if let Some(session) = self.take(host_id).await {
            session.connection.disconnect().await;
            self.emit(ConnectionEvent::Invalidated {
                host_id: host_id.to_string(),
                session_id: session.id,
            });
        }
    }

    /// Close every session
    pub async fn close_all(&self) {
        let host_ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for host_id in host_ids {
            self.release(&host_id).await;
        }
    }

    /// Get pool statistics
    pub async fn pool_stats(&self) -> PoolStats {
        let slots: Vec<Slot> = self.slots.iter().map(|e| Arc::clone(e.value())).collect();
        let mut stats = PoolStats::default();
        for slot in slots {
            if let Some(session) = slot.lock().await.as_ref()
                && session.is_connected()
            {
                stats
                    .hosts
                    .push((session.host_id.clone(), session.address.clone()));
            }
        }
        stats.hosts.sort();
        stats.active_sessions = stats.hosts.len();
        stats
    }
}
