//! `dw_store` - `DuckDB` storage layer for dockwatch
//!
//! This crate provides:
//! - `DuckDB` connection management and schema migrations
//! - The host directory read by the engine loops
//! - The inventory cache (atomic per-host replace)
//! - The job store and job run history
//! - The alert delivery log

use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::Connection;
use dw_config::Schedule;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub mod migrations;
pub mod registry;
pub mod schema;

pub use registry::HostRegistry;
pub use schema::HOST_FACTS_RESOURCE;

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] duckdb::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

// ============================================================================
// Models
// ============================================================================

/// A managed remote host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Host {
    pub host_id: String,
    pub name: Option<String>,
    /// Primary address
    pub address: String,
    /// Private overlay address, preferred when present
    pub overlay_address: Option<String>,
    pub port: u16,
    pub user: String,
    /// Opaque reference handed to the credential resolver
    pub credential_ref: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Host {
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.host_id)
    }
}

/// What an inventory row describes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Container,
    HostFacts,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::HostFacts => "host_facts",
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "container" => Ok(Self::Container),
            "host_facts" => Ok(Self::HostFacts),
            other => Err(format!("unknown record kind: {other}")),
        }
    }
}

/// A cached mirror of one remote resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryRecord {
    pub host_id: String,
    pub resource_id: String,
    pub kind: RecordKind,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl InventoryRecord {
    pub fn container(
        host_id: impl Into<String>,
        resource_id: impl Into<String>,
        payload: serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            resource_id: resource_id.into(),
            kind: RecordKind::Container,
            payload,
            updated_at,
        }
    }
}

/// A container a job snapshots
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobTarget {
    pub host_id: String,
    pub container: String,
}

/// A recurring snapshot job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledJob {
    pub job_id: String,
    pub owner: String,
    pub schedule: Schedule,
    pub retention: u32,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub targets: Vec<JobTarget>,
}

impl ScheduledJob {
    /// Whether the job should run at `now`
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_none_or(|next| next <= now)
    }
}

/// Fields to change on a job; `None` leaves the column untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub enabled: Option<bool>,
}

/// Outcome of one job target execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Success,
    Failure,
}

impl JobRunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl std::str::FromStr for JobRunStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(format!("unknown job run status: {other}")),
        }
    }
}

/// History row for one job target execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRun {
    pub run_id: String,
    pub job_id: String,
    pub host_id: String,
    pub container: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: JobRunStatus,
    pub snapshot: Option<String>,
    pub pruned: u32,
    pub error: Option<String>,
}

/// One alert delivery attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertLogEntry {
    pub sent_at: DateTime<Utc>,
    pub owner: String,
    pub host_id: String,
    pub container: String,
    pub kind: String,
    pub recipient: String,
    pub success: bool,
    pub error: Option<String>,
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// Read-only view of the managed hosts
pub trait HostDirectory: Send + Sync {
    /// Hosts in creation order.
    fn list_hosts(&self) -> Result<Vec<Host>, StoreError>;

    fn get_host(&self, host_id: &str) -> Result<Option<Host>, StoreError>;
}

/// Local mirror of remote inventory
pub trait InventoryCache: Send + Sync {
    /// Replace every container record of `host_id` with `records` as one unit.
    fn replace_host_records(
        &self,
        host_id: &str,
        records: &[InventoryRecord],
    ) -> Result<(), StoreError>;

    fn upsert_host_facts(
        &self,
        host_id: &str,
        facts: &serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn query(&self, host_id: &str) -> Result<Vec<InventoryRecord>, StoreError>;
}

/// Persistence for scheduled jobs
pub trait JobStore: Send + Sync {
    fn find_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError>;

    fn update_job(&self, job_id: &str, update: &JobUpdate) -> Result<(), StoreError>;

    fn record_job_run(&self, run: &JobRun) -> Result<(), StoreError>;
}

// ============================================================================
// Timestamp helpers
// ============================================================================

/// Fixed-width RFC 3339 so lexicographic order matches chronological order.
#[must_use]
pub fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn ts_from_sql(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::QueryError(format!("Invalid timestamp '{raw}': {e}")))
}

fn opt_ts_from_sql(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(ts_from_sql).transpose()
}

// ============================================================================
// Store
// ============================================================================

/// Main storage handle
pub struct DwStore {
    conn: Arc<Mutex<Connection>>,
    db_path: String,
}

impl DwStore {
    /// Open or create database at path
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if directory creation, database opening, pragma setup, or
    /// migration execution fails.
    #[instrument]
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!(path = %path.display(), "Opening DuckDB database");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            r"
            PRAGMA threads=2;
            PRAGMA memory_limit='256MB';
        ",
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_string_lossy().to_string(),
        };

        store.run_migrations()?;

        Ok(store)
    }

    /// Open in-memory database (for testing)
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if in-memory database setup or migrations fail.
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: ":memory:".to_string(),
        };

        store.run_migrations()?;

        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        migrations::run_all(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Get database path
    #[must_use]
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// Current schema version
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the migrations table cannot be read.
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let version = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    // ------------------------------------------------------------------------
    // Hosts
    // ------------------------------------------------------------------------

    /// Insert a host or update its connection fields.
    ///
    /// Existing hosts keep their creation order and timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the upsert fails.
    pub fn upsert_host(&self, host: &Host) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM hosts WHERE host_id = ?",
            duckdb::params![host.host_id],
            |row| row.get(0),
        )?;

        if exists > 0 {
            tx.execute(
                r"
                UPDATE hosts SET name = ?, address = ?, overlay_address = ?, port = ?,
                    ssh_user = ?, credential_ref = ?, enabled = ?
                WHERE host_id = ?
                ",
                duckdb::params![
                    host.name,
                    host.address,
                    host.overlay_address,
                    i32::from(host.port),
                    host.user,
                    host.credential_ref,
                    host.enabled,
                    host.host_id,
                ],
            )?;
        } else {
            tx.execute(
                r"
                INSERT INTO hosts (host_id, seq, name, address, overlay_address, port,
                    ssh_user, credential_ref, enabled, created_at)
                VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM hosts), ?, ?, ?, ?, ?, ?, ?, ?)
                ",
                duckdb::params![
                    host.host_id,
                    host.name,
                    host.address,
                    host.overlay_address,
                    i32::from(host.port),
                    host.user,
                    host.credential_ref,
                    host.enabled,
                    ts_to_sql(&host.created_at),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Enable or disable a host
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    pub fn set_host_enabled(&self, host_id: &str, enabled: bool) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE hosts SET enabled = ? WHERE host_id = ?",
            duckdb::params![enabled, host_id],
        )?;
        Ok(())
    }

    fn select_hosts(
        &self,
        where_clause: &str,
        params: &[&dyn duckdb::ToSql],
    ) -> Result<Vec<Host>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT host_id, name, address, overlay_address, port, ssh_user, credential_ref, \
             enabled, created_at FROM hosts {where_clause} ORDER BY seq, host_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i32>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, bool>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut hosts = Vec::new();
        for row in rows {
            let (host_id, name, address, overlay_address, port, user, credential_ref, enabled, created_at) =
                row?;
            hosts.push(Host {
                host_id,
                name,
                address,
                overlay_address,
                port: u16::try_from(port)
                    .map_err(|_| StoreError::QueryError(format!("Invalid port {port}")))?,
                user,
                credential_ref,
                enabled,
                created_at: ts_from_sql(&created_at)?,
            });
        }
        Ok(hosts)
    }

    // ------------------------------------------------------------------------
    // Inventory
    // ------------------------------------------------------------------------

    /// Container records only, for one host
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn query_containers(&self, host_id: &str) -> Result<Vec<InventoryRecord>, StoreError> {
        Ok(self
            .query(host_id)?
            .into_iter()
            .filter(|r| r.kind == RecordKind::Container)
            .collect())
    }

    /// The host-facts record for one host, if it has been collected
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub fn host_facts(&self, host_id: &str) -> Result<Option<InventoryRecord>, StoreError> {
        Ok(self
            .query(host_id)?
            .into_iter()
            .find(|r| r.kind == RecordKind::HostFacts))
    }

    // ------------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------------

    /// Insert or replace a job definition and its targets.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if serialization or any statement fails.
    pub fn upsert_job(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        let schedule_json = serde_json::to_string(&job.schedule)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            r"
            INSERT OR REPLACE INTO jobs (job_id, owner, schedule_json, retention, enabled,
                last_run_at, next_run_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?,
                COALESCE((SELECT created_at FROM jobs WHERE job_id = ?), ?))
            ",
            duckdb::params![
                job.job_id,
                job.owner,
                schedule_json,
                i64::from(job.retention),
                job.enabled,
                job.last_run_at.as_ref().map(ts_to_sql),
                job.next_run_at.as_ref().map(ts_to_sql),
                job.job_id,
                ts_to_sql(&Utc::now()),
            ],
        )?;

        tx.execute(
            "DELETE FROM job_targets WHERE job_id = ?",
            duckdb::params![job.job_id],
        )?;
        for (ordinal, target) in job.targets.iter().enumerate() {
            tx.execute(
                "INSERT INTO job_targets (job_id, ordinal, host_id, container) VALUES (?, ?, ?, ?)",
                duckdb::params![
                    job.job_id,
                    i64::try_from(ordinal).unwrap_or(i64::MAX),
                    target.host_id,
                    target.container,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Fetch one job
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row cannot be decoded.
    pub fn get_job(&self, job_id: &str) -> Result<Option<ScheduledJob>, StoreError> {
        Ok(self
            .select_jobs("WHERE job_id = ?", &[&job_id])?
            .into_iter()
            .next())
    }

    /// All jobs ordered by id
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row cannot be decoded.
    pub fn list_jobs(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        self.select_jobs("", &[])
    }

    fn select_jobs(
        &self,
        where_clause: &str,
        params: &[&dyn duckdb::ToSql],
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT job_id, owner, schedule_json, retention, enabled, last_run_at, next_run_at \
             FROM jobs {where_clause} ORDER BY job_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut jobs = Vec::new();
        for row in rows {
            let (job_id, owner, schedule_json, retention, enabled, last_run_at, next_run_at) = row?;
            jobs.push(ScheduledJob {
                job_id,
                owner,
                schedule: serde_json::from_str(&schedule_json)?,
                retention: u32::try_from(retention).unwrap_or(1).max(1),
                enabled,
                last_run_at: opt_ts_from_sql(last_run_at)?,
                next_run_at: opt_ts_from_sql(next_run_at)?,
                targets: Vec::new(),
            });
        }

        let mut target_stmt = conn.prepare(
            "SELECT host_id, container FROM job_targets WHERE job_id = ? ORDER BY ordinal",
        )?;
        for job in &mut jobs {
            let targets = target_stmt.query_map(duckdb::params![job.job_id], |row| {
                Ok(JobTarget {
                    host_id: row.get(0)?,
                    container: row.get(1)?,
                })
            })?;
            for target in targets {
                job.targets.push(target?);
            }
        }

        Ok(jobs)
    }

    /// Most recent runs of a job, newest first
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row cannot be decoded.
    pub fn list_job_runs(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r"
            SELECT run_id, job_id, host_id, container, started_at, finished_at, status,
                snapshot, pruned, error
            FROM job_runs WHERE job_id = ?
            ORDER BY started_at DESC, run_id
            LIMIT ?
            ",
        )?;
        let rows = stmt.query_map(
            duckdb::params![job_id, i64::try_from(limit).unwrap_or(i64::MAX)],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            },
        )?;

        let mut runs = Vec::new();
        for row in rows {
            let (run_id, job_id, host_id, container, started, finished, status, snapshot, pruned, error) =
                row?;
            runs.push(JobRun {
                run_id,
                job_id,
                host_id,
                container,
                started_at: ts_from_sql(&started)?,
                finished_at: ts_from_sql(&finished)?,
                status: status.parse().map_err(StoreError::QueryError)?,
                snapshot,
                pruned: u32::try_from(pruned).unwrap_or(0),
                error,
            });
        }
        Ok(runs)
    }

    // ------------------------------------------------------------------------
    // Alert log
    // ------------------------------------------------------------------------

    /// Record one alert delivery attempt
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    pub fn record_alert(&self, entry: &AlertLogEntry) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            r"
            INSERT INTO alert_log (sent_at, owner, host_id, container, kind, recipient, success, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
            duckdb::params![
                ts_to_sql(&entry.sent_at),
                entry.owner,
                entry.host_id,
                entry.container,
                entry.kind,
                entry.recipient,
                entry.success,
                entry.error,
            ],
        )?;
        Ok(())
    }

    /// Most recent alert attempts, newest first
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row cannot be decoded.
    pub fn list_alerts(&self, limit: usize) -> Result<Vec<AlertLogEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r"
            SELECT sent_at, owner, host_id, container, kind, recipient, success, error
            FROM alert_log ORDER BY sent_at DESC LIMIT ?
            ",
        )?;
        let rows = stmt.query_map(
            duckdb::params![i64::try_from(limit).unwrap_or(i64::MAX)],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            },
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (sent_at, owner, host_id, container, kind, recipient, success, error) = row?;
            entries.push(AlertLogEntry {
                sent_at: ts_from_sql(&sent_at)?,
                owner,
                host_id,
                container,
                kind,
                recipient,
                success,
                error,
            });
        }
        Ok(entries)
    }
}

impl HostDirectory for DwStore {
    fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        self.select_hosts("", &[])
    }

    fn get_host(&self, host_id: &str) -> Result<Option<Host>, StoreError> {
        Ok(self
            .select_hosts("WHERE host_id = ?", &[&host_id])?
            .into_iter()
            .next())
    }
}

impl InventoryCache for DwStore {
    #[instrument(skip(self, records), fields(count = records.len()))]
    fn replace_host_records(
        &self,
        host_id: &str,
        records: &[InventoryRecord],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM inventory_records WHERE host_id = ? AND kind = ?",
            duckdb::params![host_id, RecordKind::Container.as_str()],
        )?;

        for record in records {
            if record.host_id != host_id {
                return Err(StoreError::QueryError(format!(
                    "Record for host '{}' passed to replace of '{host_id}'",
                    record.host_id
                )));
            }
            tx.execute(
                r"
                INSERT OR REPLACE INTO inventory_records (host_id, resource_id, kind, payload_json, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ",
                duckdb::params![
                    host_id,
                    record.resource_id,
                    record.kind.as_str(),
                    serde_json::to_string(&record.payload)?,
                    ts_to_sql(&record.updated_at),
                ],
            )?;
        }

        tx.commit()?;
        debug!("Replaced inventory records");
        Ok(())
    }

    fn upsert_host_facts(
        &self,
        host_id: &str,
        facts: &serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            r"
            INSERT OR REPLACE INTO inventory_records (host_id, resource_id, kind, payload_json, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ",
            duckdb::params![
                host_id,
                HOST_FACTS_RESOURCE,
                RecordKind::HostFacts.as_str(),
                serde_json::to_string(facts)?,
                ts_to_sql(&updated_at),
            ],
        )?;
        Ok(())
    }

    fn query(&self, host_id: &str) -> Result<Vec<InventoryRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r"
            SELECT host_id, resource_id, kind, payload_json, updated_at
            FROM inventory_records WHERE host_id = ?
            ORDER BY kind, resource_id
            ",
        )?;
        let rows = stmt.query_map(duckdb::params![host_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (host_id, resource_id, kind, payload, updated_at) = row?;
            records.push(InventoryRecord {
                host_id,
                resource_id,
                kind: kind.parse().map_err(StoreError::QueryError)?,
                payload: serde_json::from_str(&payload)?,
                updated_at: ts_from_sql(&updated_at)?,
            });
        }
        Ok(records)
    }
}

impl JobStore for DwStore {
    fn find_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError> {
        let now = ts_to_sql(&now);
        self.select_jobs(
            "WHERE enabled AND (next_run_at IS NULL OR next_run_at <= ?)",
            &[&now],
        )
    }

    fn update_job(&self, job_id: &str, update: &JobUpdate) -> Result<(), StoreError> {
        let conn = self.lock()?;
        if let Some(last) = &update.last_run_at {
            conn.execute(
                "UPDATE jobs SET last_run_at = ? WHERE job_id = ?",
                duckdb::params![ts_to_sql(last), job_id],
            )?;
        }
        if let Some(next) = &update.next_run_at {
            conn.execute(
                "UPDATE jobs SET next_run_at = ? WHERE job_id = ?",
                duckdb::params![ts_to_sql(next), job_id],
            )?;
        }
        if let Some(enabled) = update.enabled {
            conn.execute(
                "UPDATE jobs SET enabled = ? WHERE job_id = ?",
                duckdb::params![enabled, job_id],
            )?;
        }
        Ok(())
    }

    fn record_job_run(&self, run: &JobRun) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            r"
            INSERT INTO job_runs (run_id, job_id, host_id, container, started_at, finished_at,
                status, snapshot, pruned, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
            duckdb::params![
                run.run_id,
                run.job_id,
                run.host_id,
                run.container,
                ts_to_sql(&run.started_at),
                ts_to_sql(&run.finished_at),
                run.status.as_str(),
                run.snapshot,
                i64::from(run.pruned),
                run.error,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn host(id: &str) -> Host {
        Host {
            host_id: id.to_string(),
            name: None,
            address: format!("{id}.example.com"),
            overlay_address: None,
            port: 22,
            user: "deploy".to_string(),
            credential_ref: None,
            enabled: true,
            created_at: at(0, 0),
        }
    }

    fn record(host_id: &str, id: &str, state: &str) -> InventoryRecord {
        InventoryRecord::container(
            host_id,
            id,
            serde_json::json!({ "name": id, "state": state }),
            at(1, 0),
        )
    }

    fn job(id: &str, next: Option<DateTime<Utc>>) -> ScheduledJob {
        ScheduledJob {
            job_id: id.to_string(),
            owner: "ops".to_string(),
            schedule: Schedule::Daily { hour: 2, minute: 0 },
            retention: 5,
            enabled: true,
            last_run_at: None,
            next_run_at: next,
            targets: vec![
                JobTarget {
                    host_id: "web-1".to_string(),
                    container: "postgres".to_string(),
                },
                JobTarget {
                    host_id: "web-1".to_string(),
                    container: "redis".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_open_memory_runs_migrations() {
        let store = DwStore::open_memory().unwrap();
        assert_eq!(store.db_path(), ":memory:");
        assert_eq!(
            store.schema_version().unwrap(),
            i64::from(migrations::latest_version())
        );
    }

    #[test]
    fn test_all_tables_exist() {
        let store = DwStore::open_memory().unwrap();
        let conn = store.lock().unwrap();
        for table in schema::tables::ALL {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
                    duckdb::params![table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn test_open_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dw.duckdb");
        let store = DwStore::open(&path).unwrap();
        assert!(path.exists());
        assert!(store.list_hosts().unwrap().is_empty());
    }

    #[test]
    fn test_hosts_keep_creation_order() {
        let store = DwStore::open_memory().unwrap();
        store.upsert_host(&host("zeta")).unwrap();
        store.upsert_host(&host("alpha")).unwrap();

        let mut updated = host("zeta");
        updated.overlay_address = Some("100.64.0.9".to_string());
        store.upsert_host(&updated).unwrap();

        let hosts = store.list_hosts().unwrap();
        let ids: Vec<_> = hosts.iter().map(|h| h.host_id.as_str()).collect();
        assert_eq!(ids, vec!["zeta", "alpha"]);
        assert_eq!(hosts[0].overlay_address.as_deref(), Some("100.64.0.9"));

        assert!(store.get_host("alpha").unwrap().is_some());
        assert!(store.get_host("missing").unwrap().is_none());
    }

    #[test]
    fn test_replace_host_records_is_per_host() {
        let store = DwStore::open_memory().unwrap();
        store
            .replace_host_records("a", &[record("a", "c1", "running"), record("a", "c2", "exited")])
            .unwrap();
        store
            .replace_host_records("b", &[record("b", "c9", "running")])
            .unwrap();

        store
            .replace_host_records("a", &[record("a", "c3", "running")])
            .unwrap();

        let a = store.query("a").unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].resource_id, "c3");
        assert_eq!(store.query("b").unwrap().len(), 1);
    }

    #[test]
    fn test_replace_keeps_host_facts() {
        let store = DwStore::open_memory().unwrap();
        store
            .upsert_host_facts("a", &serde_json::json!({ "cpu_cores": 4 }), at(1, 0))
            .unwrap();
        store
            .replace_host_records("a", &[record("a", "c1", "running")])
            .unwrap();
        store.replace_host_records("a", &[]).unwrap();

        let records = store.query("a").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordKind::HostFacts);
        assert_eq!(records[0].resource_id, HOST_FACTS_RESOURCE);
        assert!(store.query_containers("a").unwrap().is_empty());
        assert_eq!(
            store.host_facts("a").unwrap().unwrap().payload["cpu_cores"],
            4
        );
    }

    #[test]
    fn test_replace_rejects_foreign_record_atomically() {
        let store = DwStore::open_memory().unwrap();
        store
            .replace_host_records("a", &[record("a", "c1", "running")])
            .unwrap();

        let result = store.replace_host_records("a", &[record("a", "c2", "running"), record("b", "x", "running")]);
        assert!(result.is_err());

        let records = store.query("a").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].resource_id, "c1");
    }

    #[test]
    fn test_record_round_trip_preserves_payload() {
        let store = DwStore::open_memory().unwrap();
        let rec = record("a", "c1", "running");
        store.replace_host_records("a", &[rec.clone()]).unwrap();
        assert_eq!(store.query("a").unwrap(), vec![rec]);
    }

    #[test]
    fn test_job_upsert_and_targets_order() {
        let store = DwStore::open_memory().unwrap();
        store.upsert_job(&job("nightly", None)).unwrap();

        let loaded = store.get_job("nightly").unwrap().unwrap();
        assert_eq!(loaded.targets.len(), 2);
        assert_eq!(loaded.targets[0].container, "postgres");
        assert_eq!(loaded.targets[1].container, "redis");
        assert_eq!(loaded.schedule, Schedule::Daily { hour: 2, minute: 0 });

        let mut changed = job("nightly", None);
        changed.targets.truncate(1);
        store.upsert_job(&changed).unwrap();
        assert_eq!(store.get_job("nightly").unwrap().unwrap().targets.len(), 1);
        assert_eq!(store.list_jobs().unwrap().len(), 1);
    }

    #[test]
    fn test_find_due_jobs() {
        let store = DwStore::open_memory().unwrap();
        store.upsert_job(&job("never-run", None)).unwrap();
        store.upsert_job(&job("past", Some(at(1, 0)))).unwrap();
        store.upsert_job(&job("exact", Some(at(2, 0)))).unwrap();
        store.upsert_job(&job("future", Some(at(3, 0)))).unwrap();
        let mut disabled = job("disabled", Some(at(1, 0)));
        disabled.enabled = false;
        store.upsert_job(&disabled).unwrap();

        let due: Vec<_> = store
            .find_due_jobs(at(2, 0))
            .unwrap()
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        assert_eq!(due, vec!["exact", "never-run", "past"]);
    }

    #[test]
    fn test_update_job_fields() {
        let store = DwStore::open_memory().unwrap();
        store.upsert_job(&job("nightly", None)).unwrap();

        store
            .update_job(
                "nightly",
                &JobUpdate {
                    last_run_at: Some(at(2, 0)),
                    next_run_at: Some(at(3, 0)),
                    enabled: None,
                },
            )
            .unwrap();

        let loaded = store.get_job("nightly").unwrap().unwrap();
        assert_eq!(loaded.last_run_at, Some(at(2, 0)));
        assert_eq!(loaded.next_run_at, Some(at(3, 0)));
        assert!(loaded.enabled);
        assert!(!loaded.is_due(at(2, 30)));
        assert!(loaded.is_due(at(3, 0)));
    }

    #[test]
    fn test_job_runs_history() {
        let store = DwStore::open_memory().unwrap();
        for (i, status) in [JobRunStatus::Success, JobRunStatus::Failure].iter().enumerate() {
            store
                .record_job_run(&JobRun {
                    run_id: format!("run-{i}"),
                    job_id: "nightly".to_string(),
                    host_id: "web-1".to_string(),
                    container: "postgres".to_string(),
                    started_at: at(2, u32::try_from(i).unwrap()),
                    finished_at: at(2, u32::try_from(i).unwrap()),
                    status: *status,
                    snapshot: None,
                    pruned: 0,
                    error: None,
                })
                .unwrap();
        }

        let runs = store.list_job_runs("nightly", 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "run-1");
        assert_eq!(runs[0].status, JobRunStatus::Failure);
    }

    #[test]
    fn test_alert_log() {
        let store = DwStore::open_memory().unwrap();
        store
            .record_alert(&AlertLogEntry {
                sent_at: at(4, 0),
                owner: "ops".to_string(),
                host_id: "web-1".to_string(),
                container: "api".to_string(),
                kind: "down".to_string(),
                recipient: "ops@example.com".to_string(),
                success: false,
                error: Some("smtp unavailable".to_string()),
            })
            .unwrap();

        let alerts = store.list_alerts(5).unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(!alerts[0].success);
        assert_eq!(alerts[0].kind, "down");
    }

    #[test]
    fn test_ts_to_sql_is_fixed_width() {
        let a = ts_to_sql(&at(2, 0));
        assert_eq!(a, "2024-01-01T02:00:00.000Z");
        assert_eq!(ts_from_sql(&a).unwrap(), at(2, 0));
    }
}
