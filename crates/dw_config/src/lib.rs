//! `dw_config` - Configuration parsing and validation for dockwatch
//!
//! This crate provides:
//! - TOML configuration parsing
//! - Default value handling
//! - Environment variable overrides
//! - Path expansion (`~/` to home directory)
//! - Auto-discovery from standard config paths
//! - Host inventory, alert subscription and job definitions

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Top-level configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DwConfig {
    /// Global settings
    pub global: GlobalConfig,

    /// SSH transport settings
    pub ssh: SshConfig,

    /// Inventory synchronizer settings
    pub sync: SyncConfig,

    /// Container monitor settings
    pub monitor: MonitorConfig,

    /// Job scheduler settings
    pub scheduler: SchedulerConfig,

    /// Host inventory, keyed by host id
    pub hosts: BTreeMap<String, HostConfig>,

    /// Recurring snapshot jobs
    pub jobs: Vec<JobConfig>,
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Path to `DuckDB` database file
    pub db_path: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Enable JSON logging
    pub json_logs: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Default database path using XDG directories
fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dockwatch")
        .join("dockwatch.duckdb")
}

/// Expand tilde in path to home directory
#[must_use]
pub fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    path.to_path_buf()
}

/// SSH transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Bound on a single dial attempt, in seconds
    pub connect_timeout_secs: u64,

    /// Default timeout for short remote commands, in seconds
    pub command_timeout_secs: u64,

    /// Timeout for long operations such as image commits, in seconds
    pub long_command_timeout_secs: u64,

    /// SSH keepalive interval, in seconds
    pub keepalive_interval_secs: u64,

    /// How many fallback addresses may be tried after the first dial fails
    pub max_fallbacks: usize,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            command_timeout_secs: 30,
            long_command_timeout_secs: 600,
            keepalive_interval_secs: 30,
            max_fallbacks: 1,
        }
    }
}

impl SshConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    #[must_use]
    pub fn long_command_timeout(&self) -> Duration {
        Duration::from_secs(self.long_command_timeout_secs)
    }

    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// Inventory synchronizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run the periodic synchronizer
    pub enabled: bool,

    /// Tick interval in seconds
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

/// Where the monitor reads container state from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InventorySourceKind {
    /// The synchronizer's cache (no extra remote load)
    #[default]
    Cache,
    /// A direct poll of every host on each monitor tick
    Live,
}

/// Container monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Run the periodic monitor
    pub enabled: bool,

    /// Tick interval in seconds
    pub interval_secs: u64,

    /// Minimum time between repeated alerts for the same condition
    pub cooldown_secs: u64,

    /// Inventory source
    pub source: InventorySourceKind,

    /// Write alerts to the log
    pub log_alerts: bool,

    /// Webhook URL receiving alert payloads
    pub webhook_url: Option<String>,

    /// Who gets alerted for which hosts
    pub subscriptions: Vec<AlertSubscription>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            cooldown_secs: 300,
            source: InventorySourceKind::Cache,
            log_alerts: true,
            webhook_url: None,
            subscriptions: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Whether at least one delivery channel is configured
    #[must_use]
    pub fn has_channel(&self) -> bool {
        self.log_alerts || self.webhook_url.is_some()
    }
}

/// An alert recipient and the hosts they own
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertSubscription {
    /// Owner identity (alert state is tracked per owner)
    pub owner: String,

    /// Delivery address handed to the notifier
    pub recipient: String,

    /// Host ids to watch; empty means every host
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl AlertSubscription {
    #[must_use]
    pub fn covers(&self, host_id: &str) -> bool {
        self.hosts.is_empty() || self.hosts.iter().any(|h| h == host_id)
    }
}

/// Job scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Run the periodic scheduler
    pub enabled: bool,

    /// Tick interval in seconds
    pub interval_secs: u64,

    /// Image repository prefix used for snapshots
    pub snapshot_repository: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            snapshot_repository: "dockwatch-snapshots".to_string(),
        }
    }
}

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Primary address (hostname or IP)
    pub address: String,

    /// Private overlay address, preferred when reachable
    #[serde(default)]
    pub overlay_address: Option<String>,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// SSH user
    pub user: String,

    /// Credential reference: a key path, `env:VAR`, or absent for default keys
    #[serde(default)]
    pub credential: Option<String>,

    /// Whether this host is managed
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_ssh_port() -> u16 {
    22
}

fn default_retention() -> u32 {
    5
}

/// Recurrence of a scheduled job. Times are UTC.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    /// Every `hours` hours after the last run
    Interval { hours: u32 },
    /// Every day at `hour:minute`
    Daily { hour: u32, minute: u32 },
    /// Every week on `day_of_week` (0 = Sunday) at `hour:minute`
    Weekly {
        day_of_week: u32,
        hour: u32,
        minute: u32,
    },
}

impl Schedule {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Interval { .. } => "interval",
            Self::Daily { .. } => "daily",
            Self::Weekly { .. } => "weekly",
        }
    }

    /// Check parameter ranges.
    ///
    /// # Errors
    /// Returns a [`ConfigError::ValidationError`] describing the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (hour, minute) = match *self {
            Self::Interval { .. } => return Ok(()),
            Self::Daily { hour, minute } => (hour, minute),
            Self::Weekly {
                day_of_week,
                hour,
                minute,
            } => {
                if day_of_week > 6 {
                    return Err(ConfigError::ValidationError(format!(
                        "day_of_week must be 0-6, got {day_of_week}"
                    )));
                }
                (hour, minute)
            }
        };
        if hour > 23 {
            return Err(ConfigError::ValidationError(format!(
                "hour must be 0-23, got {hour}"
            )));
        }
        if minute > 59 {
            return Err(ConfigError::ValidationError(format!(
                "minute must be 0-59, got {minute}"
            )));
        }
        Ok(())
    }
}

/// A recurring snapshot job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Stable job id
    pub id: String,

    /// Owner of the job
    pub owner: String,

    /// Recurrence
    pub schedule: Schedule,

    /// Snapshots to keep per target
    #[serde(default = "default_retention")]
    pub retention: u32,

    /// Whether the job runs
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Containers to snapshot, in order
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// A (host, container) pair a job applies to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetConfig {
    pub host: String,
    pub container: String,
}

impl DwConfig {
    /// Standard config file paths, in order of precedence
    #[must_use]
    pub fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("dockwatch.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("dockwatch").join("dockwatch.toml"));
        }

        paths.push(PathBuf::from("/etc/dockwatch/dockwatch.toml"));

        paths
    }

    /// Discover and load configuration from standard paths.
    ///
    /// Returns defaults if no config file is found.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if a discovered config file cannot be loaded.
    pub fn discover() -> Result<Self, ConfigError> {
        for path in Self::config_paths() {
            if path.exists() {
                info!(path = %path.display(), "Loading config from");
                return Self::load(&path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Discover config and apply environment variable overrides.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if config discovery or validation fails.
    pub fn discover_with_env() -> Result<Self, ConfigError> {
        let mut config = Self::discover()?;
        config.apply_env_overrides();
        config.expand_all_paths();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the content cannot be parsed or validated.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: DwConfig = toml::from_str(content)?;
        config.expand_all_paths();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or validated.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Expand all paths in configuration (resolve `~/` to home directory)
    pub fn expand_all_paths(&mut self) {
        self.global.db_path = expand_path(&self.global.db_path);

        for host in self.hosts.values_mut() {
            if let Some(credential) = &host.credential
                && !credential.starts_with("env:")
            {
                let expanded = expand_path(Path::new(credential));
                host.credential = Some(expanded.to_string_lossy().to_string());
            }
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("DW_DB_PATH") {
            self.global.db_path = expand_path(&PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("DW_LOG_LEVEL") {
            self.global.log_level = val;
        }
        if let Ok(val) = std::env::var("DW_SYNC_INTERVAL")
            && let Ok(secs) = val.parse()
        {
            self.sync.interval_secs = secs;
        }
        if let Ok(val) = std::env::var("DW_ALERT_COOLDOWN")
            && let Ok(secs) = val.parse()
        {
            self.monitor.cooldown_secs = secs;
        }
    }

    /// Validate configuration.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when validation rules are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, secs) in [
            ("sync.interval_secs", self.sync.interval_secs),
            ("monitor.interval_secs", self.monitor.interval_secs),
            ("scheduler.interval_secs", self.scheduler.interval_secs),
            ("ssh.connect_timeout_secs", self.ssh.connect_timeout_secs),
            ("ssh.command_timeout_secs", self.ssh.command_timeout_secs),
            (
                "ssh.long_command_timeout_secs",
                self.ssh.long_command_timeout_secs,
            ),
        ] {
            if secs == 0 {
                return Err(ConfigError::ValidationError(format!("{name} must be > 0")));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.global.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.global.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.scheduler.snapshot_repository.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "scheduler.snapshot_repository must not be empty".to_string(),
            ));
        }

        for (id, host) in &self.hosts {
            if host.address.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Host '{id}' has an empty address"
                )));
            }
            if host.user.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Host '{id}' has an empty user"
                )));
            }
            if host.port == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Host '{id}' port must be > 0"
                )));
            }
        }

        for sub in &self.monitor.subscriptions {
            if let Some(unknown) = sub.hosts.iter().find(|h| !self.hosts.contains_key(*h)) {
                return Err(ConfigError::ValidationError(format!(
                    "Subscription for '{}' references unknown host '{unknown}'",
                    sub.owner
                )));
            }
        }

        let mut job_ids = HashSet::new();
        // Snapshot repositories are lowercase, so names differing only in case would share one
        let mut snapshot_names: HashMap<(&str, String), &str> = HashMap::new();
        for job in &self.jobs {
            if !job_ids.insert(job.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate job id '{}'",
                    job.id
                )));
            }
            if job.retention == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Job '{}' retention must be >= 1",
                    job.id
                )));
            }
            job.schedule.validate().map_err(|e| {
                ConfigError::ValidationError(format!("Job '{}' schedule: {e}", job.id))
            })?;
            if let Some(target) = job.targets.iter().find(|t| !self.hosts.contains_key(&t.host)) {
                return Err(ConfigError::ValidationError(format!(
                    "Job '{}' targets unknown host '{}'",
                    job.id, target.host
                )));
            }
            for target in &job.targets {
                let key = (target.host.as_str(), target.container.to_ascii_lowercase());
                let seen = *snapshot_names.entry(key).or_insert(target.container.as_str());
                if seen != target.container {
                    return Err(ConfigError::ValidationError(format!(
                        "Job '{}' targets container '{}' on '{}', which differs from '{seen}' only in case",
                        job.id, target.container, target.host
                    )));
                }
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_secs)
    }

    #[must_use]
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.interval_secs)
    }

    #[must_use]
    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.monitor.cooldown_secs)
    }

    /// Get enabled hosts
    pub fn enabled_hosts(&self) -> impl Iterator<Item = (&String, &HostConfig)> {
        self.hosts.iter().filter(|(_, h)| h.enabled)
    }
}
