//! `dw_cli` - CLI commands for dockwatch
//!
//! This crate provides:
//! - clap-based command definitions
//! - The [`Engine`] wiring every component from configuration
//! - The daemon running the sync, monitor and scheduler loops

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use dw_config::DwConfig;
use dw_remote::{RemoteError, RunOptions};
use dw_store::{ScheduledJob, StoreError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod daemon;
pub mod engine;

pub use engine::Engine;

/// CLI errors
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Config error: {0}")]
    ConfigError(#[from] dw_config::ConfigError),

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Remote error: {0}")]
    RemoteError(#[from] dw_remote::RemoteError),

    #[error("Job error: {0}")]
    JobError(#[from] dw_jobs::JobError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed JSON
    Text,
    /// Single-line JSON
    Json,
}

/// Main CLI application
#[derive(Parser, Debug)]
#[command(name = "dw")]
#[command(
    author,
    version,
    about = "dockwatch - SSH-driven Docker fleet orchestration"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "DW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format for commands
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the sync, monitor and scheduler loops until Ctrl-C
    Daemon,

    /// Sync inventory now
    Sync {
        /// Only this host
        #[arg(long)]
        host: Option<String>,
    },

    /// Run a command on a host
    Run {
        /// Target host id
        #[arg(long)]
        host: String,

        /// Timeout in seconds (defaults to ssh.command_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,

        /// Return the output even when the command exits non-zero
        #[arg(long)]
        allow_failure: bool,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// List managed hosts
    Hosts,

    /// Show the cached inventory of a host
    Inventory {
        #[arg(long)]
        host: String,
    },

    /// List snapshot jobs with their next runs
    Jobs,

    /// Show the run history of a job
    Runs {
        job_id: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show recent alert deliveries
    Alerts {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Load and validate the configuration
    Check {
        /// Config file (defaults to discovery)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Show config file search paths
    Paths,
}

/// A job as shown by `dw jobs`
#[derive(Debug, Serialize)]
struct JobView {
    #[serde(flatten)]
    job: ScheduledJob,
    due: bool,
    /// The run after `next_run_at`
    following_run_at: Option<DateTime<Utc>>,
}

/// Summary printed by `dw config check`
#[derive(Debug, Serialize)]
struct ConfigSummary {
    hosts: usize,
    enabled_hosts: usize,
    jobs: usize,
    subscriptions: usize,
    alerting: bool,
    db_path: PathBuf,
}

impl Cli {
    /// Load configuration from `--config` or the standard paths
    ///
    /// # Errors
    ///
    /// Returns [`CliError::ConfigError`] if loading or validation fails.
    pub fn load_config(&self) -> Result<DwConfig, CliError> {
        Ok(match &self.config {
            Some(path) => DwConfig::load_with_env(path)?,
            None => DwConfig::discover_with_env()?,
        })
    }

    /// Run the CLI
    ///
    /// # Errors
    ///
    /// Returns [`CliError`] when the command fails.
    pub async fn run(self) -> Result<(), CliError> {
        match &self.command {
            Commands::Config { command } => match command {
                ConfigCommands::Check { file } => {
                    let config = match file {
                        Some(path) => DwConfig::load_with_env(path)?,
                        None => self.load_config()?,
                    };
                    let summary = ConfigSummary {
                        hosts: config.hosts.len(),
                        enabled_hosts: config.enabled_hosts().count(),
                        jobs: config.jobs.len(),
                        subscriptions: config.monitor.subscriptions.len(),
                        alerting: config.monitor.enabled && config.monitor.has_channel(),
                        db_path: config.global.db_path.clone(),
                    };
                    if self.format == OutputFormat::Text {
                        println!("Configuration is valid");
                    }
                    print_output(&summary, self.format);
                }
                ConfigCommands::Paths => {
                    for (i, path) in DwConfig::config_paths().iter().enumerate() {
                        let marker = if path.exists() { "*" } else { " " };
                        println!("  {marker} {}. {}", i + 1, path.display());
                    }
                }
            },
            command => {
                let engine = Arc::new(Engine::open(self.load_config()?)?);
                let result = self.run_with(&engine, command).await;
                engine.shutdown().await;
                result?;
            }
        }
        Ok(())
    }

    async fn run_with(&self, engine: &Arc<Engine>, command: &Commands) -> Result<(), CliError> {
        match command {
            Commands::Daemon => {
                daemon::run(Arc::clone(engine), daemon::ctrl_c()).await;
            }
            Commands::Sync { host: Some(host) } => {
                engine.sync_host_now(host).await?;
                let records = engine.store().query_containers(host)?;
                print_output(
                    &serde_json::json!({ "host_id": host, "containers": records.len() }),
                    self.format,
                );
            }
            Commands::Sync { host: None } => {
                let summary = engine.synchronizer().tick().await;
                print_output(&summary, self.format);
                for (host_id, error) in engine.synchronizer().errors().snapshot() {
                    eprintln!("{host_id}: {error}");
                }
            }
            Commands::Run {
                host,
                timeout,
                allow_failure,
                command,
            } => {
                let mut options = RunOptions::default();
                if let Some(secs) = timeout {
                    options = options.with_timeout(Duration::from_secs(*secs));
                }
                if *allow_failure {
                    options = options.allow_failure();
                }
                let result = match engine.run_command(host, &command.join(" "), options).await {
                    Ok(result) => result,
                    Err(e) => {
                        if let Some(hint) = run_hint(&e) {
                            eprintln!("hint: {hint}");
                        }
                        return Err(e.into());
                    }
                };
                print!("{}", result.stdout);
                eprint!("{}", result.stderr);
                if !result.success() {
                    return Err(CliError::CommandFailed(format!(
                        "exited with {}",
                        result.exit_code
                    )));
                }
            }
            Commands::Hosts => {
                let hosts = dw_store::HostRegistry::new(Arc::clone(engine.store())).enabled_hosts()?;
                print_output(&hosts, self.format);
            }
            Commands::Inventory { host } => {
                let containers = engine.store().query_containers(host)?;
                let facts = engine.store().host_facts(host)?;
                print_output(
                    &serde_json::json!({
                        "host_id": host,
                        "containers": containers,
                        "facts": facts,
                    }),
                    self.format,
                );
            }
            Commands::Jobs => {
                let now = Utc::now();
                let views: Vec<JobView> = engine
                    .store()
                    .list_jobs()?
                    .into_iter()
                    .map(|job| job_view(job, now))
                    .collect();
                print_output(&views, self.format);
            }
            Commands::Runs { job_id, limit } => {
                let runs = engine.store().list_job_runs(job_id, *limit)?;
                print_output(&runs, self.format);
            }
            Commands::Alerts { limit } => {
                let alerts = engine.store().list_alerts(*limit)?;
                print_output(&alerts, self.format);
            }
            Commands::Config { .. } => {}
        }
        Ok(())
    }
}

fn job_view(job: ScheduledJob, now: DateTime<Utc>) -> JobView {
    let following_run_at = job.next_run_at.and_then(|next| {
        dw_jobs::next_run_at(&job.schedule, Some(next), next.max(now)).ok()
    });
    JobView {
        due: job.is_due(now),
        following_run_at,
        job,
    }
}

/// Guidance printed after a failed `dw run`
fn run_hint(error: &RemoteError) -> Option<&'static str> {
    error.is_timeout().then_some(
        "commands run without a terminal; avoid interactive commands or raise --timeout",
    )
}

fn print_output<T: Serialize>(value: &T, format: OutputFormat) {
    let json = match format {
        OutputFormat::Json => serde_json::to_string(value),
        OutputFormat::Text => serde_json::to_string_pretty(value),
    }
    .unwrap_or_else(|e| format!(r#"{{"error": "serialization failed: {e}"}}"#));
    println!("{json}");
}
