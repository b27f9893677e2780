//! `dw_remote` - Remote host access for dockwatch
//!
//! This crate provides:
//! - The transport seam (`Transport` / `Connection` / `ExecStream`) and its russh implementation
//! - The session registry: one live session per host with overlay-to-primary fallback
//! - The command executor with bounded timeouts
//! - Parsing of inventory and host-fact command output into structured records
//! - The inventory synchronizer and its change events
//!
//! # Failure model
//!
//! 1. **Connection errors** happen while dialling and are the only errors that trigger fallback
//! 2. **Timeouts** end the remote stream and invalidate the host session
//! 3. **Command failures** are non-zero exits the caller did not allow
//! 4. **Degraded output** is never an error: malformed lines become placeholder records

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod busy;
pub mod commands;
pub mod credentials;
pub mod events;
pub mod executor;
pub mod facts;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod parse;
pub mod session;
pub mod ssh;
pub mod sync;
pub mod transport;

pub use busy::{BusyFlag, BusyGuard};
pub use credentials::{Credential, CredentialResolver, EnvCredentialResolver};
pub use events::{BroadcastSink, ChangeEvent, EventSink};
pub use executor::{CommandExecutor, RunOptions};
pub use facts::{Fact, HostFacts};
pub use parse::{ContainerInfo, Parsed};
pub use session::{ConnectionEvent, PoolStats, Session, SessionConfig, SessionRegistry};
pub use ssh::RusshTransport;
pub use sync::{LastErrorRegistry, SyncSummary, Synchronizer};
pub use transport::{Connection, DialTarget, ExecEvent, ExecFeed, ExecStream, Transport};

/// Remote access errors
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    #[error("Command `{command}` on {host} timed out after {after:?}")]
    Timeout {
        host: String,
        command: String,
        after: Duration,
        partial: Box<CommandResult>,
    },

    #[error("Command on {host} exited with {exit_code}: {}", .stderr.trim())]
    CommandFailure {
        host: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Channel error on {host}: {message}")]
    Channel { host: String, message: String },

    #[error("Credential for {host} unavailable: {message}")]
    Credential { host: String, message: String },

    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Store error: {0}")]
    Store(#[from] dw_store::StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RemoteError {
    /// Errors raised while establishing a session; these are eligible for fallback.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Output of a single remote command
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    /// Remote exit status, `-1` when the remote never reported one
    pub exit_code: i32,
    pub timed_out: bool,
}

impl CommandResult {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Shortened command text for errors and logs
#[must_use]
pub fn command_prefix(command: &str) -> String {
    const MAX: usize = 80;
    let mut prefix: String = command.chars().take(MAX).collect();
    if command.chars().count() > MAX {
        prefix.push_str("...");
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_result_success() {
        let ok = CommandResult {
            stdout: "hello".to_string(),
            ..Default::default()
        };
        assert!(ok.success());

        let failed = CommandResult {
            exit_code: 1,
            ..Default::default()
        };
        assert!(!failed.success());

        let timed_out = CommandResult {
            timed_out: true,
            ..Default::default()
        };
        assert!(!timed_out.success());
    }

    #[test]
    fn test_command_prefix() {
        assert_eq!(command_prefix("docker ps"), "docker ps");
        let long = "x".repeat(200);
        let prefix = command_prefix(&long);
        assert_eq!(prefix.len(), 83);
        assert!(prefix.ends_with("..."));
    }

    #[test]
    fn test_error_display() {
        let err = RemoteError::Connection {
            host: "web-1".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("web-1"));
        assert!(err.to_string().contains("connection refused"));
        assert!(err.is_connection());

        let failure = RemoteError::CommandFailure {
            host: "web-1".to_string(),
            exit_code: 2,
            stdout: String::new(),
            stderr: "no such container\n".to_string(),
        };
        assert_eq!(
            failure.to_string(),
            "Command on web-1 exited with 2: no such container"
        );
        assert!(!failure.is_connection());
    }
}
