//! Command execution on host sessions
//!
//! Every command runs against a deadline. When the deadline passes the remote
//! stream is ended and the host session invalidated; the remote process may
//! keep running on the host.

use crate::session::SessionRegistry;
use crate::transport::ExecEvent;
use crate::{command_prefix, CommandResult, RemoteError};
use dw_store::{Host, HostDirectory};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Per-call execution options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides the executor's default timeout
    pub timeout: Option<Duration>,
    /// Return non-zero exits as results instead of [`RemoteError::CommandFailure`]
    pub allow_failure: bool,
    /// Streamed to the command before end-of-input
    pub stdin: Option<Vec<u8>>,
}

impl RunOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Runs commands on hosts through the session registry
pub struct CommandExecutor {
    sessions: Arc<SessionRegistry>,
    hosts: Arc<dyn HostDirectory>,
    default_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        hosts: Arc<dyn HostDirectory>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            hosts,
            default_timeout,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Look up a host by id
    ///
    /// # Errors
    ///
    /// [`RemoteError::UnknownHost`] if the directory has no such host.
    pub fn host(&self, host_id: &str) -> Result<Host, RemoteError> {
        self.hosts
            .get_host(host_id)?
            .ok_or_else(|| RemoteError::UnknownHost(host_id.to_string()))
    }

    /// Run `command` on the host with id `host_id`.
    ///
    /// # Errors
    ///
    /// See [`CommandExecutor::run_on`]; also [`RemoteError::UnknownHost`].
    pub async fn run(
        &self,
        host_id: &str,
        command: &str,
        options: RunOptions,
    ) -> Result<CommandResult, RemoteError> {
        let host = self.host(host_id)?;
        self.run_on(&host, command, options).await
    }

    /// Run `command` on `host`.
    ///
    /// # Errors
    ///
    /// - [`RemoteError::Connection`] if no session could be established
    /// - [`RemoteError::Timeout`] with the partial output if the deadline passed
    /// - [`RemoteError::CommandFailure`] on non-zero exit unless failure is allowed
    #[instrument(skip(self, host, command, options), fields(host_id = %host.host_id, command = %command_prefix(command)))]
    pub async fn run_on(
        &self,
        host: &Host,
        command: &str,
        options: RunOptions,
    ) -> Result<CommandResult, RemoteError> {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;
        let session = self.sessions.acquire(host).await?;

        let timed_out = |stdout: &[u8], stderr: &[u8]| RemoteError::Timeout {
            host: host.host_id.clone(),
            command: command_prefix(command),
            after: timeout,
            partial: Box::new(CommandResult {
                stdout: String::from_utf8_lossy(stdout).into_owned(),
                stderr: String::from_utf8_lossy(stderr).into_owned(),
                exit_code: -1,
                timed_out: true,
            }),
        };

        let mut stream = match tokio::time::timeout_at(
            deadline,
            session.connection().open_exec(command, options.stdin),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                if !session.is_connected() {
                    self.sessions.invalidate(&host.host_id).await;
                }
                return Err(e);
            }
            Err(_) => {
                warn!(after = ?timeout, "Command channel did not open in time");
                self.sessions.invalidate(&host.host_id).await;
                return Err(timed_out(&[], &[]));
            }
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        loop {
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(Ok(ExecEvent::Stdout(data)))) => stdout.extend_from_slice(&data),
                Ok(Some(Ok(ExecEvent::Stderr(data)))) => stderr.extend_from_slice(&data),
                Ok(Some(Ok(ExecEvent::Exit(code)))) => exit_code = Some(code),
                Ok(Some(Err(e))) => {
                    stream.abort();
                    if !session.is_connected() {
                        self.sessions.invalidate(&host.host_id).await;
                    }
                    return Err(e);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(after = ?timeout, "Command timed out; invalidating session");
                    stream.abort();
                    self.sessions.invalidate(&host.host_id).await;
                    return Err(timed_out(&stdout, &stderr));
                }
            }
        }

        let result = CommandResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code.unwrap_or(-1),
            timed_out: false,
        };
        debug!(exit_code = result.exit_code, "Command finished");

        if result.exit_code != 0 && !options.allow_failure {
            return Err(RemoteError::CommandFailure {
                host: host.host_id.clone(),
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }

        Ok(result)
    }
}
