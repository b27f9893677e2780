//! Scripted in-process transport for tests
//!
//! Replies are matched by command substring, newest rule first. Dials and
//! commands are recorded so tests can assert on what reached the "wire".

use crate::credentials::Credential;
use crate::transport::{Connection, DialTarget, ExecEvent, ExecFeed, ExecStream, Transport};
use crate::RemoteError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Scripted behaviour for one command
#[derive(Debug, Clone, Default)]
pub struct MockReply {
    pub stdout: String,
    pub stderr: String,
    /// `None` ends the stream without an exit status
    pub exit: Option<i32>,
    pub delay: Duration,
    /// Emit output, then never finish until aborted
    pub hang: bool,
    /// Answer with whatever arrived on stdin
    pub echo_stdin: bool,
}

impl MockReply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit: Some(0),
            ..Default::default()
        }
    }

    pub fn fail(exit: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit: Some(exit),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn echo_stdin() -> Self {
        Self {
            echo_stdin: true,
            exit: Some(0),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn without_exit(mut self) -> Self {
        self.exit = None;
        self
    }
}

struct Rule {
    host_id: Option<String>,
    pattern: String,
    reply: MockReply,
}

#[derive(Default)]
struct MockState {
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    rules: Mutex<Vec<Rule>>,
    dials: Mutex<Vec<String>>,
    commands: Mutex<Vec<(String, String)>>,
    stdin: Mutex<Vec<Vec<u8>>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    aborted: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockState {
    fn find(&self, host_id: &str, command: &str) -> MockReply {
        lock(&self.rules)
            .iter()
            .rev()
            .find(|rule| {
                rule.host_id.as_deref().is_none_or(|h| h == host_id)
                    && command.contains(&rule.pattern)
            })
            .map_or_else(
                || MockReply::fail(127, format!("mock: no reply scripted for `{command}`")),
                |rule| rule.reply.clone(),
            )
    }
}

/// Scripted transport; clones share state.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to commands containing `pattern` on any host.
    pub fn reply(&self, pattern: impl Into<String>, reply: MockReply) {
        lock(&self.state.rules).push(Rule {
            host_id: None,
            pattern: pattern.into(),
            reply,
        });
    }

    /// Reply to commands containing `pattern` on one host.
    pub fn reply_for(&self, host_id: impl Into<String>, pattern: impl Into<String>, reply: MockReply) {
        lock(&self.state.rules).push(Rule {
            host_id: Some(host_id.into()),
            pattern: pattern.into(),
            reply,
        });
    }

    /// Refuse connections to `address`.
    pub fn fail_dial(&self, address: impl Into<String>) {
        lock(&self.state.failing).insert(address.into());
    }

    pub fn restore_dial(&self, address: &str) {
        lock(&self.state.failing).remove(address);
        lock(&self.state.hanging).remove(address);
    }

    /// Never answer dials to `address`.
    pub fn hang_dial(&self, address: impl Into<String>) {
        lock(&self.state.hanging).insert(address.into());
    }

    /// Simulate every open connection dropping.
    pub fn drop_connections(&self) {
        for connection in lock(&self.state.connections).drain(..) {
            connection.closed.store(true, Ordering::Release);
        }
    }

    /// Addresses dialled, in order
    #[must_use]
    pub fn dials(&self) -> Vec<String> {
        lock(&self.state.dials).clone()
    }

    /// (host id, command) pairs executed, in order
    #[must_use]
    pub fn commands(&self) -> Vec<(String, String)> {
        lock(&self.state.commands).clone()
    }

    /// Commands executed on one host
    #[must_use]
    pub fn commands_for(&self, host_id: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|(h, _)| h == host_id)
            .map(|(_, c)| c)
            .collect()
    }

    /// Stdin payloads received, in order
    #[must_use]
    pub fn stdin_payloads(&self) -> Vec<Vec<u8>> {
        lock(&self.state.stdin).clone()
    }

    /// Commands ended by the consumer before finishing
    #[must_use]
    pub fn aborted(&self) -> usize {
        self.state.aborted.load(Ordering::Acquire)
    }

    /// Dial counts keyed by address
    #[must_use]
    pub fn dial_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for address in self.dials() {
            *counts.entry(address).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn dial(
        &self,
        target: &DialTarget,
        _credential: &Credential,
    ) -> Result<Arc<dyn Connection>, RemoteError> {
        lock(&self.state.dials).push(target.address.clone());

        let hanging = lock(&self.state.hanging).contains(&target.address);
        if hanging {
            std::future::pending::<()>().await;
        }
        let failing = lock(&self.state.failing).contains(&target.address);
        if failing {
            return Err(RemoteError::Connection {
                host: target.host_id.clone(),
                message: format!("{}:{}: connection refused", target.address, target.port),
            });
        }

        let connection = Arc::new(MockConnection {
            host_id: target.host_id.clone(),
            closed: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        });
        lock(&self.state.connections).push(Arc::clone(&connection));
        Ok(connection)
    }
}

struct MockConnection {
    host_id: String,
    closed: AtomicBool,
    state: Arc<MockState>,
}

#[async_trait]
impl Connection for MockConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn open_exec(
        &self,
        command: &str,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecStream, RemoteError> {
        if self.is_closed() {
            return Err(RemoteError::Channel {
                host: self.host_id.clone(),
                message: "connection closed".to_string(),
            });
        }

        lock(&self.state.commands).push((self.host_id.clone(), command.to_string()));
        if let Some(bytes) = &stdin {
            lock(&self.state.stdin).push(bytes.clone());
        }

        let reply = self.state.find(&self.host_id, command);
        let state = Arc::clone(&self.state);
        let (stream, feed) = ExecStream::pair();
        tokio::spawn(play(reply, stdin.unwrap_or_default(), feed, state));
        Ok(stream)
    }

    async fn disconnect(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

async fn play(reply: MockReply, stdin: Vec<u8>, feed: ExecFeed, state: Arc<MockState>) {
    let ExecFeed { events, mut abort } = feed;

    if !reply.delay.is_zero() {
        tokio::select! {
            _ = &mut abort => {
                state.aborted.fetch_add(1, Ordering::AcqRel);
                return;
            }
            () = tokio::time::sleep(reply.delay) => {}
        }
    }

    let stdout = if reply.echo_stdin {
        stdin
    } else {
        reply.stdout.into_bytes()
    };
    if !stdout.is_empty() && events.send(Ok(ExecEvent::Stdout(stdout))).await.is_err() {
        return;
    }
    if !reply.stderr.is_empty()
        && events
            .send(Ok(ExecEvent::Stderr(reply.stderr.into_bytes())))
            .await
            .is_err()
    {
        return;
    }

    if reply.hang {
        let _ = abort.await;
        state.aborted.fetch_add(1, Ordering::AcqRel);
        return;
    }

    if let Some(code) = reply.exit {
        let _ = events.send(Ok(ExecEvent::Exit(code))).await;
    }
}
