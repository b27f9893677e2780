//! Transport seam between the session registry and the wire
//!
//! A [`Transport`] dials one address and yields a [`Connection`]; a connection
//! opens command channels that report output as an [`ExecStream`].

use crate::credentials::Credential;
use crate::RemoteError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Where and as whom to dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub host_id: String,
    pub address: String,
    pub port: u16,
    pub user: String,
}

/// Establishes connections to a single address.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial `target` and authenticate. Failures must be [`RemoteError::Connection`]
    /// unless the credential itself is unusable.
    async fn dial(
        &self,
        target: &DialTarget,
        credential: &Credential,
    ) -> Result<Arc<dyn Connection>, RemoteError>;
}

/// An established, authenticated connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Whether the underlying transport has gone away.
    fn is_closed(&self) -> bool;

    /// Start `command`, streaming `stdin` (if any) before end-of-input.
    async fn open_exec(
        &self,
        command: &str,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecStream, RemoteError>;

    async fn disconnect(&self);
}

/// One item of command output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(i32),
}

/// Consumer end of a running command.
///
/// The stream ends (`next` returns `None`) when the remote channel closes.
/// Aborting, or dropping the stream, asks the producer to end the remote channel.
#[derive(Debug)]
pub struct ExecStream {
    events: mpsc::Receiver<Result<ExecEvent, RemoteError>>,
    abort: Option<oneshot::Sender<()>>,
}

/// Producer end of a running command
#[derive(Debug)]
pub struct ExecFeed {
    pub events: mpsc::Sender<Result<ExecEvent, RemoteError>>,
    pub abort: oneshot::Receiver<()>,
}

impl ExecStream {
    /// Create a connected stream and feed.
    #[must_use]
    pub fn pair() -> (Self, ExecFeed) {
        let (tx, rx) = mpsc::channel(64);
        let (abort_tx, abort_rx) = oneshot::channel();
        (
            Self {
                events: rx,
                abort: Some(abort_tx),
            },
            ExecFeed {
                events: tx,
                abort: abort_rx,
            },
        )
    }

    pub async fn next(&mut self) -> Option<Result<ExecEvent, RemoteError>> {
        self.events.recv().await
    }

    pub fn abort(&mut self) {
        if let Some(tx) = self.abort.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ExecStream {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_delivers_in_order() {
        let (mut stream, feed) = ExecStream::pair();
        feed.events
            .send(Ok(ExecEvent::Stdout(b"a".to_vec())))
            .await
            .unwrap();
        feed.events.send(Ok(ExecEvent::Exit(0))).await.unwrap();
        drop(feed);

        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            ExecEvent::Stdout(b"a".to_vec())
        );
        assert_eq!(stream.next().await.unwrap().unwrap(), ExecEvent::Exit(0));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_signals_abort() {
        let (stream, feed) = ExecStream::pair();
        drop(stream);
        assert!(feed.abort.await.is_ok());
    }
}
