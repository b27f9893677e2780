//! russh-backed transport
//!
//! Dials one address, authenticates with the resolved key, and pumps each
//! command channel into an [`ExecStream`].

use crate::credentials::Credential;
use crate::transport::{Connection, DialTarget, ExecEvent, ExecFeed, ExecStream, Transport};
use crate::RemoteError;
use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::KeyPair;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// SSH client handler for russh
struct SshHandler;

#[async_trait]
impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are accepted on first use, matching StrictHostKeyChecking=accept-new
        Ok(true)
    }
}

/// Transport over real SSH connections
#[derive(Debug, Clone)]
pub struct RusshTransport {
    keepalive_interval: Duration,
}

impl RusshTransport {
    #[must_use]
    pub fn new(keepalive_interval: Duration) -> Self {
        Self { keepalive_interval }
    }
}

impl Default for RusshTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Transport for RusshTransport {
    #[instrument(skip(self, credential), fields(host_id = %target.host_id, address = %target.address))]
    async fn dial(
        &self,
        target: &DialTarget,
        credential: &Credential,
    ) -> Result<Arc<dyn Connection>, RemoteError> {
        debug!(user = %target.user, port = target.port, "Connecting to SSH host");

        let config = client::Config {
            keepalive_interval: Some(self.keepalive_interval),
            keepalive_max: 3,
            ..Default::default()
        };

        let mut handle = client::connect(
            Arc::new(config),
            (target.address.as_str(), target.port),
            SshHandler,
        )
        .await
        .map_err(|e| connection_error(target, e))?;

        let keys = load_keys(target, credential)?;
        let mut authenticated = false;
        for key in keys {
            match handle.authenticate_publickey(&target.user, key).await {
                Ok(true) => {
                    authenticated = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => return Err(connection_error(target, e)),
            }
        }

        if !authenticated {
            return Err(RemoteError::Connection {
                host: target.host_id.clone(),
                message: format!(
                    "authentication failed for {}@{}",
                    target.user, target.address
                ),
            });
        }

        Ok(Arc::new(RusshConnection {
            host_id: target.host_id.clone(),
            handle,
        }))
    }
}

fn connection_error(target: &DialTarget, err: russh::Error) -> RemoteError {
    RemoteError::Connection {
        host: target.host_id.clone(),
        message: format!("{}:{}: {err}", target.address, target.port),
    }
}

fn load_keys(target: &DialTarget, credential: &Credential) -> Result<Vec<Arc<KeyPair>>, RemoteError> {
    if let Credential::KeyMaterial(material) = credential {
        let key = russh_keys::decode_secret_key(material, None).map_err(|e| {
            RemoteError::Credential {
                host: target.host_id.clone(),
                message: format!("inline key could not be decoded: {e}"),
            }
        })?;
        return Ok(vec![Arc::new(key)]);
    }

    let mut keys = Vec::new();
    let mut last_error = None;
    for path in credential.key_paths() {
        match russh_keys::load_secret_key(&path, None) {
            Ok(key) => keys.push(Arc::new(key)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unusable key");
                last_error = Some(format!("{}: {e}", path.display()));
            }
        }
    }

    if keys.is_empty() {
        return Err(RemoteError::Credential {
            host: target.host_id.clone(),
            message: last_error.unwrap_or_else(|| "no private key available".to_string()),
        });
    }
    Ok(keys)
}

struct RusshConnection {
    host_id: String,
    handle: client::Handle<SshHandler>,
}

impl RusshConnection {
    fn channel_error(&self, err: russh::Error) -> RemoteError {
        RemoteError::Channel {
            host: self.host_id.clone(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl Connection for RusshConnection {
    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn open_exec(
        &self,
        command: &str,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecStream, RemoteError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.channel_error(e))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| self.channel_error(e))?;

        if let Some(bytes) = stdin {
            channel
                .data(&bytes[..])
                .await
                .map_err(|e| self.channel_error(e))?;
        }
        channel.eof().await.map_err(|e| self.channel_error(e))?;

        let (stream, feed) = ExecStream::pair();
        tokio::spawn(pump(channel, feed));
        Ok(stream)
    }

    async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(host_id = %self.host_id, error = %e, "Disconnect failed");
        }
    }
}

/// Forward channel messages until the remote closes the channel or the consumer aborts.
async fn pump(mut channel: russh::Channel<client::Msg>, feed: ExecFeed) {
    let ExecFeed { events, mut abort } = feed;

    loop {
        tokio::select! {
            _ = &mut abort => {
                if let Err(e) = channel.close().await {
                    warn!(error = %e, "Failed to close aborted channel");
                }
                return;
            }
            msg = channel.wait() => {
                let event = match msg {
                    Some(ChannelMsg::Data { data }) => ExecEvent::Stdout(data.to_vec()),
                    Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                        ExecEvent::Stderr(data.to_vec())
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        ExecEvent::Exit(i32::try_from(exit_status).unwrap_or(-1))
                    }
                    Some(ChannelMsg::Close) | None => return,
                    Some(_) => continue,
                };
                if events.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        }
    }
}
