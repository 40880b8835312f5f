//! SSH transport: password login, a pseudo-terminal shell, and SFTP

use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::{
    Connector, FileKind, PtySize, RemoteFs, RemoteHost, RemoteStat, ShellChannel, ShellInput,
    ShellOutput,
};
use crate::error::TransportError;
use crate::protocol::Credentials;

const TERM: &str = "xterm-256color";

struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // Host keys are not pinned; the relay trusts whatever the user typed.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Connects to SSH servers with password authentication
#[derive(Debug, Clone)]
pub struct SshConnector {
    keepalive: Duration,
}

impl SshConnector {
    pub fn new(keepalive: Duration) -> Self {
        Self { keepalive }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteHost>, TransportError> {
        let config = client::Config {
            keepalive_interval: Some(self.keepalive),
            ..Default::default()
        };

        tracing::info!(host = %credentials.host, port = credentials.port, user = %credentials.username, "Opening SSH connection");

        let mut handle = client::connect(
            Arc::new(config),
            (credentials.host.as_str(), credentials.port),
            ClientHandler,
        )
        .await
        .map_err(|e| TransportError::Connect {
            host: credentials.host.clone(),
            port: credentials.port,
            reason: e.to_string(),
        })?;

        let auth = handle
            .authenticate_password(credentials.username.clone(), credentials.password.clone())
            .await
            .map_err(|e| TransportError::Connect {
                host: credentials.host.clone(),
                port: credentials.port,
                reason: e.to_string(),
            })?;

        if !auth.success() {
            let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
            return Err(TransportError::Auth(credentials.username.clone()));
        }

        tracing::info!(host = %credentials.host, "SSH connection established");

        Ok(Arc::new(SshHost {
            handle,
            closed: AtomicBool::new(false),
        }))
    }
}

struct SshHost {
    handle: Handle<ClientHandler>,
    closed: AtomicBool,
}

/// Waits for the reply to a `want_reply` channel request.
async fn await_reply(channel: &mut Channel<Msg>, request: &str) -> Result<(), TransportError> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(TransportError::Shell(format!("server refused {} request", request)));
            }
            Some(ChannelMsg::Close) | None => return Err(TransportError::Closed),
            Some(_) => {}
        }
    }
}

#[async_trait]
impl RemoteHost for SshHost {
    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, TransportError> {
        let shell_err = |e: russh::Error| TransportError::Shell(e.to_string());

        let mut channel = self.handle.channel_open_session().await.map_err(shell_err)?;
        channel
            .request_pty(true, TERM, size.cols as u32, size.rows as u32, 0, 0, &[])
            .await
            .map_err(shell_err)?;
        await_reply(&mut channel, "pty").await?;
        channel.request_shell(true).await.map_err(shell_err)?;
        await_reply(&mut channel, "shell").await?;

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<ShellInput>();
        let (output_tx, output_rx) = mpsc::channel::<ShellOutput>(256);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                            if output_tx.send(ShellOutput::Data(data.to_vec())).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            tracing::debug!(exit_status, "Remote shell exited");
                        }
                        Some(ChannelMsg::Close) | None => {
                            let _ = output_tx.send(ShellOutput::Closed).await;
                            break;
                        }
                        Some(_) => {}
                    },
                    input = input_rx.recv() => match input {
                        Some(ShellInput::Data(bytes)) => {
                            if let Err(e) = channel.data(&bytes[..]).await {
                                let _ = output_tx.send(ShellOutput::Error(e.to_string())).await;
                                break;
                            }
                        }
                        Some(ShellInput::Resize(size)) => {
                            if let Err(e) = channel.window_change(size.cols as u32, size.rows as u32, 0, 0).await {
                                tracing::warn!(error = %e, "Failed to resize remote PTY");
                            }
                        }
                        Some(ShellInput::Close) | None => {
                            let _ = channel.close().await;
                            break;
                        }
                    },
                }
            }
            tracing::debug!("Shell channel task ended");
        });

        Ok(ShellChannel {
            input: input_tx,
            output: output_rx,
        })
    }

    async fn open_fs(&self) -> Result<Arc<dyn RemoteFs>, TransportError> {
        let sftp_err = |e: russh::Error| TransportError::Sftp(e.to_string());

        let channel = self.handle.channel_open_session().await.map_err(sftp_err)?;
        channel.request_subsystem(true, "sftp").await.map_err(sftp_err)?;
        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| TransportError::Sftp(format!("Failed to initialize SFTP: {}", e)))?;

        Ok(Arc::new(SftpFs { session }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.handle.disconnect(Disconnect::ByApplication, "", "en").await {
            tracing::debug!(error = %e, "SSH disconnect returned an error");
        }
    }
}

struct SftpFs {
    session: SftpSession,
}

fn sftp_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Sftp(e.to_string())
}

#[async_trait]
impl RemoteFs for SftpFs {
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>, TransportError> {
        if !self.session.try_exists(path).await.map_err(sftp_error)? {
            return Ok(None);
        }
        let attrs = self.session.metadata(path).await.map_err(sftp_error)?;
        let kind = if attrs.is_regular() {
            FileKind::Regular
        } else if attrs.is_dir() {
            FileKind::Directory
        } else {
            FileKind::Other
        };
        Ok(Some(RemoteStat {
            kind,
            size: attrs.size.unwrap_or(0),
        }))
    }

    async fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut file = self.session.open(path).await.map_err(sftp_error)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(sftp_error)?;

        let mut buf = Vec::with_capacity(len);
        let mut limited = file.take(len as u64);
        limited.read_to_end(&mut buf).await.map_err(sftp_error)?;
        Ok(buf)
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), TransportError> {
        let mut file = self.session.create(path).await.map_err(sftp_error)?;
        file.write_all(contents).await.map_err(sftp_error)?;
        file.shutdown().await.map_err(sftp_error)?;
        Ok(())
    }
}
