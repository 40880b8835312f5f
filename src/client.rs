//! Command-line client for the relay protocol
//!
//! Speaks the same websocket events as the browser terminal, one request at a
//! time, so a file can be pushed to or pulled from the remote host without a
//! browser.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use futures::{SinkExt, StreamExt};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

use crate::codec::{self, UPLOAD_CHUNK_SIZE};
use crate::protocol::{ClientEvent, Credentials, ServerEvent};

/// How long to wait for any single reply from the relay
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RelayClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    response_timeout: Duration,
}

impl RelayClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to relay at {}", url))?;
        tracing::debug!(url, "Connected to relay");
        Ok(Self {
            ws,
            response_timeout: RESPONSE_TIMEOUT,
        })
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    async fn send(&mut self, event: &ClientEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        self.ws
            .send(Message::Text(json.into()))
            .await
            .context("Failed to send to relay")
    }

    /// Next relay event that is not terminal output.
    async fn next_event(&mut self) -> Result<ServerEvent> {
        loop {
            let frame = tokio::time::timeout(self.response_timeout, self.ws.next())
                .await
                .map_err(|_| anyhow!("Relay did not respond within {:?}", self.response_timeout))?;

            let msg = match frame {
                Some(msg) => msg.context("Relay connection failed")?,
                None => bail!("Relay closed the connection"),
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => bail!("Relay closed the connection"),
                _ => continue,
            };

            match serde_json::from_str::<ServerEvent>(text.as_str()) {
                Ok(ServerEvent::SshData(output)) => {
                    tracing::trace!(bytes = output.len(), "Skipping shell output");
                }
                Ok(event) => return Ok(event),
                Err(e) => tracing::warn!(error = %e, "Ignoring unrecognised relay frame"),
            }
        }
    }

    /// Opens the remote shell; file transfers need it.
    pub async fn ssh_connect(&mut self, credentials: Credentials) -> Result<()> {
        let host = credentials.host.clone();
        self.send(&ClientEvent::SshConnect(credentials)).await?;
        loop {
            match self.next_event().await? {
                ServerEvent::SshReady => return Ok(()),
                ServerEvent::SshError { message } => bail!("SSH connection to {} failed: {}", host, message),
                other => tracing::debug!(event = other.name(), "Ignoring event while connecting"),
            }
        }
    }

    /// Uploads `local` to `remote_name`, waiting for each chunk's acknowledgement.
    ///
    /// Returns the size the relay reports having written.
    pub async fn upload(&mut self, local: &Path, remote_name: &str) -> Result<u64> {
        let mut file = File::open(local)
            .await
            .with_context(|| format!("Failed to open {}", local.display()))?;
        let total_size = file.metadata().await?.len();
        // an empty file still travels as one empty chunk
        let total_chunks = codec::total_chunks(total_size, UPLOAD_CHUNK_SIZE).max(1);

        self.send(&ClientEvent::UploadStart {
            filename: remote_name.to_string(),
            total_size,
            total_chunks: total_chunks as i64,
        })
        .await?;
        self.expect_upload_started(remote_name).await?;

        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
        for index in 0..total_chunks {
            let len = read_full(&mut file, &mut buf)
                .await
                .with_context(|| format!("Failed to read {}", local.display()))?;
            self.send(&ClientEvent::UploadChunk {
                filename: remote_name.to_string(),
                content: codec::encode_chunk(&buf[..len]),
                chunk_index: index as i64,
                total_chunks: total_chunks as i64,
                size: len as u64,
            })
            .await?;
            self.expect_chunk_ack(remote_name, index).await?;
            tracing::debug!(chunk = index + 1, total_chunks, "Chunk acknowledged");
        }

        self.send(&ClientEvent::UploadComplete {
            filename: remote_name.to_string(),
            total_size,
        })
        .await?;
        loop {
            match self.next_event().await? {
                ServerEvent::UploadSuccess { filename, size } if filename == remote_name => return Ok(size),
                ServerEvent::UploadError { message } => bail!("Upload failed: {}", message),
                other => tracing::debug!(event = other.name(), "Ignoring event while completing upload"),
            }
        }
    }

    async fn expect_upload_started(&mut self, remote_name: &str) -> Result<()> {
        loop {
            match self.next_event().await? {
                ServerEvent::UploadStarted { filename } if filename == remote_name => return Ok(()),
                ServerEvent::UploadError { message } => bail!("Upload rejected: {}", message),
                other => tracing::debug!(event = other.name(), "Ignoring event while starting upload"),
            }
        }
    }

    async fn expect_chunk_ack(&mut self, remote_name: &str, index: u64) -> Result<()> {
        loop {
            match self.next_event().await? {
                ServerEvent::ChunkReceived { filename, chunk_index }
                    if filename == remote_name && chunk_index == index =>
                {
                    return Ok(());
                }
                ServerEvent::UploadError { message } => bail!("Chunk {} failed: {}", index, message),
                other => tracing::debug!(event = other.name(), "Ignoring event while awaiting chunk ack"),
            }
        }
    }

    /// Downloads `remote` into `dest`, acknowledging every chunk.
    ///
    /// Fails if the bytes received do not add up to the size announced in `file-info`.
    pub async fn download(&mut self, remote: &str, dest: &Path) -> Result<u64> {
        self.send(&ClientEvent::DownloadFile {
            filepath: remote.to_string(),
        })
        .await?;

        let (filename, size, total_chunks) = loop {
            match self.next_event().await? {
                ServerEvent::FileInfo { filename, size, total_chunks } => break (filename, size, total_chunks),
                ServerEvent::DownloadError { message } => bail!("Download failed: {}", message),
                other => tracing::debug!(event = other.name(), "Ignoring event while requesting download"),
            }
        };
        tracing::info!(filename = %filename, size, total_chunks, "Receiving file");

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut out = File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        if total_chunks == 0 {
            out.flush().await?;
            return Ok(0);
        }

        self.send(&ClientEvent::ReadyToReceive).await?;

        let mut received = 0u64;
        loop {
            let (chunk_index, content, is_last) = match self.next_event().await? {
                ServerEvent::FileChunk { chunk_index, content, is_last } => (chunk_index, content, is_last),
                ServerEvent::DownloadError { message } => bail!("Download failed: {}", message),
                other => {
                    tracing::debug!(event = other.name(), "Ignoring event during download");
                    continue;
                }
            };

            let bytes = codec::decode_chunk(&content).with_context(|| format!("Chunk {} is not valid base64", chunk_index))?;
            out.write_all(&bytes)
                .await
                .with_context(|| format!("Failed to write {}", dest.display()))?;
            received += bytes.len() as u64;

            self.send(&ClientEvent::ChunkReceived {
                chunk_index,
                filename: Some(filename.clone()),
            })
            .await?;

            if is_last {
                break;
            }
        }
        out.flush().await?;

        if received != size {
            bail!("Received {} bytes but the relay announced {}", received, size);
        }
        Ok(received)
    }

    /// Ends the relay session and closes the socket.
    pub async fn close(mut self) -> Result<()> {
        self.send(&ClientEvent::Disconnect).await?;
        let _ = self.ws.close(None).await;
        Ok(())
    }
}

/// Fills `buf` unless the file ends first; returns the number of bytes read.
async fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Upload a local file through the relay
pub async fn push_file(url: &str, credentials: Credentials, local: &Path, remote_name: &str) -> Result<()> {
    let mut client = RelayClient::connect(url).await?;
    println!("Connecting to {}...", credentials.host);
    client.ssh_connect(credentials).await?;

    println!("Uploading {}...", local.display());
    let size = client.upload(local, remote_name).await?;
    println!("Uploaded {} ({} bytes)", remote_name, size);

    client.close().await
}

/// Download a remote file through the relay
pub async fn pull_file(url: &str, credentials: Credentials, remote: &str, local: &Path) -> Result<()> {
    let mut client = RelayClient::connect(url).await?;
    println!("Connecting to {}...", credentials.host);
    client.ssh_connect(credentials).await?;

    println!("Downloading {}...", remote);
    let size = client.download(remote, local).await?;
    println!("Downloaded {} to {} ({} bytes)", remote, local.display(), size);

    client.close().await
}
