//! Per-connection relay state
//!
//! A `RelaySession` owns at most one remote shell, the uploads in flight and
//! the active download for a single client connection. All of its state
//! changes happen on the task running [`RelaySession::run`]; transfers that
//! wait on the remote host run as child tasks tied to the session's
//! cancellation token.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::download::{DownloadOutcome, DownloadPump, DownloadSignal};
use super::remote_path;
use super::upload::UploadRegistry;
use crate::codec::Utf8Stream;
use crate::config::RelaySettings;
use crate::error::{TransferError, TransportError};
use crate::protocol::{ClientEvent, Credentials, ServerEvent};
use crate::transport::{Connector, PtySize, RemoteHost, ShellInput, ShellOutput};

/// Pending download signals before the session starts dropping them
const SIGNAL_BUFFER: usize = 64;

struct Remote {
    host: Arc<dyn RemoteHost>,
    shell_input: mpsc::UnboundedSender<ShellInput>,
    shell_output: mpsc::Receiver<ShellOutput>,
    decoder: Utf8Stream,
}

/// Signal side of the running download.
///
/// The session decides when a download is over: once the pump has stopped, once
/// a zero-chunk file has been announced, or once the last chunk has been
/// acknowledged.
struct ActiveDownload {
    signals: mpsc::Sender<DownloadSignal>,
    chunk_count: oneshot::Receiver<u64>,
    total_chunks: Option<u64>,
}

impl ActiveDownload {
    fn total_chunks(&mut self) -> Option<u64> {
        if self.total_chunks.is_none() {
            self.total_chunks = self.chunk_count.try_recv().ok();
        }
        self.total_chunks
    }

    fn is_running(&mut self) -> bool {
        !self.signals.is_closed() && self.total_chunks() != Some(0)
    }

    fn is_final_ack(&mut self, signal: DownloadSignal) -> bool {
        match signal {
            DownloadSignal::ChunkReceived(index) => self.total_chunks().is_some_and(|total| total.checked_sub(1) == Some(index)),
            DownloadSignal::Ready => false,
        }
    }
}

pub struct RelaySession {
    id: String,
    connector: Arc<dyn Connector>,
    settings: Arc<RelaySettings>,
    events: mpsc::UnboundedSender<ServerEvent>,
    remote: Option<Remote>,
    uploads: UploadRegistry,
    download: Option<ActiveDownload>,
    cancel: CancellationToken,
}

impl RelaySession {
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: Arc<RelaySettings>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        let uploads = UploadRegistry::new(settings.max_upload_chunks).with_max_pending(settings.max_pending_uploads);
        Self {
            id: format!("{:08x}", rand::random::<u32>()),
            connector,
            settings,
            events,
            remote: None,
            uploads,
            download: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.remote.is_some()
    }

    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Processes client events and shell output until the client goes away.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<ClientEvent>) {
        tracing::info!(session_id = %self.id, "Relay session started");

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => {
                        if self.handle_event(event).await.is_break() {
                            break;
                        }
                    }
                    None => break,
                },
                output = next_shell_output(&mut self.remote) => {
                    self.on_shell_output(output).await;
                }
            }
        }

        self.disconnect().await;
        tracing::info!(session_id = %self.id, "Relay session ended");
    }

    /// Dispatches one client event. Breaks when the client has disconnected.
    pub async fn handle_event(&mut self, event: ClientEvent) -> ControlFlow<()> {
        match event {
            ClientEvent::SshConnect(credentials) => self.connect(credentials).await,
            ClientEvent::SshData(text) => self.write_shell(text),
            ClientEvent::SshResize { rows, cols } => self.resize(rows, cols),
            ClientEvent::SshDisconnect => self.disconnect().await,
            ClientEvent::Disconnect => {
                tracing::info!(session_id = %self.id, "Client disconnected");
                return ControlFlow::Break(());
            }
            ClientEvent::UploadStart { filename, total_size, total_chunks } => {
                self.upload_start(filename, total_size, total_chunks)
            }
            ClientEvent::UploadChunk { filename, content, chunk_index, .. } => {
                self.upload_chunk(filename, content, chunk_index)
            }
            ClientEvent::UploadComplete { filename, total_size } => self.upload_complete(filename, total_size),
            ClientEvent::DownloadFile { filepath } => self.start_download(filepath),
            ClientEvent::ReadyToReceive => self.signal_download(DownloadSignal::Ready),
            ClientEvent::ChunkReceived { chunk_index, .. } => {
                self.signal_download(DownloadSignal::ChunkReceived(chunk_index))
            }
        }
        ControlFlow::Continue(())
    }

    fn emit(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(session_id = %self.id, "Dropping event, client channel closed");
        }
    }

    async fn connect(&mut self, credentials: Credentials) {
        if self.remote.is_some() {
            tracing::info!(session_id = %self.id, "Replacing existing shell");
            self.disconnect().await;
        }

        let timeout = self.settings.connect_timeout();
        let result = match tokio::time::timeout(timeout, self.open_remote(&credentials)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        match result {
            Ok(remote) => {
                tracing::info!(session_id = %self.id, host = %credentials.host, "Shell ready");
                self.remote = Some(remote);
                self.emit(ServerEvent::SshReady);
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, host = %credentials.host, error = %e, "SSH connection failed");
                self.emit(ServerEvent::SshError { message: e.to_string() });
            }
        }
    }

    /// Connects and allocates the shell; nothing stays open if either step fails.
    async fn open_remote(&self, credentials: &Credentials) -> Result<Remote, TransportError> {
        let host = self.connector.connect(credentials).await?;
        match host.open_shell(PtySize::default()).await {
            Ok(shell) => Ok(Remote {
                host,
                shell_input: shell.input,
                shell_output: shell.output,
                decoder: Utf8Stream::new(),
            }),
            Err(e) => {
                host.close().await;
                Err(e)
            }
        }
    }

    fn write_shell(&self, text: String) {
        match &self.remote {
            Some(remote) => {
                if remote.shell_input.send(ShellInput::Data(text.into_bytes())).is_err() {
                    tracing::debug!(session_id = %self.id, "Shell input closed");
                }
            }
            None => tracing::debug!(session_id = %self.id, "Ignoring input, no shell"),
        }
    }

    fn resize(&self, rows: u16, cols: u16) {
        if let Some(remote) = &self.remote {
            tracing::debug!(session_id = %self.id, rows, cols, "Resizing shell");
            let _ = remote.shell_input.send(ShellInput::Resize(PtySize { rows, cols }));
        }
    }

    async fn on_shell_output(&mut self, output: ShellOutput) {
        match output {
            ShellOutput::Data(bytes) => {
                let text = match self.remote.as_mut() {
                    Some(remote) => remote.decoder.decode(&bytes),
                    None => return,
                };
                if !text.is_empty() {
                    self.emit(ServerEvent::SshData(text));
                }
            }
            ShellOutput::Error(message) => {
                tracing::warn!(session_id = %self.id, error = %message, "Shell error");
                self.emit(ServerEvent::SshError { message });
                self.disconnect().await;
            }
            ShellOutput::Closed => {
                tracing::info!(session_id = %self.id, "Shell closed by remote");
                if let Some(remote) = self.remote.as_mut() {
                    let tail = remote.decoder.finish();
                    if !tail.is_empty() {
                        self.emit(ServerEvent::SshData(tail));
                    }
                }
                self.disconnect().await;
            }
        }
    }

    /// Tears down the shell and every transfer. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.download = None;

        let dropped = self.uploads.clear();
        if dropped > 0 {
            tracing::info!(session_id = %self.id, dropped, "Discarded pending uploads");
        }

        if let Some(remote) = self.remote.take() {
            let _ = remote.shell_input.send(ShellInput::Close);
            remote.host.close().await;
            self.emit(ServerEvent::SshClose);
            tracing::info!(session_id = %self.id, "SSH connection closed");
        }
    }

    fn upload_start(&mut self, filename: String, total_size: u64, total_chunks: i64) {
        match self.uploads.start(&filename, total_size, total_chunks) {
            Ok(()) => {
                tracing::info!(session_id = %self.id, filename = %filename, total_size, total_chunks, "Starting upload");
                self.emit(ServerEvent::UploadStarted { filename });
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, filename = %filename, error = %e, "Upload start rejected");
                self.emit(ServerEvent::UploadError {
                    message: format!("Upload start failed: {}", e),
                });
            }
        }
    }

    fn upload_chunk(&mut self, filename: String, content: String, chunk_index: i64) {
        match self.uploads.store_chunk(&filename, chunk_index, &content) {
            Ok(()) => self.emit(ServerEvent::ChunkReceived {
                filename,
                chunk_index: chunk_index as u64,
            }),
            Err(e) => {
                tracing::warn!(session_id = %self.id, filename = %filename, chunk_index, error = %e, "Chunk rejected");
                self.emit(ServerEvent::UploadError {
                    message: format!("Chunk upload failed: {}", e),
                });
            }
        }
    }

    fn upload_complete(&mut self, filename: String, total_size: u64) {
        let buffer = match self.uploads.complete(&filename, total_size) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!(session_id = %self.id, filename = %filename, error = %e, "Upload failed");
                self.emit(ServerEvent::UploadError { message: e.to_string() });
                return;
            }
        };

        let Some(remote) = &self.remote else {
            self.emit(ServerEvent::UploadError {
                message: TransferError::NotConnected.to_string(),
            });
            return;
        };

        let target = remote_path(&filename, &self.settings.remote_home, &self.settings.remote_base_dir);
        let host = remote.host.clone();
        let events = self.events.clone();
        let cancel = self.cancel.child_token();
        let session_id = self.id.clone();

        tokio::spawn(async move {
            let size = buffer.len() as u64;
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
                result = write_upload(host, &target, buffer) => result,
            };

            let event = match result {
                Ok(()) => {
                    tracing::info!(session_id = %session_id, target = %target, size, "Upload written");
                    ServerEvent::UploadSuccess { filename, size }
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, target = %target, error = %e, "Upload write failed");
                    ServerEvent::UploadError { message: e.to_string() }
                }
            };
            let _ = events.send(event);
        });
    }

    fn start_download(&mut self, filepath: String) {
        let Some(remote) = &self.remote else {
            self.emit(ServerEvent::DownloadError {
                message: TransferError::NotConnected.to_string(),
            });
            return;
        };
        if self.download.as_mut().is_some_and(ActiveDownload::is_running) {
            self.emit(ServerEvent::DownloadError {
                message: TransferError::DownloadInProgress.to_string(),
            });
            return;
        }

        let path = remote_path(&filepath, &self.settings.remote_home, &self.settings.remote_base_dir);
        tracing::info!(session_id = %self.id, path = %path, "Download requested");

        let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_BUFFER);
        let (count_tx, count_rx) = oneshot::channel();
        let pump = DownloadPump::new(path, self.settings.pump_config()).notify_chunk_count(count_tx);
        tokio::spawn(drive_download(
            pump,
            remote.host.clone(),
            self.events.clone(),
            signals_rx,
            self.cancel.child_token(),
            self.id.clone(),
        ));

        self.download = Some(ActiveDownload {
            signals: signals_tx,
            chunk_count: count_rx,
            total_chunks: None,
        });
    }

    fn signal_download(&mut self, signal: DownloadSignal) {
        let Some(active) = self.download.as_mut().filter(|active| !active.signals.is_closed()) else {
            tracing::debug!(session_id = %self.id, ?signal, "No active download for signal");
            return;
        };

        if let Err(e) = active.signals.try_send(signal) {
            tracing::warn!(session_id = %self.id, ?signal, error = %e, "Dropping download signal");
        } else if active.is_final_ack(signal) {
            // the pump drains the buffered ack after the sender is gone
            tracing::debug!(session_id = %self.id, "Final chunk acknowledged");
            self.download = None;
        }
    }
}

async fn next_shell_output(remote: &mut Option<Remote>) -> ShellOutput {
    match remote {
        Some(remote) => remote.shell_output.recv().await.unwrap_or(ShellOutput::Closed),
        None => std::future::pending().await,
    }
}

async fn write_upload(host: Arc<dyn RemoteHost>, target: &str, buffer: Vec<u8>) -> Result<(), TransferError> {
    let fs = host.open_fs().await?;
    fs.write_file(target, &buffer).await?;
    Ok(())
}

async fn drive_download(
    mut pump: DownloadPump,
    host: Arc<dyn RemoteHost>,
    events: mpsc::UnboundedSender<ServerEvent>,
    mut signals: mpsc::Receiver<DownloadSignal>,
    cancel: CancellationToken,
    session_id: String,
) {
    let result = tokio::select! {
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        result = run_download(&mut pump, host, &events, &mut signals) => result,
    };
    drop(signals);

    match result {
        Ok(outcome) => {
            tracing::info!(session_id = %session_id, path = %pump.path(), size = outcome.size, chunks = outcome.chunks_sent, "Download complete");
        }
        Err(e) => {
            tracing::warn!(session_id = %session_id, path = %pump.path(), error = %e, "Download failed");
            let _ = events.send(ServerEvent::DownloadError { message: e.to_string() });
        }
    }
}

async fn run_download(
    pump: &mut DownloadPump,
    host: Arc<dyn RemoteHost>,
    events: &mpsc::UnboundedSender<ServerEvent>,
    signals: &mut mpsc::Receiver<DownloadSignal>,
) -> Result<DownloadOutcome, TransferError> {
    let fs = host.open_fs().await?;
    pump.run(fs.as_ref(), events, signals).await
}
