//! Flow-controlled streaming of a remote file to the client
//!
//! The pump reads one bounded window of the remote file at a time and does not
//! read or send the next window until the client has acknowledged the current
//! one by index.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout_at};

use crate::codec;
use crate::error::TransferError;
use crate::protocol::ServerEvent;
use crate::transport::{FileKind, RemoteFs};

/// Client signals routed to the active download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadSignal {
    Ready,
    ChunkReceived(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Requested,
    StatChecked,
    AwaitingClientReady,
    Sending(u64),
    Complete,
    Failed(String),
}

/// Timing and sizing knobs for one download
#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    pub chunk_size: usize,
    pub ack_timeout: Duration,
    pub ready_timeout: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            chunk_size: codec::DOWNLOAD_CHUNK_SIZE,
            ack_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub filename: String,
    pub size: u64,
    pub chunks_sent: u64,
}

pub struct DownloadPump {
    path: String,
    config: PumpConfig,
    state: DownloadState,
    chunk_count: Option<oneshot::Sender<u64>>,
}

impl DownloadPump {
    pub fn new(path: impl Into<String>, config: PumpConfig) -> Self {
        Self {
            path: path.into(),
            config,
            state: DownloadState::Requested,
            chunk_count: None,
        }
    }

    /// Reports the chunk count on `tx` just before `file-info` goes out.
    pub fn notify_chunk_count(mut self, tx: oneshot::Sender<u64>) -> Self {
        self.chunk_count = Some(tx);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> &DownloadState {
        &self.state
    }

    fn transition(&mut self, next: DownloadState) {
        tracing::debug!(path = %self.path, from = ?self.state, to = ?next, "Download state change");
        self.state = next;
    }

    /// Drives the transfer to completion or failure.
    pub async fn run(
        &mut self,
        fs: &dyn RemoteFs,
        events: &mpsc::UnboundedSender<ServerEvent>,
        signals: &mut mpsc::Receiver<DownloadSignal>,
    ) -> Result<DownloadOutcome, TransferError> {
        match self.pump(fs, events, signals).await {
            Ok(outcome) => {
                self.transition(DownloadState::Complete);
                Ok(outcome)
            }
            Err(e) => {
                self.transition(DownloadState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn pump(
        &mut self,
        fs: &dyn RemoteFs,
        events: &mpsc::UnboundedSender<ServerEvent>,
        signals: &mut mpsc::Receiver<DownloadSignal>,
    ) -> Result<DownloadOutcome, TransferError> {
        let stat = fs
            .stat(&self.path)
            .await?
            .ok_or_else(|| TransferError::NotFound(self.path.clone()))?;
        if stat.kind != FileKind::Regular {
            return Err(TransferError::NotAFile(self.path.clone()));
        }
        self.transition(DownloadState::StatChecked);

        let size = stat.size;
        let chunk_size = self.config.chunk_size;
        let total_chunks = codec::total_chunks(size, chunk_size);
        let filename = self.path.rsplit('/').next().unwrap_or(&self.path).to_string();

        tracing::info!(path = %self.path, size, total_chunks, "Starting download");
        if let Some(tx) = self.chunk_count.take() {
            let _ = tx.send(total_chunks);
        }
        emit(
            events,
            ServerEvent::FileInfo {
                filename: filename.clone(),
                size,
                total_chunks,
            },
        )?;

        if total_chunks == 0 {
            return Ok(DownloadOutcome {
                filename,
                size,
                chunks_sent: 0,
            });
        }

        self.transition(DownloadState::AwaitingClientReady);
        self.wait_ready(signals).await?;

        for index in 0..total_chunks {
            self.transition(DownloadState::Sending(index));

            let range = codec::chunk_range(index, size, chunk_size);
            let expected = (range.end - range.start) as usize;
            let bytes = fs.read_range(&self.path, range.start, expected).await?;
            if bytes.len() != expected {
                return Err(TransferError::ShortRead {
                    index,
                    expected,
                    actual: bytes.len(),
                });
            }

            tracing::debug!(path = %self.path, chunk = index + 1, total_chunks, start = range.start, end = range.end, "Sending chunk");
            emit(
                events,
                ServerEvent::FileChunk {
                    chunk_index: index,
                    content: codec::encode_chunk(&bytes),
                    is_last: index == total_chunks - 1,
                },
            )?;
            drop(bytes);

            self.wait_ack(index, signals).await?;
        }

        tracing::info!(path = %self.path, size, "Download finished");
        Ok(DownloadOutcome {
            filename,
            size,
            chunks_sent: total_chunks,
        })
    }

    async fn wait_ready(&self, signals: &mut mpsc::Receiver<DownloadSignal>) -> Result<(), TransferError> {
        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            match timeout_at(deadline, signals.recv()).await {
                Ok(Some(DownloadSignal::Ready)) => return Ok(()),
                Ok(Some(DownloadSignal::ChunkReceived(index))) => {
                    tracing::debug!(path = %self.path, index, "Ignoring acknowledgement before ready");
                }
                Ok(None) => return Err(TransferError::Cancelled),
                Err(_) => return Err(TransferError::ReadyTimeout(self.config.ready_timeout)),
            }
        }
    }

    /// Waits for the acknowledgement of `index`; other indices do not extend the deadline.
    async fn wait_ack(&self, index: u64, signals: &mut mpsc::Receiver<DownloadSignal>) -> Result<(), TransferError> {
        let deadline = Instant::now() + self.config.ack_timeout;
        loop {
            match timeout_at(deadline, signals.recv()).await {
                Ok(Some(DownloadSignal::ChunkReceived(acked))) if acked == index => return Ok(()),
                Ok(Some(other)) => {
                    tracing::debug!(path = %self.path, waiting_for = index, signal = ?other, "Ignoring stale signal");
                }
                Ok(None) => return Err(TransferError::Cancelled),
                Err(_) => return Err(TransferError::AckTimeout { index }),
            }
        }
    }
}

fn emit(events: &mpsc::UnboundedSender<ServerEvent>, event: ServerEvent) -> Result<(), TransferError> {
    events.send(event).map_err(|_| TransferError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHost;

    const MIB: usize = 1024 * 1024;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    struct Harness {
        events: mpsc::UnboundedReceiver<ServerEvent>,
        signals: mpsc::Sender<DownloadSignal>,
        task: tokio::task::JoinHandle<(DownloadState, Result<DownloadOutcome, TransferError>)>,
    }

    fn spawn_pump(host: &MemoryHost, path: &str) -> Harness {
        let fs = host.fs.clone();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signals_tx, mut signals_rx) = mpsc::channel(16);
        let mut pump = DownloadPump::new(path, PumpConfig::default());
        let task = tokio::spawn(async move {
            let result = pump.run(fs.as_ref(), &events_tx, &mut signals_rx).await;
            (pump.state().clone(), result)
        });
        Harness {
            events: events_rx,
            signals: signals_tx,
            task,
        }
    }

    #[tokio::test]
    async fn test_streams_twelve_mib_in_three_chunks() {
        let data = sample(12 * MIB);
        let host = MemoryHost::new().with_file("/root/big.bin", data.clone());
        let mut h = spawn_pump(&host, "/root/big.bin");

        match h.events.recv().await.unwrap() {
            ServerEvent::FileInfo { filename, size, total_chunks } => {
                assert_eq!(filename, "big.bin");
                assert_eq!(size, data.len() as u64);
                assert_eq!(total_chunks, 3);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(host.fs.reads(), 0);
        h.signals.send(DownloadSignal::Ready).await.unwrap();

        let mut received = Vec::new();
        let mut sizes = Vec::new();
        for expected_index in 0..3u64 {
            match h.events.recv().await.unwrap() {
                ServerEvent::FileChunk { chunk_index, content, is_last } => {
                    assert_eq!(chunk_index, expected_index);
                    assert_eq!(is_last, expected_index == 2);
                    // the next window is not read before this one is acknowledged
                    assert_eq!(host.fs.reads() as u64, expected_index + 1);
                    let bytes = codec::decode_chunk(&content).unwrap();
                    sizes.push(bytes.len());
                    received.extend_from_slice(&bytes);
                }
                other => panic!("unexpected event: {:?}", other),
            }
            h.signals.send(DownloadSignal::ChunkReceived(expected_index)).await.unwrap();
        }

        let (state, result) = h.task.await.unwrap();
        assert_eq!(sizes, vec![5 * MIB, 5 * MIB, 2 * MIB]);
        assert_eq!(received, data);
        assert_eq!(state, DownloadState::Complete);
        assert_eq!(result.unwrap().chunks_sent, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_times_out() {
        let host = MemoryHost::new().with_file("/root/two.bin", sample(6 * MIB));
        let mut h = spawn_pump(&host, "/root/two.bin");

        assert!(matches!(h.events.recv().await, Some(ServerEvent::FileInfo { .. })));
        h.signals.send(DownloadSignal::Ready).await.unwrap();
        assert!(matches!(h.events.recv().await, Some(ServerEvent::FileChunk { chunk_index: 0, .. })));

        let (state, result) = h.task.await.unwrap();
        assert!(matches!(result, Err(TransferError::AckTimeout { index: 0 })));
        assert!(matches!(state, DownloadState::Failed(_)));
        // no further chunks after the timeout
        assert!(h.events.recv().await.is_none());
        assert_eq!(host.fs.reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_for_other_index_is_ignored() {
        let host = MemoryHost::new().with_file("/root/two.bin", sample(6 * MIB));
        let mut h = spawn_pump(&host, "/root/two.bin");

        assert!(matches!(h.events.recv().await, Some(ServerEvent::FileInfo { .. })));
        h.signals.send(DownloadSignal::Ready).await.unwrap();
        assert!(matches!(h.events.recv().await, Some(ServerEvent::FileChunk { chunk_index: 0, .. })));

        h.signals.send(DownloadSignal::ChunkReceived(7)).await.unwrap();
        h.signals.send(DownloadSignal::ChunkReceived(0)).await.unwrap();
        assert!(matches!(
            h.events.recv().await,
            Some(ServerEvent::FileChunk { chunk_index: 1, is_last: true, .. })
        ));
        h.signals.send(DownloadSignal::ChunkReceived(1)).await.unwrap();

        let (_, result) = h.task.await.unwrap();
        assert_eq!(result.unwrap().size, 6 * MIB as u64);
    }

    #[tokio::test]
    async fn test_zero_byte_file_skips_send_loop() {
        let host = MemoryHost::new().with_file("/root/empty", Vec::new());
        let mut h = spawn_pump(&host, "/root/empty");

        assert_eq!(
            h.events.recv().await.unwrap(),
            ServerEvent::FileInfo {
                filename: "empty".to_string(),
                size: 0,
                total_chunks: 0,
            }
        );
        let (state, result) = h.task.await.unwrap();
        assert_eq!(state, DownloadState::Complete);
        assert_eq!(result.unwrap().chunks_sent, 0);
        assert!(h.events.recv().await.is_none());
        assert_eq!(host.fs.reads(), 0);
    }

    #[tokio::test]
    async fn test_rejects_missing_and_non_regular_paths() {
        let host = MemoryHost::new().with_dir("/root/logs");

        let h = spawn_pump(&host, "/root/logs");
        let (_, result) = h.task.await.unwrap();
        assert!(matches!(result, Err(TransferError::NotAFile(_))));

        let h = spawn_pump(&host, "/root/nope.txt");
        let (state, result) = h.task.await.unwrap();
        assert!(matches!(result, Err(TransferError::NotFound(_))));
        assert!(matches!(state, DownloadState::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_wait_is_bounded() {
        let host = MemoryHost::new().with_file("/root/a.txt", b"abc".to_vec());
        let mut h = spawn_pump(&host, "/root/a.txt");
        assert!(matches!(h.events.recv().await, Some(ServerEvent::FileInfo { .. })));

        let (_, result) = h.task.await.unwrap();
        assert!(matches!(result, Err(TransferError::ReadyTimeout(_))));
        assert_eq!(host.fs.reads(), 0);
    }

    #[tokio::test]
    async fn test_dropped_signals_cancel() {
        let host = MemoryHost::new().with_file("/root/a.txt", b"abc".to_vec());
        let mut h = spawn_pump(&host, "/root/a.txt");
        assert!(matches!(h.events.recv().await, Some(ServerEvent::FileInfo { .. })));
        drop(h.signals);

        let (_, result) = h.task.await.unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn test_chunk_count_reported_and_final_ack_survives_sender_drop() {
        let host = MemoryHost::new().with_file("/root/a.txt", b"abc".to_vec());
        let fs = host.fs.clone();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (signals_tx, mut signals_rx) = mpsc::channel(16);
        let (count_tx, mut count_rx) = oneshot::channel();
        let mut pump = DownloadPump::new("/root/a.txt", PumpConfig::default()).notify_chunk_count(count_tx);
        let task = tokio::spawn(async move { pump.run(fs.as_ref(), &events_tx, &mut signals_rx).await });

        assert!(matches!(events_rx.recv().await, Some(ServerEvent::FileInfo { total_chunks: 1, .. })));
        assert_eq!(count_rx.try_recv().unwrap(), 1);

        signals_tx.send(DownloadSignal::Ready).await.unwrap();
        assert!(matches!(events_rx.recv().await, Some(ServerEvent::FileChunk { is_last: true, .. })));
        // the last acknowledgement is still delivered once the sender is gone
        signals_tx.send(DownloadSignal::ChunkReceived(0)).await.unwrap();
        drop(signals_tx);

        assert_eq!(task.await.unwrap().unwrap().chunks_sent, 1);
    }
}
