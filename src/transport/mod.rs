//! Remote-shell transport seam
//!
//! The relay treats the remote host as two things: an interactive shell byte
//! stream and a file-transfer sub-channel. Both sit behind traits so the relay
//! logic never touches SSH directly.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::Credentials;

pub mod ssh;

#[cfg(test)]
pub(crate) mod memory;

pub use ssh::SshConnector;

/// Terminal size requested when the shell is allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Requests from the relay to a live shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellInput {
    Data(Vec<u8>),
    Resize(PtySize),
    Close,
}

/// Notifications from a live shell back to the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutput {
    Data(Vec<u8>),
    Error(String),
    Closed,
}

/// Both directions of an allocated pseudo-terminal shell
pub struct ShellChannel {
    pub input: mpsc::UnboundedSender<ShellInput>,
    pub output: mpsc::Receiver<ShellOutput>,
}

/// What a remote `stat` reports about a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub kind: FileKind,
    pub size: u64,
}

/// File operations over one file-transfer sub-channel
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Returns `Ok(None)` when the path does not exist.
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>, TransportError>;

    /// Reads up to `len` bytes starting at `offset`.
    async fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, TransportError>;

    /// Creates or truncates `path` and writes `contents` in full.
    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), TransportError>;
}

/// An authenticated connection to a remote host
#[async_trait]
pub trait RemoteHost: Send + Sync {
    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, TransportError>;

    async fn open_fs(&self) -> Result<Arc<dyn RemoteFs>, TransportError>;

    /// Tears the connection down. Safe to call more than once.
    async fn close(&self);
}

/// Opens remote connections from client-supplied credentials
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteHost>, TransportError>;
}
