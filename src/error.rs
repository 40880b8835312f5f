//! Error types shared by the relay and its transport

use std::time::Duration;

/// Failures of the remote-shell transport (connection, authentication, channels).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("authentication failed for user {0}")]
    Auth(String),

    #[error("shell allocation failed: {0}")]
    Shell(String),

    #[error("file transfer channel error: {0}")]
    Sftp(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote connection closed")]
    Closed,
}

/// Failures local to a single upload or download.
///
/// None of these terminate the owning relay session.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("SSH connection not found")]
    NotConnected,

    #[error("upload session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid chunk count: {0}")]
    InvalidChunkCount(i64),

    #[error("declared chunk count {declared} exceeds the limit of {limit}")]
    TooManyChunks { declared: i64, limit: u64 },

    #[error("too many uploads in progress (limit {0})")]
    TooManyUploads(usize),

    #[error("chunk index {index} out of range (total {total})")]
    ChunkOutOfRange { index: i64, total: usize },

    #[error("missing chunk {index} of {filename}")]
    MissingChunk { filename: String, index: usize },

    #[error("File size mismatch: expected {expected} bytes, assembled {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("invalid chunk encoding: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("short read at chunk {index}: expected {expected} bytes, got {actual}")]
    ShortRead {
        index: u64,
        expected: usize,
        actual: usize,
    },

    #[error("a download is already in progress")]
    DownloadInProgress,

    #[error("client did not signal ready-to-receive within {0:?}")]
    ReadyTimeout(Duration),

    #[error("Chunk {index} confirmation timeout")]
    AckTimeout { index: u64 },

    #[error("transfer cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}
