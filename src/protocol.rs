//! Events exchanged over the relay message channel
//!
//! Every websocket text frame is one JSON object of the form
//! `{"event": "<name>", "data": <payload>}`. Unit events omit `data`.

use serde::{Deserialize, Serialize};

fn default_ssh_port() -> u16 {
    22
}

/// Remote-shell login parameters carried by `ssh:connect`.
#[derive(Clone, Deserialize, Serialize)]
pub struct Credentials {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Messages sent from the browser (or CLI client) to the relay
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "ssh:connect")]
    SshConnect(Credentials),
    /// Raw terminal input
    #[serde(rename = "ssh:data")]
    SshData(String),
    #[serde(rename = "ssh:resize")]
    SshResize { rows: u16, cols: u16 },
    #[serde(rename = "ssh:disconnect")]
    SshDisconnect,
    /// The client is going away; the relay session ends
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(rename = "upload-start")]
    UploadStart {
        filename: String,
        total_size: u64,
        total_chunks: i64,
    },
    #[serde(rename = "upload-chunk")]
    UploadChunk {
        filename: String,
        content: String,
        chunk_index: i64,
        #[serde(default)]
        total_chunks: i64,
        #[serde(default)]
        size: u64,
    },
    #[serde(rename = "upload-complete")]
    UploadComplete { filename: String, total_size: u64 },
    #[serde(rename = "download-file")]
    DownloadFile { filepath: String },
    #[serde(rename = "ready-to-receive")]
    ReadyToReceive,
    /// Acknowledges one `file-chunk` of the active download
    #[serde(rename = "chunk-received")]
    ChunkReceived {
        chunk_index: u64,
        #[serde(default)]
        filename: Option<String>,
    },
}

/// Messages sent from the relay to the client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "ssh:ready")]
    SshReady,
    /// Terminal output
    #[serde(rename = "ssh:data")]
    SshData(String),
    #[serde(rename = "ssh:error")]
    SshError { message: String },
    #[serde(rename = "ssh:close")]
    SshClose,
    #[serde(rename = "upload-started")]
    UploadStarted { filename: String },
    /// Acknowledges one `upload-chunk`, keyed by index
    #[serde(rename = "chunk-received")]
    ChunkReceived { filename: String, chunk_index: u64 },
    #[serde(rename = "upload-success")]
    UploadSuccess { filename: String, size: u64 },
    #[serde(rename = "upload-error")]
    UploadError { message: String },
    #[serde(rename = "file-info")]
    FileInfo {
        filename: String,
        size: u64,
        total_chunks: u64,
    },
    #[serde(rename = "file-chunk")]
    FileChunk {
        chunk_index: u64,
        content: String,
        is_last: bool,
    },
    #[serde(rename = "download-error")]
    DownloadError { message: String },
}

impl ServerEvent {
    /// Event name as it appears on the wire, for logging
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::SshReady => "ssh:ready",
            ServerEvent::SshData(_) => "ssh:data",
            ServerEvent::SshError { .. } => "ssh:error",
            ServerEvent::SshClose => "ssh:close",
            ServerEvent::UploadStarted { .. } => "upload-started",
            ServerEvent::ChunkReceived { .. } => "chunk-received",
            ServerEvent::UploadSuccess { .. } => "upload-success",
            ServerEvent::UploadError { .. } => "upload-error",
            ServerEvent::FileInfo { .. } => "file-info",
            ServerEvent::FileChunk { .. } => "file-chunk",
            ServerEvent::DownloadError { .. } => "download-error",
        }
    }
}
