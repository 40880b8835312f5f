//! In-memory transport used by the relay tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    Connector, FileKind, PtySize, RemoteFs, RemoteHost, RemoteStat, ShellChannel, ShellInput,
    ShellOutput,
};
use crate::error::TransportError;
use crate::protocol::Credentials;

/// Test-side ends of a shell opened on a [`MemoryHost`]
pub(crate) struct ShellProbe {
    pub size: PtySize,
    pub input: mpsc::UnboundedReceiver<ShellInput>,
    pub output: mpsc::Sender<ShellOutput>,
}

#[derive(Default)]
pub(crate) struct MemoryFs {
    files: Mutex<HashMap<String, Vec<u8>>>,
    dirs: Mutex<HashSet<String>>,
    fail_writes: AtomicBool,
    reads: AtomicUsize,
}

impl MemoryFs {
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteFs for MemoryFs {
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>, TransportError> {
        if self.dirs.lock().unwrap().contains(path) {
            return Ok(Some(RemoteStat { kind: FileKind::Directory, size: 4096 }));
        }
        Ok(self.files.lock().unwrap().get(path).map(|bytes| RemoteStat {
            kind: FileKind::Regular,
            size: bytes.len() as u64,
        }))
    }

    async fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, TransportError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let files = self.files.lock().unwrap();
        let bytes = files
            .get(path)
            .ok_or_else(|| TransportError::Sftp(format!("no such file: {}", path)))?;
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(len).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Sftp("Permission denied".to_string()));
        }
        self.files.lock().unwrap().insert(path.to_string(), contents.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemoryHost {
    pub fs: Arc<MemoryFs>,
    fail_shell: AtomicBool,
    shell: Mutex<Option<ShellProbe>>,
    closes: AtomicUsize,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, contents: Vec<u8>) -> Self {
        self.fs.files.lock().unwrap().insert(path.to_string(), contents);
        self
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.fs.dirs.lock().unwrap().insert(path.to_string());
        self
    }

    pub fn failing_shell(self) -> Self {
        self.fail_shell.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_writes(self) -> Self {
        self.fs.fail_writes.store(true, Ordering::SeqCst);
        self
    }

    pub fn take_shell(&self) -> Option<ShellProbe> {
        self.shell.lock().unwrap().take()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteHost for MemoryHost {
    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, TransportError> {
        if self.fail_shell.load(Ordering::SeqCst) {
            return Err(TransportError::Shell("server refused pty request".to_string()));
        }
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(64);
        *self.shell.lock().unwrap() = Some(ShellProbe {
            size,
            input: input_rx,
            output: output_tx,
        });
        Ok(ShellChannel {
            input: input_tx,
            output: output_rx,
        })
    }

    async fn open_fs(&self) -> Result<Arc<dyn RemoteFs>, TransportError> {
        let fs: Arc<dyn RemoteFs> = self.fs.clone();
        Ok(fs)
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out the same [`MemoryHost`] on every successful connect
pub(crate) struct MemoryConnector {
    pub host: Arc<MemoryHost>,
    refuse: bool,
}

impl MemoryConnector {
    pub fn new(host: MemoryHost) -> Self {
        Self {
            host: Arc::new(host),
            refuse: false,
        }
    }

    pub fn refusing() -> Self {
        Self {
            host: Arc::new(MemoryHost::new()),
            refuse: true,
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteHost>, TransportError> {
        if self.refuse {
            return Err(TransportError::Connect {
                host: credentials.host.clone(),
                port: credentials.port,
                reason: "Connection refused".to_string(),
            });
        }
        let host: Arc<dyn RemoteHost> = self.host.clone();
        Ok(host)
    }
}
