//! Server-side accumulation of chunked uploads
//!
//! Each upload owns a fixed slot array sized from the client's declared chunk
//! count. Chunks are written by index, so arrival order and replays do not
//! matter; the file is only assembled once the client signals completion.

use std::collections::HashMap;

use crate::codec;
use crate::error::TransferError;

/// One in-flight upload
#[derive(Debug)]
pub struct UploadSession {
    filename: String,
    declared_size: u64,
    slots: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl UploadSession {
    pub fn new(
        filename: impl Into<String>,
        declared_size: u64,
        total_chunks: i64,
        max_chunks: u64,
    ) -> Result<Self, TransferError> {
        if total_chunks <= 0 {
            return Err(TransferError::InvalidChunkCount(total_chunks));
        }
        if total_chunks as u64 > max_chunks {
            return Err(TransferError::TooManyChunks {
                declared: total_chunks,
                limit: max_chunks,
            });
        }

        Ok(Self {
            filename: filename.into(),
            declared_size,
            slots: vec![None; total_chunks as usize],
            received: 0,
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn total_chunks(&self) -> usize {
        self.slots.len()
    }

    /// Number of distinct slots filled so far
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn is_filled(&self) -> bool {
        self.received == self.slots.len()
    }

    /// Stores `bytes` at `index`, overwriting any earlier delivery of the same chunk.
    pub fn store(&mut self, index: i64, bytes: Vec<u8>) -> Result<(), TransferError> {
        let total = self.slots.len();
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| self.slots.get_mut(i))
            .ok_or(TransferError::ChunkOutOfRange { index, total })?;

        if slot.replace(bytes).is_none() {
            self.received += 1;
        }
        Ok(())
    }

    /// Concatenates the slots in index order and checks the result against `expected_size`.
    pub fn assemble(self, expected_size: u64) -> Result<Vec<u8>, TransferError> {
        if let Some(index) = self.slots.iter().position(Option::is_none) {
            return Err(TransferError::MissingChunk {
                filename: self.filename,
                index,
            });
        }

        let actual: u64 = self.slots.iter().flatten().map(|c| c.len() as u64).sum();
        if actual != expected_size {
            return Err(TransferError::SizeMismatch {
                expected: expected_size,
                actual,
            });
        }

        let mut buffer = Vec::with_capacity(actual as usize);
        for chunk in self.slots.into_iter().flatten() {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer)
    }
}

/// Uploads open at once in one registry unless configured otherwise
pub const DEFAULT_MAX_PENDING: usize = 16;

/// Uploads owned by one relay session, keyed by filename
#[derive(Debug)]
pub struct UploadRegistry {
    sessions: HashMap<String, UploadSession>,
    max_chunks: u64,
    max_pending: usize,
}

impl UploadRegistry {
    pub fn new(max_chunks: u64) -> Self {
        Self {
            sessions: HashMap::new(),
            max_chunks,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Opens an upload. A second start for the same filename replaces the first.
    ///
    /// New filenames are refused once `max_pending` uploads are open.
    pub fn start(&mut self, filename: &str, total_size: u64, total_chunks: i64) -> Result<(), TransferError> {
        if !self.sessions.contains_key(filename) && self.sessions.len() >= self.max_pending {
            return Err(TransferError::TooManyUploads(self.max_pending));
        }
        let session = UploadSession::new(filename, total_size, total_chunks, self.max_chunks)?;
        if self.sessions.insert(filename.to_string(), session).is_some() {
            tracing::warn!(filename = %filename, "Upload restarted, discarding earlier chunks");
        }
        Ok(())
    }

    /// Decodes and stores one chunk. The session is left in place on failure.
    pub fn store_chunk(&mut self, filename: &str, chunk_index: i64, content: &str) -> Result<(), TransferError> {
        let session = self
            .sessions
            .get_mut(filename)
            .ok_or_else(|| TransferError::SessionNotFound(filename.to_string()))?;
        let bytes = codec::decode_chunk(content)?;
        session.store(chunk_index, bytes)
    }

    /// Removes the upload and assembles it. The session is gone whatever the outcome.
    pub fn complete(&mut self, filename: &str, total_size: u64) -> Result<Vec<u8>, TransferError> {
        let session = self
            .sessions
            .remove(filename)
            .ok_or_else(|| TransferError::SessionNotFound(filename.to_string()))?;
        if session.declared_size() != total_size {
            tracing::debug!(
                filename = %filename,
                declared = session.declared_size(),
                total_size,
                "Completion size differs from the size declared at start"
            );
        }
        session.assemble(total_size)
    }

    pub fn get(&self, filename: &str) -> Option<&UploadSession> {
        self.sessions.get(filename)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drops every pending upload and returns how many there were.
    pub fn clear(&mut self) -> usize {
        let dropped = self.sessions.len();
        self.sessions.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_chunk;

    const LIMIT: u64 = 1 << 20;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_rejects_non_positive_chunk_count() {
        let mut registry = UploadRegistry::new(LIMIT);
        assert!(matches!(
            registry.start("a.bin", 0, 0),
            Err(TransferError::InvalidChunkCount(0))
        ));
        assert!(registry.start("a.bin", 0, -3).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_caps_open_uploads() {
        let mut registry = UploadRegistry::new(LIMIT).with_max_pending(2);
        registry.start("a.bin", 3, 1).unwrap();
        registry.start("b.bin", 3, 1).unwrap();

        assert!(matches!(
            registry.start("c.bin", 3, 1),
            Err(TransferError::TooManyUploads(2))
        ));
        // restarting an open upload does not count against the cap
        registry.start("a.bin", 6, 2).unwrap();
        assert_eq!(registry.len(), 2);

        registry.store_chunk("b.bin", 0, &encode_chunk(b"abc")).unwrap();
        registry.complete("b.bin", 3).unwrap();
        registry.start("c.bin", 3, 1).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_rejects_oversized_chunk_count() {
        let mut registry = UploadRegistry::new(8);
        assert!(matches!(
            registry.start("a.bin", 100, 9),
            Err(TransferError::TooManyChunks { declared: 9, limit: 8 })
        ));
    }

    #[test]
    fn test_reverse_order_assembly() {
        let data = sample(12 * 1024 * 1024);
        let chunk_size = 64 * 1024;
        let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();
        assert_eq!(chunks.len(), 192);

        let mut registry = UploadRegistry::new(LIMIT);
        registry.start("big.bin", data.len() as u64, chunks.len() as i64).unwrap();
        for (index, chunk) in chunks.iter().enumerate().rev() {
            registry.store_chunk("big.bin", index as i64, &encode_chunk(chunk)).unwrap();
        }
        assert!(registry.get("big.bin").unwrap().is_filled());

        let assembled = registry.complete("big.bin", data.len() as u64).unwrap();
        assert_eq!(assembled, data);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_replayed_chunk_overwrites_slot() {
        let mut session = UploadSession::new("a.bin", 6, 2, LIMIT).unwrap();
        session.store(1, b"def".to_vec()).unwrap();
        session.store(1, b"def".to_vec()).unwrap();
        assert_eq!(session.received(), 1);
        session.store(0, b"abc".to_vec()).unwrap();
        assert_eq!(session.received(), 2);
        assert_eq!(session.assemble(6).unwrap(), b"abcdef");
    }

    #[test]
    fn test_out_of_range_chunk_keeps_session() {
        let mut registry = UploadRegistry::new(LIMIT);
        registry.start("a.bin", 3, 1).unwrap();
        assert!(matches!(
            registry.store_chunk("a.bin", 1, &encode_chunk(b"abc")),
            Err(TransferError::ChunkOutOfRange { index: 1, total: 1 })
        ));
        assert!(registry.store_chunk("a.bin", -1, &encode_chunk(b"abc")).is_err());
        registry.store_chunk("a.bin", 0, &encode_chunk(b"abc")).unwrap();
        assert_eq!(registry.complete("a.bin", 3).unwrap(), b"abc");
    }

    #[test]
    fn test_chunk_without_session() {
        let mut registry = UploadRegistry::new(LIMIT);
        assert!(matches!(
            registry.store_chunk("ghost.bin", 0, "AAAA"),
            Err(TransferError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_size_mismatch_discards_session() {
        let mut registry = UploadRegistry::new(LIMIT);
        registry.start("a.bin", 4, 1).unwrap();
        registry.store_chunk("a.bin", 0, &encode_chunk(b"abc")).unwrap();
        assert!(matches!(
            registry.complete("a.bin", 4),
            Err(TransferError::SizeMismatch { expected: 4, actual: 3 })
        ));
        assert!(registry.get("a.bin").is_none());
    }

    #[test]
    fn test_missing_chunk_fails_completion() {
        let mut registry = UploadRegistry::new(LIMIT);
        registry.start("a.bin", 6, 2).unwrap();
        registry.store_chunk("a.bin", 1, &encode_chunk(b"def")).unwrap();
        assert!(matches!(
            registry.complete("a.bin", 6),
            Err(TransferError::MissingChunk { index: 0, .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_zero_byte_upload() {
        let mut registry = UploadRegistry::new(LIMIT);
        registry.start("empty.txt", 0, 1).unwrap();
        registry.store_chunk("empty.txt", 0, "").unwrap();
        assert_eq!(registry.complete("empty.txt", 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_restart_replaces_buffer() {
        let mut registry = UploadRegistry::new(LIMIT);
        registry.start("a.bin", 3, 1).unwrap();
        registry.store_chunk("a.bin", 0, &encode_chunk(b"old")).unwrap();
        registry.start("a.bin", 3, 1).unwrap();
        assert_eq!(registry.get("a.bin").unwrap().received(), 0);
        assert_eq!(registry.len(), 1);
    }
}
